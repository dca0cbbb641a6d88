//! Headless collaborative execution monitor.
//!
//! The monitor joins a CRDT-replicated notebook document as an equal peer,
//! claims execution requests published by browser editors, drives them
//! against remote language runtimes, and streams the projected output back
//! into the shared document. A browser tab may disappear mid-run; the
//! execution keeps going and its output keeps accruing exactly as if the
//! tab had stayed connected.

pub mod coordination;
pub mod document;
pub mod model;
pub mod monitor;
pub mod notebook;
pub mod runtime;
pub mod telemetry;
pub mod terminal;
pub mod transport;
