//! Plain-text projection of a terminal byte stream.
//!
//! Runtimes emit progress bars and cursor-addressed rewrites; replicating
//! that raw stream into a shared document would grow it without bound. The
//! projector reduces the stream to the visible screen instead, so every
//! rewrite of the same line converges to one bounded edit.

mod projector;
mod screen;

pub use projector::TerminalProjector;
pub use screen::Screen;
