//! Shared handle to the replicated notebook document.
//!
//! One `yrs` doc per monitor process, wrapped in the awareness lock the sync
//! layer also uses. All transactions are created under that lock: read
//! transactions under the read guard, mutable transactions under the write
//! guard, so doc access never interleaves across tasks.

use std::sync::{Arc, RwLock};

use y_sync::awareness::Awareness;
use yrs::{Doc, MapRef, OffsetKind, Options, TextRef};

use crate::model::execution::PeerId;

/// Root shared map holding execution records, keyed by execution id.
pub const EXECUTIONS_MAP: &str = "executions";
/// Root shared text holding the notebook body.
pub const CONTENT_TEXT: &str = "content";

/// Transaction origin for writes made by this process.
pub const LOCAL_ORIGIN: &str = "mrmd-monitor";
/// Transaction origin for updates applied from the sync server; the
/// transport skips forwarding these back out.
pub const REMOTE_ORIGIN: &str = "sync-remote";

/// The executions map, resolved against the doc a transaction will use.
pub fn executions_ref(doc: &Doc) -> MapRef {
    doc.get_or_insert_map(EXECUTIONS_MAP)
}

/// The notebook body text, resolved against the doc a transaction will use.
pub fn content_ref(doc: &Doc) -> TextRef {
    doc.get_or_insert_text(CONTENT_TEXT)
}

#[derive(Clone)]
pub struct Notebook {
    awareness: Arc<RwLock<Awareness>>,
    doc: Doc,
    client_id: PeerId,
}

impl Notebook {
    pub fn new() -> Self {
        Self::from_doc(Doc::with_options(Options {
            offset_kind: OffsetKind::Bytes,
            ..Default::default()
        }))
    }

    /// A notebook with a fixed client id. Tests use this to stand up
    /// multiple peers with known identities.
    pub fn with_client_id(client_id: PeerId) -> Self {
        Self::from_doc(Doc::with_options(Options {
            client_id,
            offset_kind: OffsetKind::Bytes,
            ..Default::default()
        }))
    }

    pub fn from_doc(doc: Doc) -> Self {
        // Materialize the root types up front so every peer converges on
        // the same schema regardless of who writes first.
        let _ = executions_ref(&doc);
        let _ = content_ref(&doc);
        let client_id = doc.client_id();
        let awareness = Arc::new(RwLock::new(Awareness::new(doc.clone())));
        Self {
            awareness,
            doc,
            client_id,
        }
    }

    pub fn client_id(&self) -> PeerId {
        self.client_id
    }

    pub fn awareness(&self) -> Arc<RwLock<Awareness>> {
        self.awareness.clone()
    }

    /// Run a closure with shared (read) access to the doc. The closure may
    /// open read transactions only.
    pub fn with_doc<R>(&self, f: impl FnOnce(&Doc) -> R) -> R {
        let _guard = self.awareness.read().unwrap();
        f(&self.doc)
    }

    /// Run a closure with exclusive access to the doc; required for any
    /// mutable transaction.
    pub fn with_doc_mut<R>(&self, f: impl FnOnce(&Doc) -> R) -> R {
        let _guard = self.awareness.write().unwrap();
        f(&self.doc)
    }
}

impl Default for Notebook {
    fn default() -> Self {
        Self::new()
    }
}
