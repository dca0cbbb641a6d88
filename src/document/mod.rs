//! Editing of fenced output regions inside the shared notebook text.
//!
//! A region is addressed by execution id through its opening marker line
//! `` ```output:<execId> `` and closed by a ``` ``` `` fence at the start of
//! a line. The browser creates and tears down regions; the claiming monitor
//! only rewrites the content between the fences. Region lookup is a string
//! search over the current snapshot; the durable anchor is a serialized
//! sticky position the CRDT keeps valid across concurrent edits.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::{debug, warn};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Assoc, GetString, IndexedSequence, StickyIndex, Text, Transact};

use crate::notebook::{content_ref, Notebook, LOCAL_ORIGIN};

/// Byte offsets of one output region within the text snapshot it was
/// located in. `content_*` bound the span strictly between the newline
/// after the opening marker and the first backtick of the closing fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputBlock {
    pub marker_start: usize,
    pub content_start: usize,
    pub content_end: usize,
}

/// Writer bound to one notebook's shared text.
#[derive(Clone)]
pub struct DocumentWriter {
    notebook: Notebook,
}

impl DocumentWriter {
    pub fn new(notebook: Notebook) -> Self {
        Self { notebook }
    }

    pub fn find_output_block(&self, exec_id: &str) -> Option<OutputBlock> {
        let snapshot = self.snapshot();
        locate_output_block(&snapshot, exec_id)
    }

    pub fn has_output_block(&self, exec_id: &str) -> bool {
        self.find_output_block(exec_id).is_some()
    }

    pub fn output_content(&self, exec_id: &str) -> Option<String> {
        let snapshot = self.snapshot();
        let block = locate_output_block(&snapshot, exec_id)?;
        Some(snapshot[block.content_start..block.content_end].to_string())
    }

    /// Insert `content` at the end of the region. Returns false when no
    /// region for `exec_id` exists.
    pub fn append_output(&self, exec_id: &str, content: &str) -> bool {
        self.notebook.with_doc_mut(|doc| {
            let text = content_ref(doc);
            let mut txn = doc.transact_mut_with(LOCAL_ORIGIN);
            let snapshot = text.get_string(&txn);
            let Some(block) = locate_output_block(&snapshot, exec_id) else {
                warn!(exec_id, "append skipped: output block not found");
                return false;
            };
            text.insert(&mut txn, block.content_end as u32, content);
            true
        })
    }

    /// Replace the whole region content. Delete and insert share one
    /// transaction, so peers never observe the intermediate empty region.
    pub fn replace_output(&self, exec_id: &str, content: &str) -> bool {
        self.notebook.with_doc_mut(|doc| {
            let text = content_ref(doc);
            let mut txn = doc.transact_mut_with(LOCAL_ORIGIN);
            let snapshot = text.get_string(&txn);
            let Some(block) = locate_output_block(&snapshot, exec_id) else {
                warn!(exec_id, "replace skipped: output block not found");
                return false;
            };
            let len = (block.content_end - block.content_start) as u32;
            if len > 0 {
                text.remove_range(&mut txn, block.content_start as u32, len);
            }
            if !content.is_empty() {
                text.insert(&mut txn, block.content_start as u32, content);
            }
            true
        })
    }

    /// A serialized logical position anchored at the region's content
    /// start, stable under concurrent edits elsewhere in the text.
    pub fn create_output_position(&self, exec_id: &str) -> Option<String> {
        self.notebook.with_doc_mut(|doc| {
            let text = content_ref(doc);
            let mut txn = doc.transact_mut_with(LOCAL_ORIGIN);
            let snapshot = text.get_string(&txn);
            let block = locate_output_block(&snapshot, exec_id)?;
            let sticky = text.sticky_index(&mut txn, block.content_start as u32, Assoc::After)?;
            Some(BASE64.encode(sticky.encode_v1()))
        })
    }

    /// Resolve a stored logical position back to a current absolute index,
    /// or None once its anchor has been removed.
    pub fn absolute_position(&self, position: &str) -> Option<usize> {
        let bytes = match BASE64.decode(position) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(%err, "stored output position is not valid base64");
                return None;
            }
        };
        let sticky = match StickyIndex::decode_v1(&bytes) {
            Ok(sticky) => sticky,
            Err(_) => {
                debug!("stored output position failed to decode");
                return None;
            }
        };
        self.notebook.with_doc(|doc| {
            let txn = doc.transact();
            sticky.get_offset(&txn).map(|offset| offset.index as usize)
        })
    }

    fn snapshot(&self) -> String {
        self.notebook.with_doc(|doc| {
            let text = content_ref(doc);
            let txn = doc.transact();
            text.get_string(&txn)
        })
    }
}

/// The opening marker line for an execution id.
pub fn output_marker(exec_id: &str) -> String {
    format!("```output:{exec_id}")
}

fn locate_output_block(snapshot: &str, exec_id: &str) -> Option<OutputBlock> {
    let marker = output_marker(exec_id);
    let marker_start = find_marker_line(snapshot, &marker)?;

    let after_marker = marker_start + marker.len();
    let content_start = if after_marker < snapshot.len() {
        after_marker + 1
    } else {
        snapshot.len()
    };
    let content_end = find_closing_fence(snapshot, content_start).unwrap_or(snapshot.len());
    Some(OutputBlock {
        marker_start,
        content_start,
        content_end,
    })
}

/// First position where `marker` occupies a whole line: preceded by start
/// of text or `\n`, followed by `\n` or end of text. The trailing check
/// keeps `output:exec-1` from matching `output:exec-10`.
fn find_marker_line(snapshot: &str, marker: &str) -> Option<usize> {
    let bytes = snapshot.as_bytes();
    let mut search = 0;
    while let Some(found) = snapshot[search..].find(marker) {
        let idx = search + found;
        let at_line_start = idx == 0 || bytes[idx - 1] == b'\n';
        let after = idx + marker.len();
        let at_line_end = after >= snapshot.len() || bytes[after] == b'\n';
        if at_line_start && at_line_end {
            return Some(idx);
        }
        search = idx + marker.len();
    }
    None
}

fn find_closing_fence(snapshot: &str, from: usize) -> Option<usize> {
    let bytes = snapshot.as_bytes();
    let mut search = from.min(snapshot.len());
    while let Some(found) = snapshot[search..].find("```") {
        let idx = search + found;
        if idx == 0 || bytes[idx - 1] == b'\n' {
            return Some(idx);
        }
        search = idx + 1;
    }
    None
}
