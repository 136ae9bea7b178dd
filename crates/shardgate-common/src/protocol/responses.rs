//! Shardgate Reply Types
//!
//! This module defines the reply frame the router hands back to the wire
//! layer, and the result-flags bitmask it carries.

use serde::{Deserialize, Serialize};

use super::requests::CursorId;
use super::Document;

bitflags::bitflags! {
    /// Result flags in the reply header.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ResultFlags: u32 {
        /// The get-more named a cursor the server does not know.
        const CURSOR_NOT_FOUND = 1;
        /// The single returned document is an `$err` document.
        const ERROR_SET = 1 << 1;
        /// The shard's partition version did not match the router's.
        const SHARD_CONFIG_STALE = 1 << 2;
        const AWAIT_CAPABLE = 1 << 3;
    }
}

/// A reply frame.
///
/// # Fields
///
/// - `flags`: result flags bitmask
/// - `cursor_id`: cursor to continue with, or 0 when the result is complete
/// - `starting_from`: offset of the first document within the cursor's result set
/// - `documents`: the batch
/// - `origin_host`: for replies relayed from a shard, the host that produced it
///
/// # Example
///
/// ```
/// use shardgate_common::protocol::responses::{Reply, ResultFlags};
/// use shardgate_common::protocol::document::from_value;
/// use serde_json::json;
///
/// let reply = Reply::single(from_value(json!({"ok": 1})));
/// assert_eq!(reply.cursor_id, 0);
/// assert_eq!(reply.n_returned(), 1);
///
/// let missing = Reply::cursor_not_found();
/// assert!(missing.flags.contains(ResultFlags::CURSOR_NOT_FOUND));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub flags: ResultFlags,
    pub cursor_id: CursorId,
    pub starting_from: i32,
    pub documents: Vec<Document>,
    pub origin_host: Option<String>,
}

impl Reply {
    /// A reply carrying one document and no cursor.
    pub fn single(document: Document) -> Self {
        Reply {
            flags: ResultFlags::empty(),
            cursor_id: 0,
            starting_from: 0,
            documents: vec![document],
            origin_host: None,
        }
    }

    /// A batch of a (possibly continuing) cursor.
    pub fn batch(documents: Vec<Document>, starting_from: i32, cursor_id: CursorId) -> Self {
        Reply {
            flags: ResultFlags::empty(),
            cursor_id,
            starting_from,
            documents,
            origin_host: None,
        }
    }

    pub fn cursor_not_found() -> Self {
        Reply {
            flags: ResultFlags::CURSOR_NOT_FOUND,
            cursor_id: 0,
            starting_from: 0,
            documents: Vec::new(),
            origin_host: None,
        }
    }

    pub fn with_origin_host(mut self, host: impl Into<String>) -> Self {
        self.origin_host = Some(host.into());
        self
    }

    pub fn with_flags(mut self, flags: ResultFlags) -> Self {
        self.flags = self.flags.union(flags);
        self
    }

    pub fn n_returned(&self) -> usize {
        self.documents.len()
    }

    pub fn has_cursor(&self) -> bool {
        self.cursor_id != 0
    }

    /// The first document, as returned by a command.
    pub fn first(&self) -> Option<&Document> {
        self.documents.first()
    }
}
