//! Legacy last-error state
//!
//! Older clients issue a write and then ask the server what happened to it
//! with a separate command. The router answers that from a [`LastError`]
//! owned by the client connection and repopulated after every write
//! sub-request.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::protocol::Document;

/// Connection-scoped record of the most recent write's outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    /// Error code of the last write, 0 when it succeeded.
    pub code: i32,
    pub err_msg: Option<String>,
    /// Documents affected by the last update or delete.
    pub n: i64,
    /// `Some` only after an update.
    pub updated_existing: Option<bool>,
    /// `_id` of the document created by the last upsert.
    pub upserted: Option<Value>,
    /// Requests started since the state was last reset.
    pub n_prev: u32,
    /// Set while a write runs through the command path. Nothing is recorded
    /// while it is set.
    pub disabled: bool,
    /// Whether anything has been recorded since the last reset.
    pub valid: bool,
}

impl LastError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the recorded outcome. The disabled flag is left untouched.
    pub fn reset(&mut self) {
        let disabled = self.disabled;
        *self = LastError {
            n_prev: 1,
            disabled,
            ..LastError::default()
        };
    }

    /// Marks the start of another request on the same connection.
    pub fn start_request(&mut self) {
        self.n_prev = self.n_prev.saturating_add(1);
        self.valid = false;
    }

    pub fn raise_error(&mut self, code: i32, err_msg: impl Into<String>) {
        if self.disabled {
            return;
        }
        self.valid = true;
        self.code = code;
        self.err_msg = Some(err_msg.into());
        self.n_prev = 1;
    }

    pub fn record_update(&mut self, updated_existing: bool, n: i64, upserted: Option<Value>) {
        if self.disabled {
            return;
        }
        self.valid = true;
        self.updated_existing = Some(updated_existing);
        self.n = n;
        self.upserted = upserted;
        self.n_prev = 1;
    }

    pub fn record_delete(&mut self, n: i64) {
        if self.disabled {
            return;
        }
        self.valid = true;
        self.n = n;
        self.n_prev = 1;
    }

    pub fn had_error(&self) -> bool {
        self.valid && self.code != 0
    }

    /// Suspends tracking until the returned guard is dropped.
    pub fn disable(&mut self) -> DisabledLastError<'_> {
        let was_disabled = self.disabled;
        self.disabled = true;
        DisabledLastError {
            inner: self,
            was_disabled,
        }
    }

    /// The document a `getLastError` request reports.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("ok".into(), json!(1));
        doc.insert(
            "err".into(),
            self.err_msg.clone().map(Value::String).unwrap_or(Value::Null),
        );
        if self.code != 0 {
            doc.insert("code".into(), json!(self.code));
        }
        doc.insert("n".into(), json!(self.n));
        if let Some(updated_existing) = self.updated_existing {
            doc.insert("updatedExisting".into(), json!(updated_existing));
        }
        if let Some(upserted) = &self.upserted {
            doc.insert("upserted".into(), upserted.clone());
        }
        doc
    }
}

/// Guard returned by [`LastError::disable`].
pub struct DisabledLastError<'a> {
    inner: &'a mut LastError,
    was_disabled: bool,
}

impl Deref for DisabledLastError<'_> {
    type Target = LastError;

    fn deref(&self) -> &LastError {
        self.inner
    }
}

impl DerefMut for DisabledLastError<'_> {
    fn deref_mut(&mut self) -> &mut LastError {
        self.inner
    }
}

impl Drop for DisabledLastError<'_> {
    fn drop(&mut self) {
        self.inner.disabled = self.was_disabled;
    }
}
