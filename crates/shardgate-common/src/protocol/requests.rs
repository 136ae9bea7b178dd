//! Inbound operations
//!
//! These are the already-decoded forms of the legacy opcodes a client sends.
//! Commands are not a separate opcode: they arrive as a [`QueryMessage`] on a
//! `<db>.$cmd` namespace with `n_to_return` of 1 (or -1).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::document::{self, Document};
use super::error::{Result, ShardgateError};
use super::Namespace;

/// Server-side cursor identifier. Zero means "no cursor".
pub type CursorId = i64;

const MAX_TIME_MS_FIELD: &str = "$maxTimeMS";

/// Legacy wire opcodes, used to label operations in logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl OpCode {
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::Reply => "reply",
            OpCode::Update => "update",
            OpCode::Insert => "insert",
            OpCode::Query => "query",
            OpCode::GetMore => "getmore",
            OpCode::Delete => "delete",
            OpCode::KillCursors => "killcursors",
        }
    }
}

bitflags::bitflags! {
    /// Query option flags carried in the query message header.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct QueryOptions: u32 {
        const TAILABLE = 1 << 1;
        const SLAVE_OK = 1 << 2;
        const NO_CURSOR_TIMEOUT = 1 << 4;
        const AWAIT_DATA = 1 << 5;
        const EXHAUST = 1 << 6;
        const PARTIAL = 1 << 7;
    }
}

/// A decoded query message, the inbound form of both queries and commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMessage {
    pub ns: Namespace,
    pub n_to_skip: i32,
    pub n_to_return: i32,
    pub query: Document,
    pub fields: Option<Document>,
    pub options: QueryOptions,
}

impl QueryMessage {
    pub fn new(ns: impl Into<Namespace>, query: Document) -> Self {
        QueryMessage {
            ns: ns.into(),
            n_to_skip: 0,
            n_to_return: 0,
            query,
            fields: None,
            options: QueryOptions::empty(),
        }
    }

    /// Builds a command message: a query on `<db>.$cmd` returning one document.
    pub fn command(db: &str, command: Document) -> Self {
        QueryMessage::new(Namespace::from_parts(db, "$cmd"), command).with_n_to_return(1)
    }

    pub fn with_n_to_return(mut self, n_to_return: i32) -> Self {
        self.n_to_return = n_to_return;
        self
    }

    pub fn with_skip(mut self, n_to_skip: i32) -> Self {
        self.n_to_skip = n_to_skip;
        self
    }

    pub fn with_fields(mut self, fields: Document) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

/// Immutable description of one query operation.
///
/// Built once per query from a [`QueryMessage`]; building it validates the
/// `$maxTimeMS` hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub ns: Namespace,
    /// The query document as sent, possibly wrapped as `{$query: ..., $explain: ...}`.
    pub query: Document,
    pub fields: Document,
    pub n_to_skip: i32,
    pub n_to_return: i32,
    pub options: QueryOptions,
    /// Duration hint in milliseconds; `None` means no limit.
    pub max_time_ms: Option<u64>,
}

impl QuerySpec {
    pub fn from_message(msg: &QueryMessage) -> Result<Self> {
        let max_time_ms = parse_max_time_ms(&msg.query)?;
        Ok(QuerySpec {
            ns: msg.ns.clone(),
            query: msg.query.clone(),
            fields: msg.fields.clone().unwrap_or_default(),
            n_to_skip: msg.n_to_skip,
            n_to_return: msg.n_to_return,
            options: msg.options,
            max_time_ms,
        })
    }

    /// Spec for running `command` against `<db>.$cmd` on every targeted shard.
    pub fn command(db: &str, command: Document, options: QueryOptions) -> Self {
        QuerySpec {
            ns: Namespace::from_parts(db, "$cmd"),
            query: command,
            fields: Document::new(),
            n_to_skip: 0,
            n_to_return: 1,
            options,
            max_time_ms: None,
        }
    }

    /// The selector, unwrapped from `query` / `$query` when present.
    pub fn filter(&self) -> &Document {
        ["$query", "query"]
            .iter()
            .find_map(|key| document::get_document(&self.query, key))
            .unwrap_or(&self.query)
    }

    pub fn is_explain(&self) -> bool {
        document::is_truthy(&self.query, "$explain")
    }
}

/// Parses the `$maxTimeMS` hint from a query document.
///
/// Returns `None` when the field is absent or zero (zero means "no limit").
/// The value must be an integral number in `0..=i32::MAX`.
pub fn parse_max_time_ms(query: &Document) -> Result<Option<u64>> {
    let value = match query.get(MAX_TIME_MS_FIELD) {
        None => return Ok(None),
        Some(value) => value,
    };

    let n = match value {
        Value::Number(n) => n,
        _ => {
            return Err(ShardgateError::InvalidArgument(format!(
                "{} must be a number",
                MAX_TIME_MS_FIELD
            )))
        }
    };

    let millis = match n.as_i64() {
        Some(i) => i,
        None => {
            let f = n.as_f64().unwrap_or(f64::NAN);
            if f.fract() != 0.0 || !f.is_finite() {
                return Err(ShardgateError::InvalidArgument(format!(
                    "{} has non-integral value",
                    MAX_TIME_MS_FIELD
                )));
            }
            f as i64
        }
    };

    if millis < 0 || millis > i64::from(i32::MAX) {
        return Err(ShardgateError::InvalidArgument(format!(
            "{} is out of range",
            MAX_TIME_MS_FIELD
        )));
    }

    Ok(if millis == 0 { None } else { Some(millis as u64) })
}

/// Continuation of a previously returned cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMoreMessage {
    pub ns: Namespace,
    pub n_to_return: i32,
    pub cursor_id: CursorId,
}

impl GetMoreMessage {
    pub fn new(ns: impl Into<Namespace>, cursor_id: CursorId, n_to_return: i32) -> Self {
        GetMoreMessage {
            ns: ns.into(),
            n_to_return,
            cursor_id,
        }
    }
}

/// Explicit client request to close cursors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillCursorsMessage {
    pub cursor_ids: Vec<CursorId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteOpKind {
    Insert,
    Update,
    Delete,
}

impl WriteOpKind {
    /// Name of the write command, also its first field.
    pub fn command_name(&self) -> &'static str {
        match self {
            WriteOpKind::Insert => "insert",
            WriteOpKind::Update => "update",
            WriteOpKind::Delete => "delete",
        }
    }

    /// Field carrying the sub-operation array in the write command.
    pub fn items_field(&self) -> &'static str {
        match self {
            WriteOpKind::Insert => "documents",
            WriteOpKind::Update => "updates",
            WriteOpKind::Delete => "deletes",
        }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            WriteOpKind::Insert => OpCode::Insert,
            WriteOpKind::Update => OpCode::Update,
            WriteOpKind::Delete => OpCode::Delete,
        }
    }
}

/// One write sub-operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    Insert {
        document: Document,
    },
    Update {
        selector: Document,
        update: Document,
        upsert: bool,
        multi: bool,
    },
    Delete {
        selector: Document,
        /// 0 removes every match, 1 removes one.
        limit: u32,
    },
}

impl WriteOp {
    pub fn kind(&self) -> WriteOpKind {
        match self {
            WriteOp::Insert { .. } => WriteOpKind::Insert,
            WriteOp::Update { .. } => WriteOpKind::Update,
            WriteOp::Delete { .. } => WriteOpKind::Delete,
        }
    }

    /// The element this operation contributes to its write command's array.
    pub fn to_command_item(&self) -> Value {
        match self {
            WriteOp::Insert { document } => Value::Object(document.clone()),
            WriteOp::Update {
                selector,
                update,
                upsert,
                multi,
            } => json!({"q": selector, "u": update, "upsert": upsert, "multi": multi}),
            WriteOp::Delete { selector, limit } => json!({"q": selector, "limit": limit}),
        }
    }
}

/// A write request for one namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub ns: Namespace,
    pub ordered: bool,
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new(ns: impl Into<Namespace>, ordered: bool, ops: Vec<WriteOp>) -> Self {
        WriteBatch {
            ns: ns.into(),
            ordered,
            ops,
        }
    }

    /// Opcode of the legacy message this batch came from.
    pub fn op_code(&self) -> OpCode {
        self.ops
            .first()
            .map(|op| op.kind().op_code())
            .unwrap_or(OpCode::Insert)
    }
}

/// A decoded inbound operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Query(QueryMessage),
    GetMore(GetMoreMessage),
    KillCursors(KillCursorsMessage),
    Write(WriteBatch),
}

impl Operation {
    pub fn op_code(&self) -> OpCode {
        match self {
            Operation::Query(_) => OpCode::Query,
            Operation::GetMore(_) => OpCode::GetMore,
            Operation::KillCursors(_) => OpCode::KillCursors,
            Operation::Write(batch) => batch.op_code(),
        }
    }
}
