pub mod document;
pub mod error;
pub mod namespace;
pub mod requests;
pub mod responses;


pub use document::Document;
pub use error::{Result, ShardgateError};
pub use namespace::Namespace;
pub use requests::{
    CursorId, GetMoreMessage, KillCursorsMessage, OpCode, Operation, QueryMessage, QueryOptions,
    QuerySpec, WriteBatch, WriteOp, WriteOpKind,
};
pub use responses::{Reply, ResultFlags};
