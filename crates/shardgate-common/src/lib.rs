//! Shardgate Common Types
//!
//! This crate provides the protocol definitions shared by every shardgate
//! component: the documents, namespaces and operations a client sends to the
//! router, the replies the router frames, the error taxonomy, and the
//! authorization and legacy last-error interfaces.
//!
//! # Overview
//!
//! Shardgate is the request router of a horizontally partitioned document
//! database. Clients speak a legacy opcode-based protocol (query, get-more,
//! kill-cursors, insert/update/delete, and commands expressed as queries on a
//! `<db>.$cmd` namespace). The byte encoding of that protocol lives outside
//! this workspace; these types are what the encoder hands to the router.
//!
//! # Components
//!
//! - [`protocol`] - Documents, namespaces, operations, replies and errors
//! - [`auth`] - Authorization decisions and audit logging interfaces
//! - [`last_error`] - Connection-scoped legacy last-error state
//!
//! # Example
//!
//! ```
//! use shardgate_common::{Namespace, QueryMessage, Reply};
//! use serde_json::json;
//!
//! let ns = Namespace::new("app.users");
//! assert_eq!(ns.db(), "app");
//! assert_eq!(ns.coll(), "users");
//!
//! let msg = QueryMessage::new(ns, shardgate_common::protocol::document::from_value(json!({"age": 30})));
//! assert_eq!(msg.n_to_return, 0);
//!
//! let reply = Reply::cursor_not_found();
//! assert_eq!(reply.n_returned(), 0);
//! ```

pub mod auth;
pub mod last_error;
pub mod protocol;

pub use protocol::*;
