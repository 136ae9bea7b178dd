//! Collaborator interfaces
//!
//! The router does not resolve partition ownership, merge shard cursors, hold
//! connections or execute commands itself. It drives those through the traits
//! in this module, which the embedding process implements (and which
//! `shardgate-sim` implements in memory).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shardgate_common::protocol::error::Result;
use shardgate_common::{CursorId, Document, Namespace, QueryOptions, QuerySpec, Reply};
use std::collections::BTreeMap;
use std::fmt;

pub type ShardId = String;

/// A data-owning node (or replica set).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Shard {
    pub name: ShardId,
    /// Connection string, e.g. `host:port` or `rs0/host1:port,host2:port`.
    pub conn_string: String,
}

impl Shard {
    pub fn new(name: impl Into<ShardId>, conn_string: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conn_string: conn_string.into(),
        }
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.conn_string)
    }
}

/// Partition version a shard holds for one namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardVersion {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for ShardVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.major, self.minor)
    }
}

/// Which shards own a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerMap {
    /// Owning shards, iterated in name order.
    pub shards: BTreeMap<ShardId, ShardVersion>,
    pub partitioned: bool,
    /// The database's primary shard, home of unpartitioned collections.
    pub primary: ShardId,
}

impl OwnerMap {
    /// The one shard to ask about this namespace's metadata: the first
    /// owning shard when partitioned, otherwise the primary.
    pub fn metadata_shard(&self) -> &ShardId {
        if self.partitioned {
            if let Some(first) = self.shards.keys().next() {
                return first;
            }
        }
        &self.primary
    }
}

/// Documents pulled from a merged cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub documents: Vec<Document>,
    pub has_more: bool,
}

/// Targeting for fan-out commands: the namespace whose owners should
/// receive the command, optionally narrowed by a selector.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTargeting {
    pub ns: Namespace,
    pub selector: Option<Document>,
}

impl CommandTargeting {
    pub fn new(ns: impl Into<Namespace>) -> Self {
        Self {
            ns: ns.into(),
            selector: None,
        }
    }

    pub fn with_selector(mut self, selector: Document) -> Self {
        self.selector = Some(selector);
        self
    }
}

/// Cached view of partition ownership.
#[async_trait]
pub trait TopologyAccessor: Send + Sync {
    async fn resolve_owners(&self, ns: &Namespace) -> Result<OwnerMap>;

    /// Reloads ownership of `ns` from the authoritative source before
    /// returning.
    async fn force_refresh(&self, ns: &Namespace) -> Result<()>;

    /// Re-sends version information on this client's pooled connections.
    async fn check_connection_versions(&self, _ns: &Namespace) -> Result<()> {
        Ok(())
    }

    async fn all_shards(&self) -> Result<Vec<Shard>>;

    async fn shard(&self, name: &str) -> Result<Option<Shard>>;
}

/// A cursor opened across every shard that owns matching data, yielding
/// documents in merged order.
///
/// Dropping a cursor must not kill the per-shard cursors behind it: on the
/// single-shard path the client continues the shard's cursor directly.
/// [`close`](MultiShardCursor::close) kills them explicitly.
#[async_trait]
pub trait MultiShardCursor: Send {
    /// Opens the per-shard cursors. Fails with `StaleTopology` when a shard
    /// disagrees with the router about partition versions.
    async fn init(&mut self) -> Result<()>;

    fn is_multi_shard(&self) -> bool;

    /// Up to `max_docs` further documents.
    async fn next_batch(&mut self, max_docs: usize) -> Result<Batch>;

    async fn explain(&mut self) -> Result<Document>;

    /// The only shard queried; `None` on the multi-shard path.
    fn primary_shard(&self) -> Option<Shard>;

    fn query_shards(&self) -> Vec<Shard>;

    /// First reply received from `shard`, with its originating host set.
    fn shard_reply(&self, shard: &str) -> Option<Reply>;

    async fn close(&mut self) {}
}

#[async_trait]
pub trait CursorFactory: Send + Sync {
    async fn open(
        &self,
        spec: &QuerySpec,
        targeting: Option<&CommandTargeting>,
    ) -> Result<Box<dyn MultiShardCursor>>;
}

/// Direct round trips to one shard or host.
#[async_trait]
pub trait ShardConnector: Send + Sync {
    async fn query(&self, shard: &Shard, spec: &QuerySpec) -> Result<Reply>;

    async fn find_one(
        &self,
        shard: &Shard,
        ns: &Namespace,
        query: &Document,
    ) -> Result<Option<Document>>;

    async fn get_more(
        &self,
        host: &str,
        ns: &Namespace,
        cursor_id: CursorId,
        n_to_return: i32,
    ) -> Result<Reply>;

    async fn kill_cursors(&self, host: &str, cursor_ids: &[CursorId]) -> Result<()>;
}

/// Registered-command execution.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs `command` against `ns` (a `<db>.$cmd` namespace). May fail with
    /// `StaleTopology`.
    async fn run(&self, ns: &Namespace, command: &Document, options: QueryOptions)
        -> Result<Document>;
}
