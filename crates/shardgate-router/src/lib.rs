//! Shardgate Router
//!
//! Routes client operations across the shards of a partitioned document
//! cluster. Queries touching one shard are relayed with the shard's own
//! cursor; queries touching several are merged behind a router-owned cursor
//! that lives in the [`CursorCache`] across get-mores. Commands retry when
//! shards report a stale partition view, and legacy writes run as batched
//! write commands whose outcome feeds the connection's last-error state.
//!
//! Topology, cursor merging, shard connections and command execution are
//! collaborators reached through the traits in [`topology`].

pub mod batch_writer;
pub mod command;
pub mod config;
pub mod context;
pub mod cursor_cache;
pub mod cursor_reaper;
pub mod get_more;
pub mod query;
pub mod router;
pub mod special;
pub mod topology;

#[cfg(test)]
mod test_support;

pub use batch_writer::{BatchWriter, BatchedCommandResponse, WriteOutcome};
pub use command::{CommandResult, CommandRouter};
pub use config::{CommandRetryConfig, CursorConfig, RouterConfig};
pub use context::{Collaborators, RouterContext};
pub use cursor_cache::{CursorBudget, CursorCache, CursorLookup, MergedCursor};
pub use cursor_reaper::CursorReaper;
pub use get_more::GetMoreRouter;
pub use query::QueryRouter;
pub use router::Router;
pub use topology::{
    Batch, CommandExecutor, CommandTargeting, CursorFactory, MultiShardCursor, OwnerMap, Shard,
    ShardConnector, ShardId, ShardVersion, TopologyAccessor,
};
