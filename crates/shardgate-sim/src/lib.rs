//! In-memory sharded cluster
//!
//! [`InMemoryCluster`] implements every collaborator trait the router
//! drives: topology lookups, merged cursors, direct shard round trips and
//! command execution. It backs the router's integration tests and the
//! `shardgate simulate` command.
//!
//! Faults are injected explicitly: stale topologies per command, query or
//! index listing, and a per-batch latency for exercising cursor time limits.
//!
//! # Example
//!
//! ```
//! use shardgate_common::auth::Permissions;
//! use shardgate_sim::InMemoryCluster;
//!
//! let cluster = InMemoryCluster::new(2);
//! cluster.partition("app.events");
//! let collaborators = cluster.collaborators(Permissions::root());
//! # let _ = collaborators;
//! ```

mod cluster;
mod commands;
mod cursor;

pub use cluster::{ClusterLog, InMemoryCluster};
pub use cursor::SimCursor;

use shardgate_common::auth::{AuditLog, Permissions, TracingAuditLog};
use shardgate_router::Collaborators;
use std::sync::Arc;

impl InMemoryCluster {
    /// Collaborators backed by this cluster, auditing through `tracing`.
    pub fn collaborators(&self, permissions: Permissions) -> Collaborators {
        self.collaborators_with_audit(permissions, Arc::new(TracingAuditLog))
    }

    pub fn collaborators_with_audit(
        &self,
        permissions: Permissions,
        audit: Arc<dyn AuditLog>,
    ) -> Collaborators {
        let shared = Arc::new(self.clone());
        Collaborators {
            topology: shared.clone(),
            cursor_factory: shared.clone(),
            connector: shared.clone(),
            executor: shared,
            authorizer: Arc::new(permissions),
            audit,
        }
    }
}
