//! Query routing
//!
//! A query either touches one shard, in which case the shard's own reply
//! (and cursor) is handed straight back to the client, or several, in which
//! case the router owns a merged cursor and serves batches from it.

use crate::context::RouterContext;
use crate::cursor_cache::{CursorBudget, MergedCursor};
use crate::topology::MultiShardCursor;
use serde_json::json;
use shardgate_common::protocol::document;
use shardgate_common::protocol::error::{Result, ShardgateError};
use shardgate_common::{Namespace, QueryMessage, QuerySpec, Reply, ResultFlags};
use std::time::Instant;
use tracing::{debug, trace};

pub struct QueryRouter {
    ctx: RouterContext,
}

impl QueryRouter {
    pub fn new(ctx: RouterContext) -> Self {
        Self { ctx }
    }

    /// Routes one query and produces exactly one reply.
    ///
    /// # Errors
    /// - `Unauthorized` when the authorizer denies the query
    /// - `InvalidArgument` for command namespaces or a malformed `$maxTimeMS`
    /// - `StaleTopology` when a shard rejects the router's partition view
    pub async fn route(&self, msg: &QueryMessage) -> Result<Reply> {
        let start = Instant::now();

        self.ctx.authorize_query(&msg.ns, &msg.query)?;

        if msg.ns.is_command() || msg.ns.is_special_command() {
            return Err(ShardgateError::InvalidArgument(
                "shouldn't see a command here".into(),
            ));
        }

        let spec = QuerySpec::from_message(msg)?;
        trace!(ns = %spec.ns, n_to_return = spec.n_to_return, max_time_ms = ?spec.max_time_ms, "query");

        if spec.ns.is_system_indexes() {
            if let Some(target) = document::get_str(spec.filter(), "ns") {
                return self.index_query(&spec, &Namespace::new(target)).await;
            }
        }

        let mut cursor = self.ctx.collaborators.cursor_factory.open(&spec, None).await?;
        cursor.init().await?;

        for shard in cursor.query_shards() {
            self.ctx.metrics.record_shard_request(&shard.name);
        }

        if spec.is_explain() {
            let mut explain = cursor.explain().await?;
            explain.insert("millis".into(), json!(start.elapsed().as_millis() as u64));
            cursor.close().await;
            return Ok(Reply::single(explain));
        }

        if cursor.is_multi_shard() {
            self.serve_merged(&spec, cursor, start).await
        } else {
            self.pass_through(cursor).await
        }
    }

    /// Index listings live on one shard: the first owner of a partitioned
    /// collection, otherwise the database primary.
    async fn index_query(&self, spec: &QuerySpec, target: &Namespace) -> Result<Reply> {
        let topology = &self.ctx.collaborators.topology;
        let owners = topology.resolve_owners(target).await?;
        let shard_name = owners.metadata_shard();
        let shard = topology.shard(shard_name).await?.ok_or_else(|| {
            ShardgateError::ShardUnavailable(format!("unknown shard {}", shard_name))
        })?;

        debug!(ns = %target, shard = %shard.name, "routing index query to single shard");
        self.ctx.metrics.record_shard_request(&shard.name);
        let reply = self.ctx.collaborators.connector.query(&shard, spec).await?;

        if reply.flags.contains(ResultFlags::SHARD_CONFIG_STALE) {
            return Err(ShardgateError::stale(target));
        }

        if reply.has_cursor() {
            let host = reply
                .origin_host
                .clone()
                .unwrap_or_else(|| shard.conn_string.clone());
            self.ctx.cache.register_ref(reply.cursor_id, host).await;
        }
        Ok(reply)
    }

    async fn serve_merged(
        &self,
        spec: &QuerySpec,
        cursor: Box<dyn MultiShardCursor>,
        start: Instant,
    ) -> Result<Reply> {
        let mut merged = MergedCursor::new(
            spec.ns.clone(),
            spec.options,
            cursor,
            &self.ctx.config.cursors,
        );
        let batch = merged.send_next_batch(spec.n_to_return).await?;

        if !batch.has_more {
            merged.close().await;
            return Ok(Reply::batch(batch.documents, batch.starting_from, 0));
        }

        // elapsed time is measured on the router only
        merged.set_budget(CursorBudget::from_hint(spec.max_time_ms, start.elapsed()));
        let id = self.ctx.cache.store(merged).await;
        self.ctx.metrics.record_cursor_opened();

        Ok(Reply::batch(batch.documents, batch.starting_from, id))
    }

    /// Relays the only shard's reply. The shard keeps owning its cursor;
    /// the router only remembers where it lives.
    async fn pass_through(&self, cursor: Box<dyn MultiShardCursor>) -> Result<Reply> {
        let shard = cursor.primary_shard().ok_or_else(|| {
            ShardgateError::InternalInconsistency("single-shard cursor without a shard".into())
        })?;
        let reply = cursor.shard_reply(&shard.name).ok_or_else(|| {
            ShardgateError::InvalidResponse(format!("no reply from shard {}", shard.name))
        })?;

        if reply.has_cursor() {
            let host = reply
                .origin_host
                .clone()
                .unwrap_or_else(|| shard.conn_string.clone());
            self.ctx.cache.register_ref(reply.cursor_id, host).await;
        }
        Ok(reply)
    }
}
