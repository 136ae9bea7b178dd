use crate::cluster::{compare_ids, InMemoryCluster};
use crate::commands;
use async_trait::async_trait;
use serde_json::json;
use shardgate_common::protocol::document;
use shardgate_common::protocol::error::{Result, ShardgateError};
use shardgate_common::{Document, QuerySpec, Reply};
use shardgate_router::{Batch, CommandTargeting, CursorFactory, MultiShardCursor, Shard};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// A cursor across the shards owning one namespace.
///
/// Multi-shard results are merged by `_id` when the cursor is initialized.
/// On a single shard the shard opens its own cursor, and its reply is
/// exposed through `shard_reply` for the router to relay.
pub struct SimCursor {
    cluster: InMemoryCluster,
    spec: QuerySpec,
    targeting: Option<CommandTargeting>,
    shards: Vec<Shard>,
    replies: HashMap<String, Reply>,
    merged: VecDeque<Document>,
    initialized: bool,
    closed: bool,
}

impl SimCursor {
    fn new(cluster: InMemoryCluster, spec: QuerySpec, targeting: Option<CommandTargeting>) -> Self {
        Self {
            cluster,
            spec,
            targeting,
            shards: Vec::new(),
            replies: HashMap::new(),
            merged: VecDeque::new(),
            initialized: false,
            closed: false,
        }
    }

    /// Namespace whose ownership picks the shards.
    fn routing_ns(&self) -> shardgate_common::Namespace {
        match &self.targeting {
            Some(targeting) => targeting.ns.clone(),
            None => self.spec.ns.clone(),
        }
    }
}

#[async_trait]
impl MultiShardCursor for SimCursor {
    async fn init(&mut self) -> Result<()> {
        let routing_ns = self.routing_ns();
        let mut state = self.cluster.lock();

        if crate::cluster::ClusterState::take_stale(&mut state.stale_queries, &routing_ns) {
            return Err(ShardgateError::stale(&routing_ns));
        }

        let owners = state.owners(&routing_ns);
        self.shards = owners.iter().map(|&i| state.shards[i].shard.clone()).collect();

        if self.spec.ns.is_command() {
            for &i in &owners {
                let reply = commands::execute(&mut state, Some(i), &self.spec.ns, &self.spec.query);
                let host = state.shards[i].shard.conn_string.clone();
                self.replies.insert(
                    state.shards[i].shard.name.clone(),
                    Reply::single(reply).with_origin_host(host),
                );
            }
        } else if owners.len() == 1 {
            let found = state.find(owners[0], &self.spec.ns, self.spec.filter());
            let reply = state.open_shard_cursor(owners[0], found.into(), self.spec.n_to_return);
            self.replies.insert(state.shards[owners[0]].shard.name.clone(), reply);
        } else {
            let mut all: Vec<Document> = owners
                .iter()
                .flat_map(|&i| state.find(i, &self.spec.ns, self.spec.filter()))
                .collect();
            all.sort_by(|a, b| compare_ids(a.get("_id"), b.get("_id")));
            self.merged = all.into();
        }

        trace!(ns = %self.spec.ns, shards = self.shards.len(), "initialized simulated cursor");
        self.initialized = true;
        Ok(())
    }

    fn is_multi_shard(&self) -> bool {
        self.shards.len() > 1
    }

    async fn next_batch(&mut self, max_docs: usize) -> Result<Batch> {
        if !self.initialized || self.closed {
            return Err(ShardgateError::InvalidResponse("cursor is not open".into()));
        }

        let latency = self.cluster.lock().batch_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let take = max_docs.min(self.merged.len());
        let documents: Vec<Document> = self.merged.drain(..take).collect();
        Ok(Batch {
            documents,
            has_more: !self.merged.is_empty(),
        })
    }

    async fn explain(&mut self) -> Result<Document> {
        let names: Vec<&str> = self.shards.iter().map(|s| s.name.as_str()).collect();
        let n = if self.is_multi_shard() {
            self.merged.len()
        } else {
            self.replies.values().map(Reply::n_returned).sum()
        };
        Ok(document::from_value(json!({
            "clusteredType": if self.is_multi_shard() { "ParallelSort" } else { "SingleShard" },
            "shards": names,
            "n": n,
        })))
    }

    fn primary_shard(&self) -> Option<Shard> {
        if self.is_multi_shard() {
            None
        } else {
            self.shards.first().cloned()
        }
    }

    fn query_shards(&self) -> Vec<Shard> {
        self.shards.clone()
    }

    fn shard_reply(&self, shard: &str) -> Option<Reply> {
        self.replies.get(shard).cloned()
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.merged.clear();
        self.cluster.lock().log.closed_merged += 1;
    }
}

#[async_trait]
impl CursorFactory for InMemoryCluster {
    async fn open(
        &self,
        spec: &QuerySpec,
        targeting: Option<&CommandTargeting>,
    ) -> Result<Box<dyn MultiShardCursor>> {
        Ok(Box::new(SimCursor::new(
            self.clone(),
            spec.clone(),
            targeting.cloned(),
        )))
    }
}
