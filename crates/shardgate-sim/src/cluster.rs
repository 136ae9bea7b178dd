use async_trait::async_trait;
use serde_json::Value;
use shardgate_common::protocol::document;
use shardgate_common::protocol::error::{Result, ShardgateError};
use shardgate_common::{CursorId, Document, Namespace, QuerySpec, Reply, ResultFlags};
use shardgate_router::{OwnerMap, Shard, ShardConnector, ShardVersion, TopologyAccessor};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

pub(crate) const DEFAULT_BATCH: usize = 101;

/// One simulated shard.
#[derive(Debug)]
pub(crate) struct SimShard {
    pub shard: Shard,
    pub collections: BTreeMap<Namespace, Vec<Document>>,
    pub cursors: HashMap<CursorId, VecDeque<Document>>,
    pub inprog: Vec<Document>,
}

/// Calls the cluster received, kept for inspection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterLog {
    pub refreshes: Vec<String>,
    pub version_checks: Vec<String>,
    /// `(namespace, command name)` per executed command.
    pub commands: Vec<(String, String)>,
    /// `(shard, op id)` per kill forwarded to a shard.
    pub killed_ops: Vec<(String, i64)>,
    /// `(host, cursor id)` per shard cursor killed.
    pub killed_cursors: Vec<(String, CursorId)>,
    /// Merged cursors closed by the router.
    pub closed_merged: usize,
}

#[derive(Debug, Default)]
pub(crate) struct ClusterState {
    pub shards: Vec<SimShard>,
    pub partitioned: BTreeMap<Namespace, ShardVersion>,
    pub stale_commands: HashMap<String, usize>,
    pub stale_queries: HashMap<Namespace, usize>,
    pub stale_index_queries: HashMap<Namespace, usize>,
    pub batch_latency: Duration,
    pub next_cursor_id: CursorId,
    pub next_object_id: i64,
    pub log: ClusterLog,
}

impl ClusterState {
    pub fn shard_index(&self, name: &str) -> Option<usize> {
        self.shards.iter().position(|s| s.shard.name == name)
    }

    pub fn shard_by_host(&mut self, host: &str) -> Option<&mut SimShard> {
        self.shards.iter_mut().find(|s| s.shard.conn_string == host)
    }

    pub fn is_partitioned(&self, ns: &Namespace) -> bool {
        self.partitioned.contains_key(ns)
    }

    /// Shards holding data of `ns`, in name order.
    pub fn owners(&self, ns: &Namespace) -> Vec<usize> {
        if self.is_partitioned(ns) {
            (0..self.shards.len()).collect()
        } else {
            vec![0]
        }
    }

    /// Shard a new document of `ns` lands on.
    pub fn placement(&self, ns: &Namespace, doc: &Document) -> usize {
        if !self.is_partitioned(ns) || self.shards.is_empty() {
            return 0;
        }
        let key = match doc.get("_id") {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => s.bytes().map(i64::from).sum(),
            _ => 0,
        };
        key.rem_euclid(self.shards.len() as i64) as usize
    }

    /// Takes one pending injected staleness for `key`, if any.
    pub fn take_stale<K: std::hash::Hash + Eq>(map: &mut HashMap<K, usize>, key: &K) -> bool {
        match map.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn new_cursor_id(&mut self) -> CursorId {
        self.next_cursor_id += 1;
        self.next_cursor_id
    }

    pub fn new_object_id(&mut self) -> i64 {
        self.next_object_id += 1;
        self.next_object_id
    }

    /// Documents of `ns` on one shard matching `filter`, sorted by `_id`.
    pub fn find(&self, shard: usize, ns: &Namespace, filter: &Document) -> Vec<Document> {
        let mut found: Vec<Document> = self.shards[shard]
            .collections
            .get(ns)
            .map(|docs| docs.iter().filter(|d| matches(d, filter)).cloned().collect())
            .unwrap_or_default();
        found.sort_by(|a, b| compare_ids(a.get("_id"), b.get("_id")));
        found
    }

    /// Opens a shard-local cursor over `documents` and returns the first
    /// reply, the way a shard answers a query.
    pub fn open_shard_cursor(&mut self, shard: usize, mut documents: VecDeque<Document>, n_to_return: i32) -> Reply {
        let single_batch = n_to_return < 0;
        let limit = match n_to_return {
            0 => DEFAULT_BATCH,
            n => n.unsigned_abs() as usize,
        };
        let first: Vec<Document> = documents.drain(..limit.min(documents.len())).collect();
        let host = self.shards[shard].shard.conn_string.clone();

        let cursor_id = if documents.is_empty() || single_batch {
            0
        } else {
            let id = self.new_cursor_id();
            self.shards[shard].cursors.insert(id, documents);
            id
        };
        Reply::batch(first, 0, cursor_id).with_origin_host(host)
    }
}

/// Top-level equality match; operator fields are ignored.
pub(crate) fn matches(doc: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .filter(|(key, _)| !key.starts_with('$'))
        .all(|(key, value)| doc.get(key) == Some(value))
}

pub(crate) fn compare_ids(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Number(_)), Some(_)) => Ordering::Less,
        (Some(_), Some(Value::Number(_))) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (a, b) => a.map(Value::to_string).cmp(&b.map(Value::to_string)),
    }
}

/// An in-memory sharded cluster.
///
/// Implements every collaborator the router needs. Clones share state, so
/// one cluster can be handed out as topology, cursor factory, connector and
/// executor at once.
///
/// Partitioned collections spread documents across all shards by `_id`;
/// every other collection lives on the first shard, the primary.
#[derive(Debug, Clone)]
pub struct InMemoryCluster {
    pub(crate) state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    /// A cluster of `shard_count` shards named `shard0`, `shard1`, ...
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|i| SimShard {
                shard: Shard::new(format!("shard{}", i), format!("shard{}.sim:27018", i)),
                collections: BTreeMap::new(),
                cursors: HashMap::new(),
                inprog: Vec::new(),
            })
            .collect();
        let state = ClusterState {
            shards,
            next_cursor_id: 1000,
            ..ClusterState::default()
        };
        info!("Simulated cluster with {} shard(s)", shard_count.max(1));
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spreads `ns` across every shard.
    pub fn partition(&self, ns: impl Into<Namespace>) -> &Self {
        self.lock()
            .partitioned
            .insert(ns.into(), ShardVersion { major: 1, minor: 0 });
        self
    }

    /// Stores documents directly, bypassing the router.
    pub fn seed(&self, ns: impl Into<Namespace>, documents: Vec<Document>) -> &Self {
        let ns = ns.into();
        let mut state = self.lock();
        for doc in documents {
            let shard = state.placement(&ns, &doc);
            state.shards[shard]
                .collections
                .entry(ns.clone())
                .or_default()
                .push(doc);
        }
        self
    }

    /// Registers an in-progress operation reported by `shard`.
    pub fn add_inprog(&self, shard: &str, op: Document) -> &Self {
        let mut state = self.lock();
        if let Some(i) = state.shard_index(shard) {
            state.shards[i].inprog.push(op);
        }
        self
    }

    /// The next `times` runs of `command` report a stale topology.
    pub fn inject_stale_command(&self, command: &str, times: usize) -> &Self {
        self.lock().stale_commands.insert(command.to_string(), times);
        self
    }

    /// The next `times` cursor inits on `ns` report a stale topology.
    pub fn inject_stale_query(&self, ns: impl Into<Namespace>, times: usize) -> &Self {
        self.lock().stale_queries.insert(ns.into(), times);
        self
    }

    /// The next `times` index listings for `ns` come back flagged stale.
    pub fn inject_stale_index_query(&self, ns: impl Into<Namespace>, times: usize) -> &Self {
        self.lock().stale_index_queries.insert(ns.into(), times);
        self
    }

    /// Delay added to every batch pulled from a merged cursor.
    pub fn set_batch_latency(&self, latency: Duration) -> &Self {
        self.lock().batch_latency = latency;
        self
    }

    /// Documents of `ns` across all shards, sorted by `_id`.
    pub fn documents(&self, ns: impl Into<Namespace>) -> Vec<Document> {
        let ns = ns.into();
        let state = self.lock();
        let mut all: Vec<Document> = (0..state.shards.len())
            .flat_map(|i| state.find(i, &ns, &Document::new()))
            .collect();
        all.sort_by(|a, b| compare_ids(a.get("_id"), b.get("_id")));
        all
    }

    /// Number of documents of `ns` held by each shard, in shard order.
    pub fn distribution(&self, ns: impl Into<Namespace>) -> Vec<(String, usize)> {
        let ns = ns.into();
        let state = self.lock();
        state
            .shards
            .iter()
            .map(|s| {
                (
                    s.shard.name.clone(),
                    s.collections.get(&ns).map(Vec::len).unwrap_or(0),
                )
            })
            .collect()
    }

    /// Shard cursors still open across the cluster.
    pub fn open_shard_cursors(&self) -> usize {
        self.lock().shards.iter().map(|s| s.cursors.len()).sum()
    }

    pub fn log(&self) -> ClusterLog {
        self.lock().log.clone()
    }
}

#[async_trait]
impl TopologyAccessor for InMemoryCluster {
    async fn resolve_owners(&self, ns: &Namespace) -> Result<OwnerMap> {
        let state = self.lock();
        let version = state.partitioned.get(ns).copied().unwrap_or_default();
        let shards = state
            .owners(ns)
            .into_iter()
            .map(|i| (state.shards[i].shard.name.clone(), version))
            .collect();
        Ok(OwnerMap {
            shards,
            partitioned: state.is_partitioned(ns),
            primary: state.shards[0].shard.name.clone(),
        })
    }

    async fn force_refresh(&self, ns: &Namespace) -> Result<()> {
        debug!(ns = %ns, "forced topology refresh");
        self.lock().log.refreshes.push(ns.to_string());
        Ok(())
    }

    async fn check_connection_versions(&self, ns: &Namespace) -> Result<()> {
        self.lock().log.version_checks.push(ns.to_string());
        Ok(())
    }

    async fn all_shards(&self) -> Result<Vec<Shard>> {
        Ok(self.lock().shards.iter().map(|s| s.shard.clone()).collect())
    }

    async fn shard(&self, name: &str) -> Result<Option<Shard>> {
        let state = self.lock();
        Ok(state
            .shard_index(name)
            .map(|i| state.shards[i].shard.clone()))
    }
}

#[async_trait]
impl ShardConnector for InMemoryCluster {
    async fn query(&self, shard: &Shard, spec: &QuerySpec) -> Result<Reply> {
        let mut state = self.lock();
        let index = state
            .shard_index(&shard.name)
            .ok_or_else(|| ShardgateError::ShardUnavailable(shard.name.clone()))?;

        if spec.ns.is_system_indexes() {
            let target = Namespace::new(document::get_str(spec.filter(), "ns").unwrap_or_default());
            let stale_index = &mut state.stale_index_queries;
            if ClusterState::take_stale(stale_index, &target) {
                return Ok(Reply::batch(Vec::new(), 0, 0).with_flags(ResultFlags::SHARD_CONFIG_STALE));
            }
            let indexes: VecDeque<Document> = std::iter::once(document::from_value(serde_json::json!({
                "v": 1,
                "key": {"_id": 1},
                "ns": target.as_str(),
                "name": "_id_",
            })))
            .collect();
            return Ok(state.open_shard_cursor(index, indexes, spec.n_to_return));
        }

        let found = state.find(index, &spec.ns, spec.filter());
        Ok(state.open_shard_cursor(index, found.into(), spec.n_to_return))
    }

    async fn find_one(&self, shard: &Shard, ns: &Namespace, query: &Document) -> Result<Option<Document>> {
        let mut state = self.lock();
        let index = state
            .shard_index(&shard.name)
            .ok_or_else(|| ShardgateError::ShardUnavailable(shard.name.clone()))?;

        match ns.special_command_name() {
            Some("inprog") => {
                let ops: Vec<Value> = state.shards[index]
                    .inprog
                    .iter()
                    .cloned()
                    .map(Value::Object)
                    .collect();
                let mut reply = Document::new();
                reply.insert("inprog".into(), Value::Array(ops));
                Ok(Some(reply))
            }
            Some("killop") => {
                let op = document::get_i64(query, "op").unwrap_or(0);
                info!(shard = %shard.name, op, "killing operation");
                state.shards[index]
                    .inprog
                    .retain(|entry| document::get_i64(entry, "opid") != Some(op));
                state.log.killed_ops.push((shard.name.clone(), op));
                Ok(Some(document::from_value(
                    serde_json::json!({"info": "attempting to kill op"}),
                )))
            }
            _ => Ok(state.find(index, ns, query).into_iter().next()),
        }
    }

    async fn get_more(&self, host: &str, _ns: &Namespace, cursor_id: CursorId, n_to_return: i32) -> Result<Reply> {
        let mut state = self.lock();
        let shard = state
            .shard_by_host(host)
            .ok_or_else(|| ShardgateError::ShardUnavailable(host.to_string()))?;

        let Some(pending) = shard.cursors.get_mut(&cursor_id) else {
            return Ok(Reply::cursor_not_found());
        };
        let limit = match n_to_return {
            0 => DEFAULT_BATCH,
            n => n.unsigned_abs() as usize,
        };
        let batch: Vec<Document> = pending.drain(..limit.min(pending.len())).collect();
        let exhausted = pending.is_empty() || n_to_return < 0;
        if exhausted {
            shard.cursors.remove(&cursor_id);
        }

        // offsets are tracked by the client for pass-through cursors
        Ok(Reply::batch(batch, 0, if exhausted { 0 } else { cursor_id }).with_origin_host(host))
    }

    async fn kill_cursors(&self, host: &str, cursor_ids: &[CursorId]) -> Result<()> {
        let mut state = self.lock();
        if let Some(shard) = state.shard_by_host(host) {
            for id in cursor_ids {
                shard.cursors.remove(id);
            }
        }
        state
            .log
            .killed_cursors
            .extend(cursor_ids.iter().map(|id| (host.to_string(), *id)));
        Ok(())
    }
}
