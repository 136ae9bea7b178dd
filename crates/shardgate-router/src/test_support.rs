//! Scriptable collaborators for unit tests.

use crate::config::RouterConfig;
use crate::context::{Collaborators, RouterContext};
use crate::topology::{
    Batch, CommandExecutor, CommandTargeting, CursorFactory, MultiShardCursor, OwnerMap, Shard,
    ShardConnector, ShardVersion, TopologyAccessor,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use shardgate_common::auth::{AuditEvent, AuditLog, Permissions};
use shardgate_common::protocol::document::from_value;
use shardgate_common::protocol::error::{Result, ShardgateError};
use shardgate_common::{CursorId, Document, Namespace, QueryOptions, QuerySpec, Reply};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub fn docs(count: usize) -> Vec<Document> {
    (0..count as i64).map(|i| from_value(json!({"_id": i}))).collect()
}

fn shard(name: &str) -> Shard {
    Shard::new(name, format!("{}:27018", name))
}

#[derive(Clone)]
pub struct FakeCursor {
    documents: Vec<Document>,
    position: usize,
    multi: bool,
    shards: Vec<Shard>,
    replies: HashMap<String, Reply>,
    stale_on_init: bool,
}

impl FakeCursor {
    /// A merged cursor over two shards yielding `documents` in order.
    pub fn multi(documents: Vec<Document>) -> Self {
        Self {
            documents,
            position: 0,
            multi: true,
            shards: vec![shard("shard0"), shard("shard1")],
            replies: HashMap::new(),
            stale_on_init: false,
        }
    }

    /// A single-shard cursor whose shard answered with `reply`.
    pub fn single(name: &str, reply: Reply) -> Self {
        Self {
            documents: Vec::new(),
            position: 0,
            multi: false,
            shards: vec![shard(name)],
            replies: HashMap::from([(name.to_string(), reply)]),
            stale_on_init: false,
        }
    }

    /// A command fan-out with one reply per shard.
    pub fn fan_out(replies: Vec<(&str, Reply)>) -> Self {
        Self {
            documents: Vec::new(),
            position: 0,
            multi: true,
            shards: replies.iter().map(|(name, _)| shard(name)).collect(),
            replies: replies
                .into_iter()
                .map(|(name, reply)| (name.to_string(), reply))
                .collect(),
            stale_on_init: false,
        }
    }

    pub fn stale_on_init(mut self) -> Self {
        self.stale_on_init = true;
        self
    }
}

#[async_trait]
impl MultiShardCursor for FakeCursor {
    async fn init(&mut self) -> Result<()> {
        if self.stale_on_init {
            return Err(ShardgateError::stale(&Namespace::new("app.events")));
        }
        Ok(())
    }

    fn is_multi_shard(&self) -> bool {
        self.multi
    }

    async fn next_batch(&mut self, max_docs: usize) -> Result<Batch> {
        let end = (self.position + max_docs).min(self.documents.len());
        let documents = self.documents[self.position..end].to_vec();
        self.position = end;
        Ok(Batch {
            documents,
            has_more: self.position < self.documents.len(),
        })
    }

    async fn explain(&mut self) -> Result<Document> {
        Ok(from_value(json!({"explained": true, "shards": self.shards.len()})))
    }

    fn primary_shard(&self) -> Option<Shard> {
        if self.multi {
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
}

#[derive(Default)]
pub struct FakeTopology {
    refreshes: Mutex<Vec<String>>,
    version_checks: Mutex<Vec<String>>,
}

impl FakeTopology {
    pub fn refreshes(&self) -> Vec<String> {
        self.refreshes.lock().unwrap().clone()
    }

    pub fn version_checks(&self) -> Vec<String> {
        self.version_checks.lock().unwrap().clone()
    }
}

#[async_trait]
impl TopologyAccessor for FakeTopology {
    async fn resolve_owners(&self, _ns: &Namespace) -> Result<OwnerMap> {
        Ok(OwnerMap {
            shards: [("shard0".to_string(), ShardVersion { major: 1, minor: 0 })]
                .into_iter()
                .collect(),
            partitioned: false,
            primary: "shard0".into(),
        })
    }

    async fn force_refresh(&self, ns: &Namespace) -> Result<()> {
        self.refreshes.lock().unwrap().push(ns.to_string());
        Ok(())
    }

    async fn check_connection_versions(&self, ns: &Namespace) -> Result<()> {
        self.version_checks.lock().unwrap().push(ns.to_string());
        Ok(())
    }

    async fn all_shards(&self) -> Result<Vec<Shard>> {
        Ok(vec![shard("shard0"), shard("shard1")])
    }

    async fn shard(&self, name: &str) -> Result<Option<Shard>> {
        Ok(["shard0", "shard1"]
            .contains(&name)
            .then(|| shard(name)))
    }
}

#[derive(Default)]
pub struct FakeFactory {
    template: Mutex<Option<FakeCursor>>,
    last_targeting: Mutex<Option<CommandTargeting>>,
}

impl FakeFactory {
    pub fn last_targeting(&self) -> Option<CommandTargeting> {
        self.last_targeting.lock().unwrap().clone()
    }
}

#[async_trait]
impl CursorFactory for FakeFactory {
    async fn open(
        &self,
        _spec: &QuerySpec,
        targeting: Option<&CommandTargeting>,
    ) -> Result<Box<dyn MultiShardCursor>> {
        *self.last_targeting.lock().unwrap() = targeting.cloned();
        let cursor = self
            .template
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| FakeCursor::multi(Vec::new()));
        Ok(Box::new(cursor))
    }
}

pub struct FakeConnector {
    reply: Mutex<Reply>,
    find_one_replies: Mutex<HashMap<String, Document>>,
    queried: Mutex<Vec<String>>,
    find_one_calls: Mutex<Vec<(String, Value)>>,
    get_more_hosts: Mutex<Vec<String>>,
    killed: Mutex<Vec<(String, CursorId)>>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self {
            reply: Mutex::new(Reply::batch(Vec::new(), 0, 0)),
            find_one_replies: Mutex::default(),
            queried: Mutex::default(),
            find_one_calls: Mutex::default(),
            get_more_hosts: Mutex::default(),
            killed: Mutex::default(),
        }
    }
}

impl FakeConnector {
    pub fn queried_shards(&self) -> Vec<String> {
        self.queried.lock().unwrap().clone()
    }

    pub fn find_one_calls(&self) -> Vec<(String, Value)> {
        self.find_one_calls.lock().unwrap().clone()
    }

    pub fn get_more_hosts(&self) -> Vec<String> {
        self.get_more_hosts.lock().unwrap().clone()
    }

    pub fn killed_cursors(&self) -> Vec<(String, CursorId)> {
        self.killed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ShardConnector for FakeConnector {
    async fn query(&self, shard: &Shard, _spec: &QuerySpec) -> Result<Reply> {
        self.queried.lock().unwrap().push(shard.name.clone());
        Ok(self.reply.lock().unwrap().clone())
    }

    async fn find_one(
        &self,
        shard: &Shard,
        _ns: &Namespace,
        query: &Document,
    ) -> Result<Option<Document>> {
        self.find_one_calls
            .lock()
            .unwrap()
            .push((shard.name.clone(), Value::Object(query.clone())));
        Ok(self.find_one_replies.lock().unwrap().get(&shard.name).cloned())
    }

    async fn get_more(
        &self,
        host: &str,
        _ns: &Namespace,
        _cursor_id: CursorId,
        _n_to_return: i32,
    ) -> Result<Reply> {
        self.get_more_hosts.lock().unwrap().push(host.to_string());
        Ok(self.reply.lock().unwrap().clone())
    }

    async fn kill_cursors(&self, host: &str, cursor_ids: &[CursorId]) -> Result<()> {
        let mut killed = self.killed.lock().unwrap();
        killed.extend(cursor_ids.iter().map(|id| (host.to_string(), *id)));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeExecutor {
    queue: Mutex<VecDeque<Result<Document>>>,
    stale_ns: Mutex<Option<String>>,
    commands: Mutex<Vec<(String, Value)>>,
}

impl FakeExecutor {
    /// Every command fails with a stale topology for `ns`.
    pub fn always_stale(&self, ns: &str) {
        *self.stale_ns.lock().unwrap() = Some(ns.to_string());
    }

    pub fn commands(&self) -> Vec<(String, Value)> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn run(
        &self,
        ns: &Namespace,
        command: &Document,
        _options: QueryOptions,
    ) -> Result<Document> {
        self.commands
            .lock()
            .unwrap()
            .push((ns.to_string(), Value::Object(command.clone())));

        if let Some(stale) = self.stale_ns.lock().unwrap().clone() {
            return Err(ShardgateError::StaleTopology { namespace: stale });
        }
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(from_value(json!({"ok": 1}))))
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    codes: Mutex<Vec<i32>>,
}

impl RecordingAudit {
    pub fn codes(&self) -> Vec<i32> {
        self.codes.lock().unwrap().clone()
    }
}

impl AuditLog for RecordingAudit {
    fn log_authz_check(&self, event: &AuditEvent<'_>) {
        self.codes.lock().unwrap().push(event.result_code);
    }
}

pub struct Fakes {
    pub topology: Arc<FakeTopology>,
    pub factory: Arc<FakeFactory>,
    pub connector: Arc<FakeConnector>,
    pub executor: Arc<FakeExecutor>,
    pub audit: Arc<RecordingAudit>,
    pub permissions: Permissions,
}

impl Default for Fakes {
    fn default() -> Self {
        Self::with_permissions(Permissions::root())
    }
}

impl Fakes {
    pub fn with_permissions(permissions: Permissions) -> Self {
        Self {
            topology: Arc::default(),
            factory: Arc::default(),
            connector: Arc::default(),
            executor: Arc::default(),
            audit: Arc::default(),
            permissions,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            topology: self.topology.clone(),
            cursor_factory: self.factory.clone(),
            connector: self.connector.clone(),
            executor: self.executor.clone(),
            authorizer: Arc::new(self.permissions.clone()),
            audit: self.audit.clone(),
        }
    }

    pub fn set_cursor(&self, cursor: FakeCursor) {
        *self.factory.template.lock().unwrap() = Some(cursor);
    }

    pub fn set_connector_reply(&self, reply: Reply) {
        *self.connector.reply.lock().unwrap() = reply;
    }

    pub fn set_find_one(&self, shard: &str, reply: Value) {
        self.connector
            .find_one_replies
            .lock()
            .unwrap()
            .insert(shard.to_string(), from_value(reply));
    }

    pub fn push_command_reply(&self, reply: Value) {
        self.executor
            .queue
            .lock()
            .unwrap()
            .push_back(Ok(from_value(reply)));
    }

    pub fn push_command_error(&self, err: ShardgateError) {
        self.executor.queue.lock().unwrap().push_back(Err(err));
    }
}

pub fn context(fakes: &Fakes) -> RouterContext {
    RouterContext::new(fakes.collaborators(), RouterConfig::default())
}
