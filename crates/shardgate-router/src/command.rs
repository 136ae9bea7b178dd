use crate::context::RouterContext;
use crate::special;
use crate::topology::{CommandTargeting, Shard};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shardgate_common::protocol::document;
use shardgate_common::protocol::error::{Result, ShardgateError};
use shardgate_common::{Document, Namespace, QueryMessage, QueryOptions, QuerySpec, Reply};
use shardgate_metrics::MetricsCollector;
use tracing::{info, warn};

const READ_PREFERENCE_FIELD: &str = "$readPreference";
const QUERY_OPTIONS_FIELD: &str = "$queryOptions";

/// One shard's answer to a fan-out command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub shard_target: Shard,
    /// Connection string the reply came from.
    pub target: String,
    pub result: Document,
}

/// Extracts the command from a `{query: {...}}` / `{$query: {...}}` wrapper.
///
/// A `$readPreference` next to the wrapper is kept as
/// `$queryOptions.$readPreference` on the unwrapped command. Anything else
/// is returned unchanged.
pub fn unwrap_command(command: &Document) -> Document {
    let Some((key, Value::Object(inner))) = command.iter().next() else {
        return command.clone();
    };
    if key != "query" && key != "$query" {
        return command.clone();
    }

    let mut unwrapped = inner.clone();
    if let Some(read_pref) = command.get(READ_PREFERENCE_FIELD) {
        let mut query_options = Document::new();
        query_options.insert(READ_PREFERENCE_FIELD.into(), read_pref.clone());
        unwrapped.insert(QUERY_OPTIONS_FIELD.into(), Value::Object(query_options));
    }
    unwrapped
}

/// `{ok: 0, errmsg, code}` for an error embedded in a command reply.
pub fn error_document(err: &ShardgateError) -> Document {
    let mut doc = Document::new();
    doc.insert("ok".into(), json!(0));
    doc.insert("errmsg".into(), json!(err.to_string()));
    doc.insert("code".into(), json!(err.code()));
    doc
}

/// Dispatches administrative commands.
pub struct CommandRouter {
    ctx: RouterContext,
}

impl CommandRouter {
    pub fn new(ctx: RouterContext) -> Self {
        Self { ctx }
    }

    /// Runs the command in `msg` and always answers with one document,
    /// except when the topology stays stale through every attempt.
    pub async fn route(&self, msg: &QueryMessage) -> Result<Reply> {
        if let Some(name) = msg.ns.special_command_name() {
            if let Some(reply) = special::handle(&self.ctx, name, msg).await? {
                return Ok(Reply::single(reply));
            }
        }

        if let Some(name) = document::first_key(&msg.query) {
            if self.ctx.metrics.is_metrics_request(name) {
                let reply = self
                    .ctx
                    .metrics
                    .handle_metrics_request(name)
                    .unwrap_or_else(|e| error_document(&e));
                return Ok(Reply::single(reply));
            }
        }

        let command = unwrap_command(&msg.query);
        let ns = msg.ns.command_ns();

        match self.run_with_retry(&ns, &command, msg.options).await {
            Ok(reply) => Ok(Reply::single(reply)),
            Err(e) if e.is_stale_topology() => Err(e),
            Err(e) => Ok(Reply::single(error_document(&e))),
        }
    }

    /// Runs a command, refreshing the topology and retrying while shards
    /// report it stale.
    ///
    /// Every retry is preceded by a connection version check and a forced
    /// refresh of the stale namespace, so `max_attempts` attempts perform
    /// `max_attempts - 1` refreshes. The last staleness error is returned.
    pub async fn run_with_retry(
        &self,
        ns: &Namespace,
        command: &Document,
        options: QueryOptions,
    ) -> Result<Document> {
        let max_attempts = self.ctx.config.command_retry.max_attempts.max(1);
        let topology = &self.ctx.collaborators.topology;
        let mut attempt = 1;

        loop {
            match self.ctx.collaborators.executor.run(ns, command, options).await {
                Err(ShardgateError::StaleTopology { namespace }) if attempt < max_attempts => {
                    let retried = Value::Object(command.clone());
                    info!("retrying command: {}", retried);
                    warn!(
                        "Command attempt {}/{} hit stale topology for '{}'",
                        attempt, max_attempts, namespace
                    );

                    // the signal may not name a namespace
                    let stale_ns = if namespace.is_empty() {
                        ns.clone()
                    } else {
                        Namespace::new(namespace)
                    };

                    topology.check_connection_versions(&stale_ns).await?;
                    topology.force_refresh(&stale_ns).await?;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Runs `command` on every shard that owns `targeting`, without retry.
    pub async fn command_op(
        &self,
        db: &str,
        command: Document,
        options: QueryOptions,
        targeting: &CommandTargeting,
    ) -> Result<Vec<CommandResult>> {
        let spec = QuerySpec::command(db, command, options);
        let mut cursor = self
            .ctx
            .collaborators
            .cursor_factory
            .open(&spec, Some(targeting))
            .await?;
        cursor.init().await?;

        let mut results = Vec::new();
        for shard in cursor.query_shards() {
            self.ctx.metrics.record_shard_request(&shard.name);
            let reply = cursor.shard_reply(&shard.name).ok_or_else(|| {
                ShardgateError::InvalidResponse(format!("no reply from shard {}", shard.name))
            })?;
            let target = reply
                .origin_host
                .clone()
                .unwrap_or_else(|| shard.conn_string.clone());
            let result = reply.first().cloned().unwrap_or_default();
            results.push(CommandResult {
                shard_target: shard,
                target,
                result,
            });
        }
        Ok(results)
    }
}
