use crate::batch_writer::{BatchWriter, WriteOutcome};
use crate::command::{unwrap_command, CommandResult, CommandRouter};
use crate::config::RouterConfig;
use crate::context::{Collaborators, RouterContext};
use crate::cursor_cache::CursorCache;
use crate::cursor_reaper::CursorReaper;
use crate::get_more::GetMoreRouter;
use crate::query::QueryRouter;
use crate::topology::CommandTargeting;
use shardgate_common::last_error::LastError;
use shardgate_common::protocol::document;
use shardgate_common::protocol::error::Result;
use shardgate_common::{
    Document, GetMoreMessage, KillCursorsMessage, Operation, QueryMessage, QueryOptions, Reply,
    WriteBatch,
};
use shardgate_metrics::{MetricsCollector, RouterMetricsCollector};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

const GET_LAST_ERROR: &str = "getlasterror";

/// Shardgate request router.
///
/// Accepts decoded client operations, decides which shards handle each one
/// and returns the reply the client should see. It owns the cursor cache,
/// the metrics collector and a background reaper that reclaims idle merged
/// cursors; everything else (topology, shard connections, command
/// execution, authorization) is reached through [`Collaborators`].
///
/// # Dispatch
///
/// | Operation                               | Handled by            |
/// |-----------------------------------------|-----------------------|
/// | query on `<db>.$cmd` / `<db>.$cmd.sys.*`| [`CommandRouter`]     |
/// | any other query                         | [`QueryRouter`]       |
/// | get-more                                | [`GetMoreRouter`]     |
/// | kill-cursors                            | [`GetMoreRouter`]     |
/// | insert / update / delete                | [`BatchWriter`]       |
///
/// # Errors
///
/// Query and get-more failures are returned as `Err`. Command and write
/// failures are reported inside reply documents or the connection's
/// [`LastError`]; the only command failure surfaced as `Err` is a topology
/// that stays stale through every retry.
pub struct Router {
    ctx: RouterContext,
    /// Background cursor reaper task, aborted on drop
    reaper_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Router {
    /// Creates a router with default configuration.
    ///
    /// Must be called inside a tokio runtime; the cursor reaper is spawned
    /// immediately.
    pub async fn new(collaborators: Collaborators) -> Result<Self> {
        Self::with_config(collaborators, RouterConfig::default()).await
    }

    /// Creates a router with a validated configuration.
    pub async fn with_config(collaborators: Collaborators, config: RouterConfig) -> Result<Self> {
        config.validate()?;

        let ctx = RouterContext::new(collaborators, config);
        let reaper = CursorReaper::new(
            Arc::clone(&ctx.cache),
            Arc::clone(&ctx.metrics),
            ctx.config.cursors.clone(),
        );
        let reaper_handle = reaper.spawn();

        info!(
            "Router initialized (command attempts: {}, idle cursor timeout: {:?})",
            ctx.config.command_retry.max_attempts,
            ctx.config.cursors.idle_timeout()
        );

        Ok(Self {
            ctx,
            reaper_handle: Some(reaper_handle),
        })
    }

    /// Handles one inbound operation.
    ///
    /// Writes and kill-cursors produce no reply (`Ok(None)`); their outcome
    /// is read back later through `getLastError` on the same connection.
    pub async fn handle(&self, op: Operation, last_error: &mut LastError) -> Result<Option<Reply>> {
        match op {
            Operation::Query(msg) => self.query(&msg, last_error).await.map(Some),
            Operation::GetMore(msg) => self.get_more(&msg).await.map(Some),
            Operation::KillCursors(msg) => {
                self.kill_cursors(&msg).await?;
                Ok(None)
            }
            Operation::Write(batch) => {
                self.write(&batch, last_error).await;
                Ok(None)
            }
        }
    }

    /// Routes a query message, sending command namespaces to the command path.
    pub async fn query(&self, msg: &QueryMessage, last_error: &LastError) -> Result<Reply> {
        if msg.ns.is_command() || msg.ns.is_special_command() {
            return self.command(msg, last_error).await;
        }

        let start = Instant::now();
        let result = QueryRouter::new(self.ctx.clone()).route(msg).await;
        self.ctx.metrics.record_call("query", start, result.is_ok());
        result
    }

    async fn command(&self, msg: &QueryMessage, last_error: &LastError) -> Result<Reply> {
        let start = Instant::now();

        let command = unwrap_command(&msg.query);
        let is_get_last_error = document::first_key(&command)
            .map(|name| name.eq_ignore_ascii_case(GET_LAST_ERROR))
            .unwrap_or(false);
        if is_get_last_error && msg.ns.is_command() {
            debug!("answering getLastError locally");
            self.ctx.metrics.record_call("command", start, true);
            return Ok(Reply::single(last_error.to_document()));
        }

        let result = CommandRouter::new(self.ctx.clone()).route(msg).await;
        self.ctx.metrics.record_call("command", start, result.is_ok());
        result
    }

    pub async fn get_more(&self, msg: &GetMoreMessage) -> Result<Reply> {
        let start = Instant::now();
        let result = GetMoreRouter::new(self.ctx.clone()).route(msg).await;
        self.ctx.metrics.record_call("getmore", start, result.is_ok());
        result
    }

    /// Closes cursors; returns how many ids were known.
    pub async fn kill_cursors(&self, msg: &KillCursorsMessage) -> Result<usize> {
        let start = Instant::now();
        let result = GetMoreRouter::new(self.ctx.clone()).kill_cursors(msg).await;
        self.ctx.metrics.record_call("killcursors", start, result.is_ok());
        result
    }

    pub async fn write(&self, batch: &WriteBatch, last_error: &mut LastError) -> WriteOutcome {
        let start = Instant::now();
        let outcome = BatchWriter::new(self.ctx.clone()).write(batch, last_error).await;
        self.ctx
            .metrics
            .record_call(batch.op_code().name(), start, !outcome.had_error());
        outcome
    }

    /// Runs a command on every shard owning `targeting`, without retry.
    pub async fn command_op(
        &self,
        db: &str,
        command: Document,
        options: QueryOptions,
        targeting: &CommandTargeting,
    ) -> Result<Vec<CommandResult>> {
        let start = Instant::now();
        let result = CommandRouter::new(self.ctx.clone())
            .command_op(db, command, options, targeting)
            .await;
        self.ctx.metrics.record_call("command", start, result.is_ok());
        result
    }

    pub fn metrics(&self) -> &Arc<RouterMetricsCollector> {
        &self.ctx.metrics
    }

    pub fn cursor_cache(&self) -> &Arc<CursorCache> {
        &self.ctx.cache
    }

    pub fn config(&self) -> &RouterConfig {
        &self.ctx.config
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper_handle.take() {
            handle.abort();
        }
    }
}
