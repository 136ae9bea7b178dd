use crate::context::RouterContext;
use crate::cursor_cache::{CursorLookup, SharedCursor};
use shardgate_common::protocol::error::{Result, ShardgateError};
use shardgate_common::{CursorId, GetMoreMessage, KillCursorsMessage, Reply};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Continues cursors returned by earlier queries.
pub struct GetMoreRouter {
    ctx: RouterContext,
}

impl GetMoreRouter {
    pub fn new(ctx: RouterContext) -> Self {
        Self { ctx }
    }

    /// Serves the next batch of `msg.cursor_id`.
    ///
    /// An unknown id is not an error: the reply carries the
    /// `CURSOR_NOT_FOUND` flag and no documents.
    pub async fn route(&self, msg: &GetMoreMessage) -> Result<Reply> {
        let start = Instant::now();
        let id = msg.cursor_id;

        let lookup = self.ctx.cache.lookup(id).await?;
        self.ctx.authorize_get_more(&msg.ns, id)?;

        match lookup {
            CursorLookup::Remote(host) => {
                trace!(cursor_id = id, host = %host, "relaying get-more");
                let reply = self
                    .ctx
                    .collaborators
                    .connector
                    .get_more(&host, &msg.ns, id, msg.n_to_return)
                    .await?;
                if reply.cursor_id == 0 {
                    self.ctx.cache.remove_ref(id).await;
                } else {
                    self.ctx.cache.touch_ref(id).await;
                }
                Ok(reply)
            }
            CursorLookup::Merged(cursor) => self.serve_merged(id, cursor, msg.n_to_return, start).await,
            CursorLookup::NotFound => {
                debug!(cursor_id = id, ns = %msg.ns, "get-more for unknown cursor");
                Ok(Reply::cursor_not_found())
            }
        }
    }

    async fn serve_merged(
        &self,
        id: CursorId,
        handle: SharedCursor,
        n_to_return: i32,
        start: Instant,
    ) -> Result<Reply> {
        let mut cursor = handle.lock().await;

        // exhausted or killed while this call waited for the lock
        if cursor.is_done() {
            return Ok(Reply::cursor_not_found());
        }

        if cursor.budget().is_expired() {
            self.ctx.cache.remove(id).await;
            cursor.close().await;
            self.ctx.metrics.record_cursor_timed_out();
            debug!(cursor_id = id, "cursor exceeded its time limit");
            return Err(ShardgateError::ExceededTimeLimit);
        }

        let batch = cursor.send_next_batch(n_to_return).await?;

        if batch.has_more {
            cursor.accessed();
            let budget = cursor.budget().charge(start.elapsed());
            cursor.set_budget(budget);
            Ok(Reply::batch(batch.documents, batch.starting_from, id))
        } else {
            self.ctx.cache.remove(id).await;
            cursor.close().await;
            self.ctx.metrics.record_cursor_closed();
            trace!(cursor_id = id, total_sent = cursor.total_sent(), "cursor exhausted");
            Ok(Reply::batch(batch.documents, batch.starting_from, 0))
        }
    }

    /// Closes the given cursors and returns how many were known.
    ///
    /// Pass-through cursors are also killed on the host that owns them.
    pub async fn kill_cursors(&self, msg: &KillCursorsMessage) -> Result<usize> {
        let mut found = 0;

        for &id in &msg.cursor_ids {
            match self.ctx.cache.lookup(id).await {
                Ok(CursorLookup::Merged(_)) => {
                    if let Some(cursor) = self.ctx.cache.remove(id).await {
                        cursor.lock().await.close().await;
                        self.ctx.metrics.record_cursor_closed();
                        found += 1;
                    }
                }
                Ok(CursorLookup::Remote(host)) => {
                    self.ctx.cache.remove_ref(id).await;
                    if let Err(e) = self
                        .ctx
                        .collaborators
                        .connector
                        .kill_cursors(&host, &[id])
                        .await
                    {
                        warn!("Failed to kill cursor {} on {}: {}", id, host, e);
                    }
                    found += 1;
                }
                Ok(CursorLookup::NotFound) => {
                    debug!(cursor_id = id, "kill-cursors for unknown cursor");
                }
                Err(e) => {
                    warn!("Dropping inconsistent cursor {}: {}", id, e);
                    self.ctx.cache.remove_ref(id).await;
                    if let Some(cursor) = self.ctx.cache.remove(id).await {
                        cursor.lock().await.close().await;
                    }
                }
            }
        }

        Ok(found)
    }
}
