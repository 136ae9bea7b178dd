//! Cursor Cache
//!
//! Registry of the cursors that outlive one request. A cursor id lives in
//! one of two disjoint spaces:
//!
//! - **merged**: a multi-shard cursor owned by this router, with its time
//!   budget and running document count
//! - **pass-through**: a single shard's own cursor id, remembered only so
//!   a later get-more can be relayed to the host that issued it. An
//!   abandoned reference is dropped once idle; the shard times out its own
//!   cursor.
//!
//! Both maps sit behind one `tokio::sync::RwLock`. Each merged cursor has
//! its own `Mutex`, so get-mores on one id are serialized while distinct
//! ids proceed independently.

use crate::config::CursorConfig;
use crate::topology::{Batch, MultiShardCursor};
use shardgate_common::protocol::error::{Result, ShardgateError};
use shardgate_common::{CursorId, Document, Namespace, QueryOptions};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

static CURSOR_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates a positive, non-zero cursor id.
///
/// The upper half comes from the clock and the lower half from a process
/// counter, so ids are unique within the process and unlikely to repeat
/// across restarts.
fn generate_cursor_id() -> CursorId {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let counter = CURSOR_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    ((timestamp & 0x7FFF_FFFF_0000_0000) | (counter & 0xFFFF_FFFF)) as CursorId
}

/// Time left to a merged cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorBudget {
    /// No `$maxTimeMS` was given.
    Unlimited,
    /// Milliseconds left, always positive.
    Remaining(u64),
    /// The budget ran out; the next get-more fails with `ExceededTimeLimit`.
    Expired,
}

impl CursorBudget {
    /// Budget left after the first batch of a query with hint `max_time_ms`.
    pub fn from_hint(max_time_ms: Option<u64>, elapsed: Duration) -> Self {
        match max_time_ms {
            None => CursorBudget::Unlimited,
            Some(ms) => CursorBudget::Remaining(ms).charge(elapsed),
        }
    }

    /// Deducts `elapsed`, clamping to `Expired`.
    pub fn charge(self, elapsed: Duration) -> Self {
        match self {
            CursorBudget::Remaining(ms) => {
                let spent = elapsed.as_millis() as u64;
                if spent >= ms {
                    CursorBudget::Expired
                } else {
                    CursorBudget::Remaining(ms - spent)
                }
            }
            other => other,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, CursorBudget::Expired)
    }
}

/// One batch served from a merged cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct ServedBatch {
    pub documents: Vec<Document>,
    /// Offset of the first document within the cursor's result set.
    pub starting_from: i32,
    pub has_more: bool,
}

/// A multi-shard cursor plus the router-side state that spans get-mores.
pub struct MergedCursor {
    id: CursorId,
    ns: Namespace,
    options: QueryOptions,
    cursor: Box<dyn MultiShardCursor>,
    total_sent: u64,
    budget: CursorBudget,
    last_accessed: Instant,
    done: bool,
    default_batch_size: usize,
    max_batch_bytes: usize,
}

impl MergedCursor {
    pub fn new(
        ns: Namespace,
        options: QueryOptions,
        cursor: Box<dyn MultiShardCursor>,
        config: &CursorConfig,
    ) -> Self {
        Self {
            id: 0,
            ns,
            options,
            cursor,
            total_sent: 0,
            budget: CursorBudget::Unlimited,
            last_accessed: Instant::now(),
            done: false,
            default_batch_size: config.default_batch_size,
            max_batch_bytes: config.max_batch_bytes,
        }
    }

    /// The id under which the cache stored this cursor, 0 before storing.
    pub fn id(&self) -> CursorId {
        self.id
    }

    pub fn ns(&self) -> &Namespace {
        &self.ns
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    pub fn budget(&self) -> CursorBudget {
        self.budget
    }

    pub fn set_budget(&mut self, budget: CursorBudget) {
        self.budget = budget;
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    /// Refreshes the idle clock.
    pub fn accessed(&mut self) {
        self.last_accessed = Instant::now();
    }

    /// Cursors opened with the no-timeout option are never reclaimed for
    /// idleness.
    pub fn is_reapable(&self) -> bool {
        !self.options.contains(QueryOptions::NO_CURSOR_TIMEOUT)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Pulls the next batch and advances `total_sent`.
    ///
    /// `n_to_return` follows the legacy convention:
    ///
    /// - `0`: the default batch size for a first batch, otherwise only the
    ///   byte limit applies
    /// - `> 0`: at most that many documents; more may follow
    /// - `< 0`: at most `|n|` documents, after which the cursor is finished
    pub async fn send_next_batch(&mut self, n_to_return: i32) -> Result<ServedBatch> {
        let starting_from = i32::try_from(self.total_sent).unwrap_or(i32::MAX);
        let first_batch = self.total_sent == 0;
        let single_batch = n_to_return < 0;

        let doc_limit = match n_to_return {
            0 if first_batch => Some(self.default_batch_size),
            0 => None,
            n => Some(n.unsigned_abs() as usize),
        };
        let byte_limit = if first_batch {
            self.max_batch_bytes
        } else {
            self.max_batch_bytes.saturating_mul(3)
        };

        let mut documents = Vec::new();
        let mut bytes = 0usize;
        let mut has_more = !self.done;

        while has_more {
            let want = match doc_limit {
                Some(limit) if documents.len() >= limit => break,
                Some(limit) => (limit - documents.len()).min(self.default_batch_size),
                None => self.default_batch_size,
            };
            if bytes > byte_limit {
                break;
            }

            let Batch {
                documents: chunk,
                has_more: more,
            } = self.cursor.next_batch(want).await?;
            bytes += chunk.iter().map(approximate_size).sum::<usize>();
            let empty = chunk.is_empty();
            documents.extend(chunk);
            has_more = more;

            if empty {
                break;
            }
        }

        if single_batch {
            has_more = false;
        }
        self.done = !has_more;
        self.total_sent += documents.len() as u64;

        trace!(
            cursor_id = self.id,
            returned = documents.len(),
            total_sent = self.total_sent,
            has_more,
            "served merged batch"
        );

        Ok(ServedBatch {
            documents,
            starting_from,
            has_more,
        })
    }

    pub async fn close(&mut self) {
        self.done = true;
        self.cursor.close().await;
    }
}

impl std::fmt::Debug for MergedCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergedCursor")
            .field("id", &self.id)
            .field("ns", &self.ns)
            .field("total_sent", &self.total_sent)
            .field("budget", &self.budget)
            .field("done", &self.done)
            .finish()
    }
}

fn approximate_size(doc: &Document) -> usize {
    serde_json::to_vec(doc).map(|bytes| bytes.len()).unwrap_or(0)
}

pub type SharedCursor = Arc<Mutex<MergedCursor>>;

/// Result of looking an id up in both spaces.
#[derive(Debug, Clone)]
pub enum CursorLookup {
    Merged(SharedCursor),
    /// Host that issued the pass-through cursor.
    Remote(String),
    NotFound,
}

struct RemoteRef {
    host: String,
    last_accessed: Instant,
}

#[derive(Default)]
struct CursorMaps {
    merged: HashMap<CursorId, SharedCursor>,
    remote: HashMap<CursorId, RemoteRef>,
}

/// Process-wide cursor registry, shared as `Arc<CursorCache>`.
#[derive(Default)]
pub struct CursorCache {
    maps: RwLock<CursorMaps>,
}

impl CursorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a merged cursor under a fresh id and returns the id.
    pub async fn store(&self, mut cursor: MergedCursor) -> CursorId {
        let mut maps = self.maps.write().await;
        let id = loop {
            let candidate = generate_cursor_id();
            if candidate != 0
                && !maps.merged.contains_key(&candidate)
                && !maps.remote.contains_key(&candidate)
            {
                break candidate;
            }
        };
        cursor.id = id;
        debug!(cursor_id = id, ns = %cursor.ns, budget = ?cursor.budget, "storing merged cursor");
        maps.merged.insert(id, Arc::new(Mutex::new(cursor)));
        id
    }

    /// Remembers that `id` belongs to a cursor on `host`.
    pub async fn register_ref(&self, id: CursorId, host: impl Into<String>) {
        let host = host.into();
        trace!(cursor_id = id, host = %host, "registering pass-through cursor");
        self.maps.write().await.remote.insert(
            id,
            RemoteRef {
                host,
                last_accessed: Instant::now(),
            },
        );
    }

    /// Marks a pass-through reference as used now.
    pub async fn touch_ref(&self, id: CursorId) {
        if let Some(remote) = self.maps.write().await.remote.get_mut(&id) {
            remote.last_accessed = Instant::now();
        }
    }

    /// Finds `id` in either space.
    ///
    /// An id present in both is an `InternalInconsistency`.
    pub async fn lookup(&self, id: CursorId) -> Result<CursorLookup> {
        let maps = self.maps.read().await;
        match (maps.merged.get(&id), maps.remote.get(&id)) {
            (Some(_), Some(remote)) => Err(ShardgateError::InternalInconsistency(format!(
                "duplicate merged and pass-through cursor id {} detected, duplicated on host {}",
                id, remote.host
            ))),
            (Some(cursor), None) => Ok(CursorLookup::Merged(Arc::clone(cursor))),
            (None, Some(remote)) => Ok(CursorLookup::Remote(remote.host.clone())),
            (None, None) => Ok(CursorLookup::NotFound),
        }
    }

    /// Removes a merged cursor, returning it.
    pub async fn remove(&self, id: CursorId) -> Option<SharedCursor> {
        self.maps.write().await.merged.remove(&id)
    }

    /// Removes a pass-through reference, returning its host.
    pub async fn remove_ref(&self, id: CursorId) -> Option<String> {
        self.maps.write().await.remote.remove(&id).map(|remote| remote.host)
    }

    pub async fn merged_count(&self) -> usize {
        self.maps.read().await.merged.len()
    }

    pub async fn ref_count(&self) -> usize {
        self.maps.read().await.remote.len()
    }

    /// Removes and returns merged cursors idle for at least `idle_timeout`.
    ///
    /// Cursors whose lock is held are in use and are skipped.
    pub async fn remove_idle(&self, idle_timeout: Duration) -> Vec<(CursorId, SharedCursor)> {
        let mut maps = self.maps.write().await;
        let idle: Vec<CursorId> = maps
            .merged
            .iter()
            .filter(|(_, cursor)| match cursor.try_lock() {
                Ok(cursor) => cursor.is_reapable() && cursor.last_accessed.elapsed() >= idle_timeout,
                Err(_) => false,
            })
            .map(|(id, _)| *id)
            .collect();

        idle.into_iter()
            .filter_map(|id| maps.merged.remove(&id).map(|cursor| (id, cursor)))
            .collect()
    }

    /// Drops pass-through references unused for at least `idle_timeout`,
    /// returning each dropped id with its host.
    pub async fn remove_idle_refs(&self, idle_timeout: Duration) -> Vec<(CursorId, String)> {
        let mut maps = self.maps.write().await;
        let idle: Vec<CursorId> = maps
            .remote
            .iter()
            .filter(|(_, remote)| remote.last_accessed.elapsed() >= idle_timeout)
            .map(|(id, _)| *id)
            .collect();

        idle.into_iter()
            .filter_map(|id| maps.remote.remove(&id).map(|remote| (id, remote.host)))
            .collect()
    }
}
