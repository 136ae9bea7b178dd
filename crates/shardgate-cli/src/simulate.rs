//! Scripted workload against an in-memory cluster.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::json;
use shardgate_common::auth::Permissions;
use shardgate_common::last_error::LastError;
use shardgate_common::protocol::document::from_value;
use shardgate_common::{Document, GetMoreMessage, QueryMessage, WriteBatch, WriteOp};
use shardgate_metrics::{MetricsCollector, MetricsSnapshot};
use shardgate_router::{Router, RouterConfig};
use shardgate_sim::InMemoryCluster;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

pub const DATABASE: &str = "sim";
pub const COLLECTION: &str = "events";

/// Documents per insert batch.
const INSERT_CHUNK: usize = 500;

/// Shape of one simulation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationOptions {
    pub shards: usize,
    pub documents: usize,
    /// `n_to_return` for the query and every get-more; 0 lets the router pick.
    pub batch_size: i32,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            shards: 3,
            documents: 1000,
            batch_size: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuerySummary {
    pub documents: usize,
    pub distinct: usize,
    pub batches: usize,
    pub cursor_kind: &'static str,
}

/// What a simulation run observed.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub shards: usize,
    pub inserted: i64,
    pub distribution: BTreeMap<String, usize>,
    pub query: QuerySummary,
    pub count: i64,
    pub last_error: Document,
    pub metrics: MetricsSnapshot,
}

fn ns() -> String {
    format!("{}.{}", DATABASE, COLLECTION)
}

/// Inserts `documents` into a partitioned collection, reads them back
/// through a cursor and counts them with a command.
pub async fn run(options: &SimulationOptions, config: RouterConfig) -> Result<SimulationSummary> {
    if options.shards == 0 {
        bail!("a simulation needs at least one shard");
    }

    let cluster = InMemoryCluster::new(options.shards);
    cluster.partition(ns());
    let router = Router::with_config(cluster.collaborators(Permissions::root()), config)
        .await
        .context("failed to start router")?;
    let mut last_error = LastError::new();

    let inserted = insert_all(&router, options.documents, &mut last_error).await;
    info!("Inserted {} of {} document(s)", inserted, options.documents);

    let query = read_back(&router, options.batch_size, &last_error).await?;
    info!(
        "Read {} document(s) in {} batch(es) through a {} cursor",
        query.documents, query.batches, query.cursor_kind
    );

    let count_reply = router
        .query(
            &QueryMessage::command(DATABASE, from_value(json!({"count": COLLECTION}))),
            &last_error,
        )
        .await
        .context("count command failed")?;
    let count = count_reply
        .first()
        .and_then(|doc| doc.get("n"))
        .and_then(|n| n.as_i64())
        .unwrap_or(0);

    let gle = router
        .query(
            &QueryMessage::command(DATABASE, from_value(json!({"getLastError": 1}))),
            &last_error,
        )
        .await?;

    Ok(SimulationSummary {
        shards: options.shards,
        inserted,
        distribution: cluster.distribution(ns()).into_iter().collect(),
        query,
        count,
        last_error: gle.first().cloned().unwrap_or_default(),
        metrics: router.metrics().snapshot(),
    })
}

async fn insert_all(router: &Router, documents: usize, last_error: &mut LastError) -> i64 {
    let mut inserted = 0;
    let ids: Vec<usize> = (0..documents).collect();

    for chunk in ids.chunks(INSERT_CHUNK) {
        let ops = chunk
            .iter()
            .map(|&i| WriteOp::Insert {
                document: from_value(json!({"_id": i, "kind": i % 5})),
            })
            .collect();
        let outcome = router
            .write(&WriteBatch::new(ns(), false, ops), last_error)
            .await;
        debug!(batch = chunk.len(), n = outcome.total_n(), "insert batch done");
        inserted += outcome.total_n();
    }
    inserted
}

async fn read_back(router: &Router, batch_size: i32, last_error: &LastError) -> Result<QuerySummary> {
    let first = router
        .query(
            &QueryMessage::new(ns(), Document::new()).with_n_to_return(batch_size),
            last_error,
        )
        .await
        .context("query failed")?;

    let cursor_kind = if first.origin_host.is_some() {
        "pass-through"
    } else {
        "merged"
    };
    let mut seen = HashSet::new();
    let mut documents = 0;
    let mut batches = 1;
    let mut reply = first;

    loop {
        documents += reply.n_returned();
        seen.extend(reply.documents.iter().filter_map(|d| d.get("_id")).map(|id| id.to_string()));
        if !reply.has_cursor() {
            break;
        }
        reply = router
            .get_more(&GetMoreMessage::new(ns(), reply.cursor_id, batch_size))
            .await
            .context("get-more failed")?;
        batches += 1;
    }

    Ok(QuerySummary {
        documents,
        distinct: seen.len(),
        batches,
        cursor_kind,
    })
}
