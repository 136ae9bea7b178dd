//! End-to-end routing against an in-memory cluster.

use serde_json::{json, Value};
use shardgate_common::auth::Permissions;
use shardgate_common::last_error::LastError;
use shardgate_common::protocol::document::from_value;
use shardgate_common::protocol::error::ShardgateError;
use shardgate_common::{
    Document, GetMoreMessage, KillCursorsMessage, QueryMessage, Reply, ResultFlags, WriteBatch,
    WriteOp,
};
use shardgate_metrics::MetricsCollector;
use shardgate_router::{Router, RouterConfig};
use shardgate_sim::InMemoryCluster;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const EVENTS: &str = "app.events";
const USERS: &str = "app.users";

fn docs(range: std::ops::Range<i64>) -> Vec<Document> {
    range.map(|i| from_value(json!({"_id": i, "kind": i % 3}))).collect()
}

fn cluster(shards: usize) -> InMemoryCluster {
    let cluster = InMemoryCluster::new(shards);
    cluster.partition(EVENTS);
    cluster.seed(EVENTS, docs(0..500));
    cluster.seed(USERS, docs(0..250));
    cluster
}

async fn router(cluster: &InMemoryCluster) -> Router {
    Router::new(cluster.collaborators(Permissions::root()))
        .await
        .unwrap()
}

fn ids(reply: &Reply) -> Vec<i64> {
    reply
        .documents
        .iter()
        .map(|d| d["_id"].as_i64().unwrap())
        .collect()
}

/// Follows a cursor until the router reports it exhausted.
async fn drain(router: &Router, ns: &str, first: Reply, n_to_return: i32) -> Vec<i64> {
    let mut seen = ids(&first);
    let mut expected_from = first.n_returned() as i32;
    let mut cursor_id = first.cursor_id;

    while cursor_id != 0 {
        let reply = router
            .get_more(&GetMoreMessage::new(ns, cursor_id, n_to_return))
            .await
            .unwrap();
        assert!(!reply.flags.contains(ResultFlags::CURSOR_NOT_FOUND));
        if reply.origin_host.is_none() {
            assert_eq!(reply.starting_from, expected_from);
        }
        expected_from += reply.n_returned() as i32;
        seen.extend(ids(&reply));
        cursor_id = reply.cursor_id;
    }
    seen
}

#[tokio::test]
async fn test_merged_cursor_serves_every_document_once() {
    let cluster = cluster(3);
    let router = router(&cluster).await;

    let first = router
        .query(&QueryMessage::new(EVENTS, Document::new()).with_n_to_return(64), &LastError::new())
        .await
        .unwrap();
    assert_eq!(first.n_returned(), 64);
    assert!(first.has_cursor());
    assert!(first.origin_host.is_none());

    let seen = drain(&router, EVENTS, first, 64).await;
    assert_eq!(seen.len(), 500);
    assert_eq!(seen.iter().copied().collect::<HashSet<_>>().len(), 500);
    assert_eq!(seen, (0..500).collect::<Vec<_>>());

    assert_eq!(router.cursor_cache().merged_count().await, 0);
    let snapshot = router.metrics().snapshot();
    assert_eq!(snapshot.cursors.opened, 1);
    assert_eq!(snapshot.cursors.closed, 1);
    assert_eq!(cluster.log().closed_merged, 1);
}

#[tokio::test]
async fn test_default_first_batch_size() {
    let cluster = cluster(2);
    let router = router(&cluster).await;

    let first = router
        .query(&QueryMessage::new(EVENTS, Document::new()), &LastError::new())
        .await
        .unwrap();
    assert_eq!(first.n_returned(), 101);
    assert!(first.has_cursor());
}

#[tokio::test]
async fn test_hard_limit_closes_cursor() {
    let cluster = cluster(2);
    let router = router(&cluster).await;

    let reply = router
        .query(&QueryMessage::new(EVENTS, Document::new()).with_n_to_return(-5), &LastError::new())
        .await
        .unwrap();
    assert_eq!(reply.n_returned(), 5);
    assert_eq!(reply.cursor_id, 0);
    assert_eq!(router.cursor_cache().merged_count().await, 0);
}

#[tokio::test]
async fn test_time_limited_cursor_expires() {
    let cluster = cluster(2);
    cluster.set_batch_latency(Duration::from_millis(60));
    let router = router(&cluster).await;

    let query = from_value(json!({"$query": {}, "$maxTimeMS": 50}));
    let first = router
        .query(&QueryMessage::new(EVENTS, query).with_n_to_return(10), &LastError::new())
        .await
        .unwrap();
    assert!(first.has_cursor());

    let err = router
        .get_more(&GetMoreMessage::new(EVENTS, first.cursor_id, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, ShardgateError::ExceededTimeLimit));
    assert_eq!(err.code(), 50);

    let reply = router
        .get_more(&GetMoreMessage::new(EVENTS, first.cursor_id, 10))
        .await
        .unwrap();
    assert!(reply.flags.contains(ResultFlags::CURSOR_NOT_FOUND));
    assert_eq!(router.metrics().snapshot().cursors.timed_out, 1);
}

#[tokio::test]
async fn test_client_idle_time_is_not_charged_to_budget() {
    let cluster = cluster(2);
    let router = router(&cluster).await;

    let query = from_value(json!({"$query": {}, "$maxTimeMS": 100}));
    let first = router
        .query(&QueryMessage::new(EVENTS, query).with_n_to_return(10), &LastError::new())
        .await
        .unwrap();
    assert!(first.has_cursor());

    // only time spent inside the router counts, so this under-counts the
    // wall clock on purpose
    tokio::time::sleep(Duration::from_millis(300)).await;

    let reply = router
        .get_more(&GetMoreMessage::new(EVENTS, first.cursor_id, 10))
        .await
        .unwrap();
    assert!(!reply.flags.contains(ResultFlags::CURSOR_NOT_FOUND));
    assert_eq!(reply.n_returned(), 10);
    assert_eq!(reply.starting_from, 10);
    assert_eq!(router.metrics().snapshot().cursors.timed_out, 0);
}

#[tokio::test]
async fn test_generous_time_limit_is_not_hit() {
    let cluster = cluster(2);
    let router = router(&cluster).await;

    let query = from_value(json!({"$query": {}, "$maxTimeMS": 60_000}));
    let first = router
        .query(&QueryMessage::new(EVENTS, query).with_n_to_return(100), &LastError::new())
        .await
        .unwrap();
    let seen = drain(&router, EVENTS, first, 100).await;
    assert_eq!(seen.len(), 500);
}

#[tokio::test]
async fn test_unlimited_cursor_survives_slow_batches() {
    let cluster = cluster(2);
    cluster.set_batch_latency(Duration::from_millis(15));
    let router = router(&cluster).await;

    let first = router
        .query(&QueryMessage::new(EVENTS, Document::new()).with_n_to_return(100), &LastError::new())
        .await
        .unwrap();
    let seen = drain(&router, EVENTS, first, 100).await;
    assert_eq!(seen.len(), 500);
    assert_eq!(router.metrics().snapshot().cursors.timed_out, 0);
}

#[tokio::test]
async fn test_filtered_merged_query() {
    let cluster = cluster(3);
    let router = router(&cluster).await;

    let first = router
        .query(
            &QueryMessage::new(EVENTS, from_value(json!({"kind": 0}))).with_n_to_return(20),
            &LastError::new(),
        )
        .await
        .unwrap();
    let seen = drain(&router, EVENTS, first, 20).await;
    assert_eq!(seen, (0..500).filter(|i| i % 3 == 0).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_explain_returns_plan_without_cursor() {
    let cluster = cluster(2);
    let router = router(&cluster).await;

    let query = from_value(json!({"$query": {}, "$explain": true}));
    let reply = router
        .query(&QueryMessage::new(EVENTS, query), &LastError::new())
        .await
        .unwrap();
    assert_eq!(reply.cursor_id, 0);
    let plan = reply.first().unwrap();
    assert_eq!(plan["clusteredType"], json!("ParallelSort"));
    assert!(plan.contains_key("millis"));
    assert_eq!(router.cursor_cache().merged_count().await, 0);
}

#[tokio::test]
async fn test_single_shard_cursor_passes_through() {
    let cluster = cluster(2);
    let router = router(&cluster).await;

    let first = router
        .query(&QueryMessage::new(USERS, Document::new()).with_n_to_return(100), &LastError::new())
        .await
        .unwrap();
    assert_eq!(first.n_returned(), 100);
    assert_eq!(first.origin_host.as_deref(), Some("shard0.sim:27018"));
    assert_eq!(router.cursor_cache().ref_count().await, 1);
    assert_eq!(router.cursor_cache().merged_count().await, 0);

    let seen = drain(&router, USERS, first, 100).await;
    assert_eq!(seen, (0..250).collect::<Vec<_>>());
    assert_eq!(router.cursor_cache().ref_count().await, 0);
    assert_eq!(cluster.open_shard_cursors(), 0);
}

#[tokio::test]
async fn test_kill_cursors_on_both_paths() {
    let cluster = cluster(2);
    let router = router(&cluster).await;
    let last_error = LastError::new();

    let merged = router
        .query(&QueryMessage::new(EVENTS, Document::new()).with_n_to_return(10), &last_error)
        .await
        .unwrap();
    let remote = router
        .query(&QueryMessage::new(USERS, Document::new()).with_n_to_return(10), &last_error)
        .await
        .unwrap();
    assert_eq!(cluster.open_shard_cursors(), 1);

    let killed = router
        .kill_cursors(&KillCursorsMessage {
            cursor_ids: vec![merged.cursor_id, remote.cursor_id, 424242],
        })
        .await
        .unwrap();
    assert_eq!(killed, 2);
    assert_eq!(cluster.open_shard_cursors(), 0);
    assert_eq!(
        cluster.log().killed_cursors,
        vec![("shard0.sim:27018".to_string(), remote.cursor_id)]
    );
    assert_eq!(cluster.log().closed_merged, 1);

    for id in [merged.cursor_id, remote.cursor_id] {
        let reply = router
            .get_more(&GetMoreMessage::new(EVENTS, id, 10))
            .await
            .unwrap();
        assert!(reply.flags.contains(ResultFlags::CURSOR_NOT_FOUND));
    }
}

#[tokio::test]
async fn test_concurrent_get_mores_on_distinct_cursors() {
    let cluster = cluster(3);
    let router = Arc::new(router(&cluster).await);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let router = Arc::clone(&router);
        handles.push(tokio::spawn(async move {
            let first = router
                .query(&QueryMessage::new(EVENTS, Document::new()).with_n_to_return(25), &LastError::new())
                .await
                .unwrap();
            drain(&router, EVENTS, first, 40).await
        }));
    }

    for handle in handles {
        let seen = handle.await.unwrap();
        assert_eq!(seen, (0..500).collect::<Vec<_>>());
    }
    assert_eq!(router.metrics().snapshot().cursors.opened, 4);
    assert_eq!(router.cursor_cache().merged_count().await, 0);
}

#[tokio::test]
async fn test_index_listing_goes_to_metadata_shard() {
    let cluster = cluster(2);
    let router = router(&cluster).await;

    let reply = router
        .query(
            &QueryMessage::new("app.system.indexes", from_value(json!({"ns": EVENTS}))),
            &LastError::new(),
        )
        .await
        .unwrap();
    assert_eq!(reply.n_returned(), 1);
    assert_eq!(reply.first().unwrap()["name"], json!("_id_"));
    assert_eq!(router.metrics().snapshot().shards.len(), 1);
}

#[tokio::test]
async fn test_stale_index_listing_is_reported() {
    let cluster = cluster(2);
    cluster.inject_stale_index_query(USERS, 1);
    let router = router(&cluster).await;
    let msg = QueryMessage::new("app.system.indexes", from_value(json!({"ns": USERS})));

    let err = router.query(&msg, &LastError::new()).await.unwrap_err();
    assert!(err.is_stale_topology());
    assert_eq!(err.code(), 13388);

    assert!(router.query(&msg, &LastError::new()).await.is_ok());
}

#[tokio::test]
async fn test_stale_query_is_not_retried() {
    let cluster = cluster(2);
    cluster.inject_stale_query(EVENTS, 1);
    let router = router(&cluster).await;

    let err = router
        .query(&QueryMessage::new(EVENTS, Document::new()), &LastError::new())
        .await
        .unwrap_err();
    assert!(err.is_stale_topology());
    assert!(cluster.log().refreshes.is_empty());
}

#[tokio::test]
async fn test_command_retries_through_stale_topology() {
    let cluster = cluster(2);
    cluster.inject_stale_command("count", 2);
    let router = router(&cluster).await;

    let reply = router
        .query(
            &QueryMessage::command("app", from_value(json!({"count": "events"}))),
            &LastError::new(),
        )
        .await
        .unwrap();
    assert_eq!(reply.first().unwrap()["n"], json!(500));

    let log = cluster.log();
    assert_eq!(log.refreshes, vec![EVENTS.to_string(); 2]);
    assert_eq!(log.version_checks.len(), 2);
    assert_eq!(log.commands.len(), 3);
}

#[tokio::test]
async fn test_command_gives_up_after_configured_attempts() {
    let cluster = cluster(2);
    cluster.inject_stale_command("count", 100);
    let router = router(&cluster).await;

    let err = router
        .query(
            &QueryMessage::command("app", from_value(json!({"count": "events"}))),
            &LastError::new(),
        )
        .await
        .unwrap_err();
    assert!(err.is_stale_topology());

    let log = cluster.log();
    assert_eq!(log.commands.len(), 5);
    assert_eq!(log.refreshes, vec![EVENTS.to_string(); 4]);
}

#[tokio::test]
async fn test_fewer_attempts_from_config() {
    let cluster = cluster(2);
    cluster.inject_stale_command("count", 100);
    let router = Router::with_config(
        cluster.collaborators(Permissions::root()),
        RouterConfig::default().with_max_command_attempts(2),
    )
    .await
    .unwrap();

    let msg = QueryMessage::command("app", from_value(json!({"count": "events"})));
    assert!(router.query(&msg, &LastError::new()).await.is_err());
    assert_eq!(cluster.log().commands.len(), 2);
    assert_eq!(cluster.log().refreshes.len(), 1);
}

#[tokio::test]
async fn test_wrapped_command_is_unwrapped() {
    let cluster = cluster(2);
    let router = router(&cluster).await;

    let wrapped = from_value(json!({
        "$query": {"count": "events", "query": {"kind": 1}},
        "$readPreference": {"mode": "secondary"},
    }));
    let reply = router
        .query(&QueryMessage::command("app", wrapped), &LastError::new())
        .await
        .unwrap();
    assert_eq!(reply.first().unwrap()["n"], json!(167));
    assert_eq!(
        cluster.log().commands,
        vec![("app.$cmd".to_string(), "count".to_string())]
    );
}

#[tokio::test]
async fn test_command_failure_is_reported_in_reply() {
    let cluster = cluster(1);
    let router = router(&cluster).await;

    let reply = router
        .query(
            &QueryMessage::command("app", from_value(json!({"frobnicate": 1}))),
            &LastError::new(),
        )
        .await
        .unwrap();
    let doc = reply.first().unwrap();
    assert_eq!(doc["ok"], json!(0));
    assert_eq!(doc["code"], json!(59));
}

#[tokio::test]
async fn test_metrics_command_is_answered_locally() {
    let cluster = cluster(1);
    let router = router(&cluster).await;
    let last_error = LastError::new();

    router
        .query(&QueryMessage::new(USERS, Document::new()), &last_error)
        .await
        .unwrap();
    let reply = router
        .query(&QueryMessage::command("admin", from_value(json!({"_metrics": 1}))), &last_error)
        .await
        .unwrap();
    let doc = reply.first().unwrap();
    assert_eq!(doc["ok"], json!(1));
    assert!(doc.contains_key("operations"));
    assert!(cluster.log().commands.is_empty());
}

fn inserts(ids: &[i64]) -> Vec<WriteOp> {
    ids.iter()
        .map(|id| WriteOp::Insert {
            document: from_value(json!({"_id": id})),
        })
        .collect()
}

#[tokio::test]
async fn test_ordered_insert_stops_at_duplicate() {
    let cluster = InMemoryCluster::new(2);
    let router = router(&cluster).await;
    let mut last_error = LastError::new();

    let outcome = router
        .write(&WriteBatch::new("app.logs", true, inserts(&[1, 1, 2])), &mut last_error)
        .await;
    assert!(outcome.had_error());
    assert_eq!(outcome.total_n(), 1);
    assert_eq!(cluster.documents("app.logs").len(), 1);

    let gle = router
        .query(
            &QueryMessage::command("app", from_value(json!({"getlasterror": 1}))),
            &last_error,
        )
        .await
        .unwrap();
    assert_eq!(gle.first().unwrap()["code"], json!(11000));
}

#[tokio::test]
async fn test_unordered_insert_continues_past_duplicate() {
    let cluster = InMemoryCluster::new(2);
    let router = router(&cluster).await;
    let mut last_error = LastError::new();

    let outcome = router
        .write(&WriteBatch::new("app.logs", false, inserts(&[1, 1, 2])), &mut last_error)
        .await;
    assert!(outcome.had_error());
    assert_eq!(outcome.total_n(), 2);
    assert_eq!(cluster.documents("app.logs").len(), 2);
    assert!(last_error.had_error());
    assert_eq!(router.metrics().snapshot().inserted_documents, 2);
}

#[tokio::test]
async fn test_mixed_batch_runs_one_command_per_run() {
    let cluster = InMemoryCluster::new(1);
    cluster.seed("app.logs", vec![from_value(json!({"_id": 1, "hits": 0}))]);
    let router = router(&cluster).await;
    let mut last_error = LastError::new();

    let mut ops = inserts(&[2, 3]);
    ops.push(WriteOp::Update {
        selector: from_value(json!({"_id": 1})),
        update: from_value(json!({"$inc": {"hits": 1}})),
        upsert: false,
        multi: false,
    });
    ops.push(WriteOp::Delete {
        selector: from_value(json!({"_id": 3})),
        limit: 1,
    });

    let outcome = router
        .write(&WriteBatch::new("app.logs", true, ops), &mut last_error)
        .await;
    assert!(!outcome.had_error());
    assert_eq!(outcome.responses.len(), 3);

    let names: Vec<String> = cluster.log().commands.into_iter().map(|(_, name)| name).collect();
    assert_eq!(names, vec!["insert", "update", "delete"]);

    let remaining = cluster.documents("app.logs");
    assert_eq!(remaining.len(), 2);
    assert_eq!(remaining[0]["hits"], json!(1));

    let doc = last_error.to_document();
    assert_eq!(doc["n"], json!(1));
    assert_eq!(doc["err"], Value::Null);
}

#[tokio::test]
async fn test_upsert_reports_new_id() {
    let cluster = InMemoryCluster::new(1);
    let router = router(&cluster).await;
    let mut last_error = LastError::new();

    let ops = vec![WriteOp::Update {
        selector: from_value(json!({"_id": 9})),
        update: from_value(json!({"$set": {"name": "ada"}})),
        upsert: true,
        multi: false,
    }];
    router
        .write(&WriteBatch::new("app.users", true, ops), &mut last_error)
        .await;

    let doc = last_error.to_document();
    assert_eq!(doc["upserted"], json!(9));
    assert_eq!(doc["updatedExisting"], json!(false));
    assert_eq!(cluster.documents("app.users")[0]["name"], json!("ada"));
}

#[tokio::test]
async fn test_inprog_merges_every_shard() {
    let cluster = cluster(2);
    cluster.add_inprog(
        "shard0",
        from_value(json!({"opid": 3, "op": "query", "client": "10.0.0.1:5000"})),
    );
    cluster.add_inprog("shard1", from_value(json!({"opid": 8, "op": "insert"})));
    let router = router(&cluster).await;

    let reply = router
        .query(&QueryMessage::new("admin.$cmd.sys.inprog", Document::new()), &LastError::new())
        .await
        .unwrap();
    let ops = reply.first().unwrap()["inprog"].as_array().unwrap().clone();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0]["opid"], json!("shard0:3"));
    assert_eq!(ops[0]["client_s"], json!("10.0.0.1:5000"));
    assert!(ops[0].get("client").is_none());
    assert_eq!(ops[1]["opid"], json!("shard1:8"));
}

#[tokio::test]
async fn test_killop_is_forwarded_to_owning_shard() {
    let cluster = cluster(2);
    cluster.add_inprog("shard1", from_value(json!({"opid": 8, "op": "insert"})));
    let router = router(&cluster).await;
    let last_error = LastError::new();

    let reply = router
        .query(
            &QueryMessage::new("admin.$cmd.sys.killop", from_value(json!({"op": "shard1:8"}))),
            &last_error,
        )
        .await
        .unwrap();
    let doc = reply.first().unwrap();
    assert_eq!(doc["shard"], json!("shard1"));
    assert_eq!(doc["shardid"], json!(8));
    assert_eq!(cluster.log().killed_ops, vec![("shard1".to_string(), 8)]);

    let reply = router
        .query(
            &QueryMessage::new("admin.$cmd.sys.killop", from_value(json!({"op": "shard1"}))),
            &last_error,
        )
        .await
        .unwrap();
    assert_eq!(reply.first().unwrap()["err"], json!("bad opid"));
    assert_eq!(cluster.log().killed_ops.len(), 1);
}

#[tokio::test]
async fn test_read_only_user_cannot_list_operations() {
    let cluster = cluster(2);
    let router = Router::new(cluster.collaborators(Permissions::read_only()))
        .await
        .unwrap();

    let err = router
        .query(&QueryMessage::new("admin.$cmd.sys.inprog", Document::new()), &LastError::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ShardgateError::Unauthorized(_)));

    // reads still work
    assert!(router
        .query(&QueryMessage::new(USERS, Document::new()), &LastError::new())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_query_outside_granted_database_is_denied() {
    let cluster = cluster(2);
    let permissions = Permissions::read_only().with_database("reporting");
    let router = Router::new(cluster.collaborators(permissions)).await.unwrap();

    let err = router
        .query(&QueryMessage::new(USERS, Document::new()), &LastError::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), 13);
    assert_eq!(router.metrics().snapshot().failed_operations, 1);
}

#[tokio::test]
async fn test_idle_cursor_is_reaped() {
    let cluster = cluster(2);
    let config = RouterConfig::default()
        .with_idle_timeout(Duration::from_millis(20))
        .with_reap_interval(Duration::from_millis(10));
    let router = Router::with_config(cluster.collaborators(Permissions::root()), config)
        .await
        .unwrap();

    let first = router
        .query(&QueryMessage::new(EVENTS, Document::new()).with_n_to_return(10), &LastError::new())
        .await
        .unwrap();
    assert!(first.has_cursor());

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(router.cursor_cache().merged_count().await, 0);
    assert_eq!(router.metrics().snapshot().cursors.timed_out, 1);
    let reply = router
        .get_more(&GetMoreMessage::new(EVENTS, first.cursor_id, 10))
        .await
        .unwrap();
    assert!(reply.flags.contains(ResultFlags::CURSOR_NOT_FOUND));
}

#[tokio::test]
async fn test_abandoned_single_shard_cursors_are_forgotten() {
    let cluster = cluster(2);
    let config = RouterConfig::default()
        .with_idle_timeout(Duration::from_millis(20))
        .with_reap_interval(Duration::from_millis(10));
    let router = Router::with_config(cluster.collaborators(Permissions::root()), config)
        .await
        .unwrap();

    let mut cursor_ids = Vec::new();
    for _ in 0..20 {
        let reply = router
            .query(&QueryMessage::new(USERS, Document::new()).with_n_to_return(10), &LastError::new())
            .await
            .unwrap();
        assert!(reply.has_cursor());
        assert!(reply.origin_host.is_some());
        cursor_ids.push(reply.cursor_id);
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(router.cursor_cache().ref_count().await, 0);
    let reply = router
        .get_more(&GetMoreMessage::new(USERS, cursor_ids[0], 10))
        .await
        .unwrap();
    assert!(reply.flags.contains(ResultFlags::CURSOR_NOT_FOUND));
}
