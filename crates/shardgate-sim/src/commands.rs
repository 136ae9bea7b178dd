use crate::cluster::{matches, ClusterState, InMemoryCluster};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use shardgate_common::protocol::document;
use shardgate_common::protocol::error::{Result, ShardgateError};
use shardgate_common::{Document, Namespace, QueryOptions};
use shardgate_router::CommandExecutor;
use tracing::debug;

const DUPLICATE_KEY: i32 = 11000;
const COMMAND_NOT_FOUND: i32 = 59;

fn ok(body: Value) -> Document {
    let mut doc = document::from_value(body);
    doc.insert("ok".into(), json!(1));
    doc
}

fn failure(errmsg: String, code: i32) -> Document {
    document::from_value(json!({"ok": 0, "errmsg": errmsg, "code": code}))
}

fn write_error(index: usize, code: i32, errmsg: impl Into<String>) -> Value {
    json!({"index": index, "code": code, "errmsg": errmsg.into()})
}

/// Runs `command` against `cmd_ns`, on one shard when `scope` is set and on
/// the whole cluster otherwise.
pub(crate) fn execute(
    state: &mut ClusterState,
    scope: Option<usize>,
    cmd_ns: &Namespace,
    command: &Document,
) -> Document {
    let Some(name) = document::first_key(command) else {
        return failure("empty command".into(), COMMAND_NOT_FOUND);
    };
    let coll = document::get_str(command, name).unwrap_or_default();
    let ns = Namespace::from_parts(cmd_ns.db(), coll);

    match name {
        "ping" => ok(json!({})),
        "count" => {
            let filter = document::get_document(command, "query")
                .cloned()
                .unwrap_or_default();
            let n: usize = shards_in_scope(state, scope, &ns)
                .into_iter()
                .map(|i| state.find(i, &ns, &filter).len())
                .sum();
            ok(json!({"n": n}))
        }
        "insert" => insert(state, &ns, command),
        "update" => update(state, &ns, command),
        "delete" => delete(state, &ns, command),
        other => failure(format!("no such cmd: {}", other), COMMAND_NOT_FOUND),
    }
}

fn shards_in_scope(state: &ClusterState, scope: Option<usize>, ns: &Namespace) -> Vec<usize> {
    match scope {
        Some(i) => vec![i],
        None => state.owners(ns),
    }
}

fn items<'a>(command: &'a Document, field: &str) -> Vec<&'a Map<String, Value>> {
    command
        .get(field)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

fn ordered(command: &Document) -> bool {
    command.get("ordered").and_then(Value::as_bool).unwrap_or(true)
}

fn insert(state: &mut ClusterState, ns: &Namespace, command: &Document) -> Document {
    let mut n = 0;
    let mut errors = Vec::new();

    for (index, doc) in items(command, "documents").into_iter().enumerate() {
        let mut doc = doc.clone();
        if !doc.contains_key("_id") {
            let id = state.new_object_id();
            doc.insert("_id".into(), json!(id));
        }

        let shard = state.placement(ns, &doc);
        let collection = state.shards[shard].collections.entry(ns.clone()).or_default();
        if collection.iter().any(|existing| existing.get("_id") == doc.get("_id")) {
            errors.push(write_error(
                index,
                DUPLICATE_KEY,
                format!("E11000 duplicate key error index: {}.$_id_", ns),
            ));
            if ordered(command) {
                break;
            }
            continue;
        }
        collection.push(doc);
        n += 1;
    }

    finish(json!({"n": n}), errors)
}

fn apply_update(doc: &mut Document, update: &Document) {
    let has_operators = update.keys().any(|k| k.starts_with('$'));
    if !has_operators {
        let id = doc.get("_id").cloned();
        *doc = update.clone();
        if let Some(id) = id {
            doc.insert("_id".into(), id);
        }
        return;
    }

    if let Some(set) = document::get_document(update, "$set") {
        for (key, value) in set {
            doc.insert(key.clone(), value.clone());
        }
    }
    if let Some(inc) = document::get_document(update, "$inc") {
        for (key, delta) in inc {
            let current = document::get_i64(doc, key).unwrap_or(0);
            let delta = delta.as_i64().unwrap_or(0);
            doc.insert(key.clone(), json!(current + delta));
        }
    }
}

fn update(state: &mut ClusterState, ns: &Namespace, command: &Document) -> Document {
    let mut n = 0;
    let mut n_modified = 0;
    let mut upserted = Vec::new();

    for (index, item) in items(command, "updates").into_iter().enumerate() {
        let selector = document::get_document(item, "q").cloned().unwrap_or_default();
        let change = document::get_document(item, "u").cloned().unwrap_or_default();
        let multi = item.get("multi").and_then(Value::as_bool).unwrap_or(false);
        let upsert = item.get("upsert").and_then(Value::as_bool).unwrap_or(false);

        let mut matched = 0;
        'shards: for shard in state.owners(ns) {
            let Some(collection) = state.shards[shard].collections.get_mut(ns) else {
                continue;
            };
            for doc in collection.iter_mut().filter(|d| matches(d, &selector)) {
                let before = doc.clone();
                apply_update(doc, &change);
                matched += 1;
                if *doc != before {
                    n_modified += 1;
                }
                if !multi {
                    break 'shards;
                }
            }
        }

        if matched == 0 && upsert {
            let mut doc: Document = selector
                .iter()
                .filter(|(k, _)| !k.starts_with('$'))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            apply_update(&mut doc, &change);
            if !doc.contains_key("_id") {
                let id = state.new_object_id();
                doc.insert("_id".into(), json!(id));
            }
            let id = doc.get("_id").cloned().unwrap_or(Value::Null);
            upserted.push(json!({"index": index, "_id": id}));
            let shard = state.placement(ns, &doc);
            state.shards[shard]
                .collections
                .entry(ns.clone())
                .or_default()
                .push(doc);
            matched = 1;
        }
        n += matched;
    }

    let mut body = json!({"n": n, "nModified": n_modified});
    if !upserted.is_empty() {
        body["upserted"] = Value::Array(upserted);
    }
    finish(body, Vec::new())
}

fn delete(state: &mut ClusterState, ns: &Namespace, command: &Document) -> Document {
    let mut n = 0;

    for item in items(command, "deletes") {
        let selector = document::get_document(item, "q").cloned().unwrap_or_default();
        let limit_one = document::get_i64(item, "limit") == Some(1);

        for shard in state.owners(ns) {
            let Some(collection) = state.shards[shard].collections.get_mut(ns) else {
                continue;
            };
            if limit_one {
                if let Some(pos) = collection.iter().position(|d| matches(d, &selector)) {
                    collection.remove(pos);
                    n += 1;
                    break;
                }
            } else {
                let before = collection.len();
                collection.retain(|d| !matches(d, &selector));
                n += before - collection.len();
            }
        }
    }

    finish(json!({"n": n}), Vec::new())
}

fn finish(body: Value, errors: Vec<Value>) -> Document {
    let mut reply = ok(body);
    if !errors.is_empty() {
        reply.insert("writeErrors".into(), Value::Array(errors));
    }
    reply
}

#[async_trait]
impl CommandExecutor for InMemoryCluster {
    async fn run(&self, ns: &Namespace, command: &Document, _options: QueryOptions) -> Result<Document> {
        let mut state = self.lock();
        let name = document::first_key(command).unwrap_or_default().to_string();
        state.log.commands.push((ns.to_string(), name.clone()));

        if ClusterState::take_stale(&mut state.stale_commands, &name) {
            let coll = document::get_str(command, &name).unwrap_or_default();
            let stale_ns = if coll.is_empty() {
                String::new()
            } else {
                Namespace::from_parts(ns.db(), coll).to_string()
            };
            debug!(command = %name, ns = %stale_ns, "injected stale topology");
            return Err(ShardgateError::StaleTopology { namespace: stale_ns });
        }

        Ok(execute(&mut state, None, ns, command))
    }
}
