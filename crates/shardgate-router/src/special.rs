//! Reserved diagnostic namespaces, `<db>.$cmd.sys.<name>`.
//!
//! These predate the command path and are answered by fanning the raw
//! query out to shards and stitching the answers together.

use crate::context::RouterContext;
use serde_json::{json, Value};
use shardgate_common::auth::ActionType;
use shardgate_common::protocol::error::{Result, ShardgateError};
use shardgate_common::{Document, QueryMessage};
use tracing::{info, warn};

pub const INPROG: &str = "inprog";
pub const KILLOP: &str = "killop";
pub const UNLOCK: &str = "unlock";

/// Answers a reserved diagnostic query.
///
/// Returns `Ok(None)` for names this router does not know, which then go
/// through normal command dispatch.
pub async fn handle(ctx: &RouterContext, name: &str, msg: &QueryMessage) -> Result<Option<Document>> {
    match name {
        INPROG => inprog(ctx, msg).await.map(Some),
        KILLOP => killop(ctx, msg).await.map(Some),
        UNLOCK => {
            let mut reply = Document::new();
            reply.insert("err".into(), json!("can't do unlock through shardgate"));
            Ok(Some(reply))
        }
        _ => {
            warn!("unknown sys command [{}]", name);
            Ok(None)
        }
    }
}

async fn inprog(ctx: &RouterContext, msg: &QueryMessage) -> Result<Document> {
    if !ctx.authorize_cluster_action(ActionType::Inprog, &msg.ns, &msg.query) {
        return Err(ShardgateError::Unauthorized("not authorized to run inprog".into()));
    }

    let mut ops = Vec::new();
    for shard in ctx.collaborators.topology.all_shards().await? {
        ctx.metrics.record_shard_request(&shard.name);
        let reply = ctx
            .collaborators
            .connector
            .find_one(&shard, &msg.ns, &msg.query)
            .await?;

        let Some(Value::Array(entries)) = reply.as_ref().and_then(|r| r.get("inprog")) else {
            continue;
        };
        for entry in entries {
            if let Value::Object(op) = entry {
                ops.push(Value::Object(tag_op(&shard.name, op)));
            }
        }
    }

    let mut reply = Document::new();
    reply.insert("inprog".into(), Value::Array(ops));
    Ok(reply)
}

/// Qualifies a shard-local operation for the cluster-wide listing.
fn tag_op(shard: &str, op: &Document) -> Document {
    let mut tagged = Document::new();
    for (key, value) in op {
        match key.as_str() {
            "opid" => {
                let local = value.as_i64().or_else(|| value.as_f64().map(|f| f as i64)).unwrap_or(0) as i32;
                tagged.insert("opid".into(), json!(format!("{}:{}", shard, local)));
            }
            "client" => {
                tagged.insert("client_s".into(), value.clone());
            }
            _ => {
                tagged.insert(key.clone(), value.clone());
            }
        }
    }
    tagged
}

/// A parsed killop operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOpTarget {
    /// Operand is not a string.
    BadOp,
    /// Operand is a string but not `<shard>:<localOpId>`.
    BadOpId,
    Op { shard: String, op_id: i32 },
}

pub fn parse_killop_operand(op: Option<&Value>) -> KillOpTarget {
    let Some(Value::String(op)) = op else {
        return KillOpTarget::BadOp;
    };
    let Some((shard, local)) = op.split_once(':') else {
        return KillOpTarget::BadOpId;
    };
    match local.trim().parse::<i32>() {
        Ok(op_id) => KillOpTarget::Op {
            shard: shard.to_string(),
            op_id,
        },
        Err(_) => KillOpTarget::BadOpId,
    }
}

async fn killop(ctx: &RouterContext, msg: &QueryMessage) -> Result<Document> {
    if !ctx.authorize_cluster_action(ActionType::Killop, &msg.ns, &msg.query) {
        return Err(ShardgateError::Unauthorized("not authorized to run killop".into()));
    }

    let operand = msg.query.get("op");
    let echo = operand.cloned().unwrap_or(Value::Null);
    let mut reply = Document::new();

    match parse_killop_operand(operand) {
        KillOpTarget::BadOp => {
            reply.insert("err".into(), json!("bad op"));
            reply.insert("op".into(), echo);
        }
        KillOpTarget::BadOpId => {
            reply.insert("op".into(), echo);
            reply.insert("err".into(), json!("bad opid"));
        }
        KillOpTarget::Op { shard, op_id } => {
            reply.insert("op".into(), echo.clone());
            reply.insert("shard".into(), json!(shard));
            reply.insert("shardid".into(), json!(op_id));

            info!("want to kill op: {}", echo);
            match ctx.collaborators.topology.shard(&shard).await? {
                Some(target) => {
                    let mut kill = Document::new();
                    kill.insert("op".into(), json!(op_id));
                    ctx.metrics.record_shard_request(&target.name);
                    ctx.collaborators
                        .connector
                        .find_one(&target, &msg.ns, &kill)
                        .await?;
                }
                None => {
                    warn!("killop for unknown shard {}", shard);
                    reply.insert("err".into(), json!("unknown shard"));
                }
            }
        }
    }

    Ok(reply)
}
