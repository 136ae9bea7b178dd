//! Batch Writer
//!
//! Legacy insert/update/delete messages are executed as write commands.
//! Consecutive operations of one kind become one `insert`, `update` or
//! `delete` command sent to the collection's `<db>.$cmd`, and the outcome
//! of each command is folded back into the connection's [`LastError`] so
//! that a later `getLastError` reports what a single server would.

use crate::context::RouterContext;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shardgate_common::last_error::LastError;
use shardgate_common::protocol::document;
use shardgate_common::protocol::error::ShardgateError;
use shardgate_common::{Document, Namespace, QueryOptions, WriteBatch, WriteOp, WriteOpKind};
use tracing::{debug, trace};

/// One write command built from a run of same-kind operations.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteCommand {
    pub kind: WriteOpKind,
    /// `<db>.$cmd` of the target collection.
    pub command_ns: Namespace,
    pub body: Document,
    /// Number of operations carried.
    pub op_count: usize,
}

impl WriteCommand {
    fn new(ns: &Namespace, kind: WriteOpKind, ops: &[WriteOp], ordered: bool) -> Self {
        let items: Vec<Value> = ops.iter().map(WriteOp::to_command_item).collect();
        let mut body = Document::new();
        body.insert(kind.command_name().into(), json!(ns.coll()));
        body.insert(kind.items_field().into(), Value::Array(items));
        body.insert("ordered".into(), json!(ordered));

        WriteCommand {
            kind,
            command_ns: ns.command_ns(),
            body,
            op_count: ops.len(),
        }
    }
}

/// Splits a batch into write commands, one per run of same-kind operations.
pub fn split_batch(batch: &WriteBatch) -> Vec<WriteCommand> {
    let mut commands = Vec::new();
    let mut run_start = 0;

    for i in 1..=batch.ops.len() {
        let boundary = i == batch.ops.len() || batch.ops[i].kind() != batch.ops[run_start].kind();
        if boundary {
            let kind = batch.ops[run_start].kind();
            commands.push(WriteCommand::new(
                &batch.ns,
                kind,
                &batch.ops[run_start..i],
                batch.ordered,
            ));
            run_start = i;
        }
    }
    commands
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteErrorDetail {
    pub index: usize,
    pub code: i32,
    pub errmsg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upserted {
    pub index: usize,
    #[serde(rename = "_id")]
    pub id: Value,
}

/// Structured reply of a write command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchedCommandResponse {
    pub ok: bool,
    pub n: i64,
    pub n_modified: Option<i64>,
    pub upserted: Vec<Upserted>,
    pub write_errors: Vec<WriteErrorDetail>,
    pub write_concern_error: Option<WriteErrorDetail>,
    pub errmsg: Option<String>,
    pub code: Option<i32>,
}

impl BatchedCommandResponse {
    /// Parses a write command reply. Missing fields take their defaults.
    pub fn parse(doc: &Document) -> Self {
        let upserted = doc
            .get("upserted")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .filter_map(|item| {
                        Some(Upserted {
                            index: document::get_i64(item, "index")? as usize,
                            id: item.get("_id").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let write_errors = doc
            .get("writeErrors")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .map(parse_error_detail)
                    .collect()
            })
            .unwrap_or_default();

        BatchedCommandResponse {
            ok: document::is_truthy(doc, "ok"),
            n: document::get_i64(doc, "n").unwrap_or(0),
            n_modified: document::get_i64(doc, "nModified"),
            upserted,
            write_errors,
            write_concern_error: document::get_document(doc, "writeConcernError")
                .map(parse_error_detail),
            errmsg: document::get_str(doc, "errmsg").map(str::to_string),
            code: document::get_i64(doc, "code").map(|c| c as i32),
        }
    }

    /// A command-level failure standing in for an execution error.
    pub fn from_error(err: &ShardgateError) -> Self {
        BatchedCommandResponse {
            ok: false,
            errmsg: Some(err.to_string()),
            code: Some(err.code()),
            ..Default::default()
        }
    }
}

fn parse_error_detail(item: &Document) -> WriteErrorDetail {
    WriteErrorDetail {
        index: document::get_i64(item, "index").unwrap_or(0) as usize,
        code: document::get_i64(item, "code").unwrap_or(0) as i32,
        errmsg: document::get_str(item, "errmsg").unwrap_or_default().to_string(),
    }
}

/// Folds one command's outcome into `last_error`.
///
/// Returns `true` when the command failed or reported a write error.
/// A write concern error alone is not an error here.
pub fn batch_error_to_last_error(
    command: &WriteCommand,
    response: &BatchedCommandResponse,
    last_error: &mut LastError,
) -> bool {
    if !response.ok {
        last_error.raise_error(
            response.code.unwrap_or(0),
            response.errmsg.clone().unwrap_or_default(),
        );
        return true;
    }

    if let Some(last) = response.write_errors.last() {
        last_error.raise_error(last.code, last.errmsg.clone());
        return true;
    }

    match command.kind {
        WriteOpKind::Update => {
            let num_upserted = response.upserted.len() as i64;
            let num_updated = response.n - num_upserted;

            // only an upsert by the final operation is reported
            let upserted_id = response
                .upserted
                .last()
                .filter(|u| u.index + 1 == command.op_count)
                .map(|u| u.id.clone());

            last_error.record_update(num_updated > 0, response.n, upserted_id);
        }
        WriteOpKind::Delete => last_error.record_delete(response.n),
        WriteOpKind::Insert => {}
    }

    false
}

/// Responses of the write commands that were executed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    pub responses: Vec<BatchedCommandResponse>,
}

impl WriteOutcome {
    pub fn had_error(&self) -> bool {
        self.responses
            .iter()
            .any(|r| !r.ok || !r.write_errors.is_empty())
    }

    pub fn total_n(&self) -> i64 {
        self.responses.iter().map(|r| r.n).sum()
    }
}

pub struct BatchWriter {
    ctx: RouterContext,
}

impl BatchWriter {
    pub fn new(ctx: RouterContext) -> Self {
        Self { ctx }
    }

    /// Executes `batch`, stopping after the first failed command of an
    /// ordered batch.
    pub async fn write(&self, batch: &WriteBatch, last_error: &mut LastError) -> WriteOutcome {
        let mut outcome = WriteOutcome::default();

        for (i, command) in split_batch(batch).iter().enumerate() {
            if i > 0 {
                last_error.start_request();
            }

            trace!(ns = %command.command_ns, command = command.kind.command_name(), ops = command.op_count, "write command");

            let result = {
                let _disabled = last_error.disable();
                self.ctx
                    .collaborators
                    .executor
                    .run(&command.command_ns, &command.body, QueryOptions::empty())
                    .await
            };

            let response = match result {
                Ok(doc) => BatchedCommandResponse::parse(&doc),
                Err(e) => {
                    debug!("write command on {} failed: {}", batch.ns, e);
                    BatchedCommandResponse::from_error(&e)
                }
            };

            last_error.reset();
            let had_error = batch_error_to_last_error(command, &response, last_error);

            if command.kind == WriteOpKind::Insert && response.n > 0 {
                self.ctx.metrics.record_inserts(response.n as u64);
            }

            outcome.responses.push(response);

            if batch.ordered && had_error {
                debug!("ordered write batch on {} stopped after error", batch.ns);
                break;
            }
        }

        outcome
    }
}
