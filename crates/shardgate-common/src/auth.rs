//! Authorization Layer for Shardgate
//!
//! Authorization decisions belong to the session layer outside the router;
//! this module defines the interface the router calls and the audit hook it
//! reports every decision to.
//!
//! # Architecture
//!
//! - [`Authorizer`]: answers whether the current session may run a query,
//!   continue a cursor, or perform a cluster-level diagnostic action
//! - [`AuditLog`]: records each check, allowed or denied, before the router
//!   acts on it
//! - [`Permissions`]: a static role description implementing [`Authorizer`],
//!   used by the simulator and by tests
//!
//! # Example
//!
//! ```
//! use shardgate_common::auth::{ActionType, Authorizer, Permissions};
//! use shardgate_common::Namespace;
//!
//! let root = Permissions::root();
//! assert!(root.is_authorized_for_cluster_action(ActionType::Inprog));
//!
//! let reader = Permissions::read_only().with_database("app");
//! assert!(reader.check_get_more(&Namespace::new("app.users"), 42).is_ok());
//! assert!(reader.check_get_more(&Namespace::new("billing.invoices"), 42).is_err());
//! ```

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::error::{Result, ShardgateError};
use crate::protocol::{CursorId, Document, Namespace};

/// Actions the router asks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    Find,
    GetMore,
    Inprog,
    Killop,
}

impl ActionType {
    pub fn name(&self) -> &'static str {
        match self {
            ActionType::Find => "find",
            ActionType::GetMore => "getMore",
            ActionType::Inprog => "inprog",
            ActionType::Killop => "killop",
        }
    }

    /// Cluster actions are granted on the cluster resource, not a namespace.
    pub fn is_cluster_action(&self) -> bool {
        matches!(self, ActionType::Inprog | ActionType::Killop)
    }
}

/// Authorization decisions for one client session.
pub trait Authorizer: Send + Sync {
    /// May the session run `query` against `ns`?
    fn check_query(&self, ns: &Namespace, query: &Document) -> Result<()>;

    /// May the session continue cursor `cursor_id` on `ns`?
    fn check_get_more(&self, ns: &Namespace, cursor_id: CursorId) -> Result<()>;

    /// May the session perform `action` on the cluster resource?
    fn is_authorized_for_cluster_action(&self, action: ActionType) -> bool;
}

/// One authorization check, as reported to the audit log.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent<'a> {
    pub action: ActionType,
    pub ns: Option<&'a Namespace>,
    pub query: Option<&'a Document>,
    pub cursor_id: Option<CursorId>,
    /// 0 when allowed, otherwise the error code surfaced to the client.
    pub result_code: i32,
}

impl AuditEvent<'_> {
    pub fn allowed(&self) -> bool {
        self.result_code == 0
    }
}

/// Sink for authorization audit records.
pub trait AuditLog: Send + Sync {
    fn log_authz_check(&self, event: &AuditEvent<'_>);
}

/// Audit log that emits records through `tracing` under the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn log_authz_check(&self, event: &AuditEvent<'_>) {
        let ns = event.ns.map(Namespace::as_str).unwrap_or("");
        if event.allowed() {
            tracing::debug!(
                target: "audit",
                action = event.action.name(),
                ns,
                cursor_id = event.cursor_id,
                "authorization check passed"
            );
        } else {
            tracing::info!(
                target: "audit",
                action = event.action.name(),
                ns,
                cursor_id = event.cursor_id,
                code = event.result_code,
                "authorization check denied"
            );
        }
    }
}

/// Static role description.
///
/// `databases` of `None` grants namespace actions on every database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    actions: BTreeSet<ActionType>,
    databases: Option<BTreeSet<String>>,
}

impl Permissions {
    /// Every action on every database and the cluster.
    pub fn root() -> Self {
        Self {
            actions: [
                ActionType::Find,
                ActionType::GetMore,
                ActionType::Inprog,
                ActionType::Killop,
            ]
            .into_iter()
            .collect(),
            databases: None,
        }
    }

    /// Reads on every database, no cluster actions.
    pub fn read_only() -> Self {
        Self {
            actions: [ActionType::Find, ActionType::GetMore].into_iter().collect(),
            databases: None,
        }
    }

    /// Nothing at all.
    pub fn none() -> Self {
        Self {
            actions: BTreeSet::new(),
            databases: None,
        }
    }

    pub fn with_action(mut self, action: ActionType) -> Self {
        self.actions.insert(action);
        self
    }

    pub fn without_action(mut self, action: ActionType) -> Self {
        self.actions.remove(&action);
        self
    }

    /// Restricts namespace actions to `db` (cumulative across calls).
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.databases
            .get_or_insert_with(BTreeSet::new)
            .insert(db.into());
        self
    }

    fn allows(&self, action: ActionType, ns: &Namespace) -> bool {
        if !self.actions.contains(&action) {
            return false;
        }
        match &self.databases {
            Some(dbs) => dbs.contains(ns.db()),
            None => true,
        }
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::root()
    }
}

impl Authorizer for Permissions {
    fn check_query(&self, ns: &Namespace, _query: &Document) -> Result<()> {
        if self.allows(ActionType::Find, ns) {
            Ok(())
        } else {
            Err(ShardgateError::Unauthorized(format!(
                "not authorized for query on {}",
                ns
            )))
        }
    }

    fn check_get_more(&self, ns: &Namespace, cursor_id: CursorId) -> Result<()> {
        if self.allows(ActionType::GetMore, ns) {
            Ok(())
        } else {
            Err(ShardgateError::Unauthorized(format!(
                "not authorized for getmore on {} (cursor {})",
                ns, cursor_id
            )))
        }
    }

    fn is_authorized_for_cluster_action(&self, action: ActionType) -> bool {
        action.is_cluster_action() && self.actions.contains(&action)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actions: Vec<&str> = self.actions.iter().map(ActionType::name).collect();
        match &self.databases {
            Some(dbs) => {
                let dbs: Vec<&str> = dbs.iter().map(String::as_str).collect();
                write!(f, "[{}] on [{}]", actions.join(","), dbs.join(","))
            }
            None => write!(f, "[{}] on *", actions.join(",")),
        }
    }
}
