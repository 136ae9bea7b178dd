use crate::config::RouterConfig;
use crate::cursor_cache::CursorCache;
use crate::topology::{CommandExecutor, CursorFactory, ShardConnector, TopologyAccessor};
use shardgate_common::auth::{ActionType, AuditEvent, AuditLog, Authorizer};
use shardgate_common::protocol::error::Result;
use shardgate_common::{CursorId, Document, Namespace};
use shardgate_metrics::RouterMetricsCollector;
use std::sync::Arc;

/// The external services a router drives.
#[derive(Clone)]
pub struct Collaborators {
    pub topology: Arc<dyn TopologyAccessor>,
    pub cursor_factory: Arc<dyn CursorFactory>,
    pub connector: Arc<dyn ShardConnector>,
    pub executor: Arc<dyn CommandExecutor>,
    pub authorizer: Arc<dyn Authorizer>,
    pub audit: Arc<dyn AuditLog>,
}

/// Everything a routing component needs for one operation.
///
/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct RouterContext {
    pub collaborators: Collaborators,
    pub cache: Arc<CursorCache>,
    pub metrics: Arc<RouterMetricsCollector>,
    pub config: RouterConfig,
}

impl RouterContext {
    pub fn new(collaborators: Collaborators, config: RouterConfig) -> Self {
        Self {
            collaborators,
            cache: Arc::new(CursorCache::new()),
            metrics: Arc::new(RouterMetricsCollector::new()),
            config,
        }
    }

    /// Authorizes a query and audits the decision.
    pub(crate) fn authorize_query(&self, ns: &Namespace, query: &Document) -> Result<()> {
        let outcome = self.collaborators.authorizer.check_query(ns, query);
        self.collaborators.audit.log_authz_check(&AuditEvent {
            action: ActionType::Find,
            ns: Some(ns),
            query: Some(query),
            cursor_id: None,
            result_code: result_code(&outcome),
        });
        outcome
    }

    /// Authorizes a get-more and audits the decision.
    pub(crate) fn authorize_get_more(&self, ns: &Namespace, cursor_id: CursorId) -> Result<()> {
        let outcome = self.collaborators.authorizer.check_get_more(ns, cursor_id);
        self.collaborators.audit.log_authz_check(&AuditEvent {
            action: ActionType::GetMore,
            ns: Some(ns),
            query: None,
            cursor_id: Some(cursor_id),
            result_code: result_code(&outcome),
        });
        outcome
    }

    /// Checks a cluster-wide action and audits the decision.
    pub(crate) fn authorize_cluster_action(
        &self,
        action: ActionType,
        ns: &Namespace,
        query: &Document,
    ) -> bool {
        let allowed = self
            .collaborators
            .authorizer
            .is_authorized_for_cluster_action(action);
        self.collaborators.audit.log_authz_check(&AuditEvent {
            action,
            ns: Some(ns),
            query: Some(query),
            cursor_id: None,
            result_code: if allowed { 0 } else { UNAUTHORIZED_CODE },
        });
        allowed
    }
}

const UNAUTHORIZED_CODE: i32 = 13;

fn result_code(outcome: &Result<()>) -> i32 {
    match outcome {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}
