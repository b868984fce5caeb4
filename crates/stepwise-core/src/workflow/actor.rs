//! Approver resolution port.

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};
use stepwise_types::workflow::{StepConfig, StepDefinition};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("unknown role '{0}'")]
    UnknownRole(String),

    #[error("resolver unavailable: {0}")]
    Unavailable(String),
}

/// Resolves candidate approvers for an approval step.
///
/// The returned list is ordered: index 0 is the initial assignee, index `n`
/// the assignee after the `n`-th escalation.
pub trait ActorResolver: Send + Sync {
    fn resolve_approvers<'a>(
        &'a self,
        step: &'a StepDefinition,
        context: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, ResolverError>> + Send + 'a>>;
}

/// Resolver that returns the approvers declared on the step, ignoring roles.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredApprovers;

impl ActorResolver for DeclaredApprovers {
    fn resolve_approvers<'a>(
        &'a self,
        step: &'a StepDefinition,
        _context: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, ResolverError>> + Send + 'a>> {
        let approvers = match &step.config {
            StepConfig::Approval(cfg) => cfg.approvers.clone(),
            _ => Vec::new(),
        };
        Box::pin(async move { Ok(approvers) })
    }
}
