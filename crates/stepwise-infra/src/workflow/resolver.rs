//! Approver resolution through configured roles.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};
use stepwise_core::workflow::actor::{ActorResolver, ResolverError};
use stepwise_types::config::EngineConfig;
use stepwise_types::workflow::{StepConfig, StepDefinition};

/// Resolves an approval step's chain as its explicit `approvers` followed by
/// the members of its `role`, looked up in the `[roles]` config table.
#[derive(Debug, Clone, Default)]
pub struct ConfigActorResolver {
    roles: HashMap<String, Vec<String>>,
}

impl ConfigActorResolver {
    pub fn new(roles: HashMap<String, Vec<String>>) -> Self {
        Self { roles }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.roles.clone())
    }

    fn chain(&self, step: &StepDefinition) -> Result<Vec<String>, ResolverError> {
        let StepConfig::Approval(cfg) = &step.config else {
            return Ok(Vec::new());
        };

        let mut chain = cfg.approvers.clone();
        if let Some(role) = &cfg.role {
            let members = self
                .roles
                .get(role)
                .ok_or_else(|| ResolverError::UnknownRole(role.clone()))?;
            for member in members {
                if !chain.contains(member) {
                    chain.push(member.clone());
                }
            }
        }
        Ok(chain)
    }
}

impl ActorResolver for ConfigActorResolver {
    fn resolve_approvers<'a>(
        &'a self,
        step: &'a StepDefinition,
        _context: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, ResolverError>> + Send + 'a>> {
        let result = self.chain(step);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approval_step(config: Value) -> StepDefinition {
        serde_json::from_value(json!({
            "id": "review",
            "name": "Review",
            "sequence": 1,
            "timeout_secs": 3600,
            "config": config,
        }))
        .unwrap()
    }

    fn resolver() -> ConfigActorResolver {
        let mut roles = HashMap::new();
        roles.insert("finance".to_string(), vec!["dana".to_string(), "alice".to_string()]);
        ConfigActorResolver::new(roles)
    }

    #[tokio::test]
    async fn role_members_follow_explicit_approvers() {
        let step = approval_step(json!({"type": "approval", "approvers": ["alice"], "role": "finance"}));
        let chain = resolver().resolve_approvers(&step, &Map::new()).await.unwrap();
        assert_eq!(chain, vec!["alice", "dana"]);
    }

    #[tokio::test]
    async fn role_only_step() {
        let step = approval_step(json!({"type": "approval", "role": "finance"}));
        let chain = resolver().resolve_approvers(&step, &Map::new()).await.unwrap();
        assert_eq!(chain, vec!["dana", "alice"]);
    }

    #[tokio::test]
    async fn unknown_role_is_an_error() {
        let step = approval_step(json!({"type": "approval", "role": "legal"}));
        let err = resolver().resolve_approvers(&step, &Map::new()).await.unwrap_err();
        assert!(matches!(err, ResolverError::UnknownRole(role) if role == "legal"));
    }
}
