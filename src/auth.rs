use std::sync::Arc;

use crate::error::HookError;
use crate::storage::Storage;
use crate::types::Principal;

/// Role-to-topic access checks.
#[derive(Clone)]
pub struct AuthorizationGate {
    store: Arc<dyn Storage>,
}

impl AuthorizationGate {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self { store }
    }

    /// Sorted, distinct topics granted to any of `roles`.
    pub async fn topics_for_roles(&self, roles: &[String]) -> Result<Vec<String>, HookError> {
        if roles.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.store.topics_for_roles(roles).await?)
    }

    /// Admins pass unconditionally.
    pub async fn assert_topic_allowed(
        &self,
        principal: &Principal,
        topic: &str,
    ) -> Result<(), HookError> {
        if principal.is_admin {
            return Ok(());
        }
        let allowed = self.topics_for_roles(&principal.roles).await?;
        if allowed.iter().any(|t| t == topic) {
            Ok(())
        } else {
            tracing::debug!(handle = %principal.handle, topic, "topic not granted to principal");
            Err(HookError::Forbidden(format!(
                "topic {topic} is not allowed for the current user"
            )))
        }
    }
}
