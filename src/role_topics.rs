use std::sync::Arc;

use crate::error::{HookError, StoreError};
use crate::storage::Storage;
use crate::types::{Page, PageRequest, RoleTopic};

/// Administration of role-to-topic grants.
///
/// Callers are expected to be admins; [`Api`](crate::Api) enforces that.
#[derive(Clone)]
pub struct RoleTopicService {
    store: Arc<dyn Storage>,
}

impl RoleTopicService {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self { store }
    }

    pub async fn list(&self, page: &PageRequest) -> Result<Page<RoleTopic>, HookError> {
        Ok(self.store.list_role_topics(page).await?)
    }

    pub async fn create(&self, role: &str, topic: &str) -> Result<RoleTopic, HookError> {
        let role = role.trim();
        let topic = topic.trim();
        if role.is_empty() {
            return Err(HookError::validation("role is required"));
        }
        if topic.is_empty() {
            return Err(HookError::validation("topic is required"));
        }
        if self.store.find_role_topic(role, topic).await?.is_some() {
            return Err(conflict());
        }

        let role_topic = RoleTopic::new(role, topic);
        match self.store.insert_role_topic(&role_topic).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => return Err(conflict()),
            Err(err) => return Err(err.into()),
        }
        tracing::info!(role, topic, id = %role_topic.id, "role topic created");
        Ok(role_topic)
    }

    pub async fn remove(&self, id: &str) -> Result<(), HookError> {
        if self.store.get_role_topic(id).await?.is_none() || !self.store.delete_role_topic(id).await? {
            return Err(HookError::NotFound(format!("RoleTopic not found with id: {id}")));
        }
        tracing::info!(id, "role topic removed");
        Ok(())
    }
}

fn conflict() -> HookError {
    HookError::Conflict("The role topic is already defined.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn service() -> RoleTopicService {
        RoleTopicService::new(Arc::new(InMemoryStorage::new()))
    }

    #[tokio::test]
    async fn duplicate_grant_conflicts() {
        let service = service();
        service.create("copilot", "orders").await.unwrap();
        let err = service.create("copilot", "orders").await.unwrap_err();
        assert!(matches!(err, HookError::Conflict(_)));
    }

    #[tokio::test]
    async fn blank_fields_are_rejected() {
        let err = service().create(" ", "orders").await.unwrap_err();
        assert!(matches!(err, HookError::Validation(_)));
    }

    #[tokio::test]
    async fn list_is_sorted_by_role_then_topic() {
        let service = service();
        service.create("b", "x").await.unwrap();
        service.create("a", "z").await.unwrap();
        service.create("a", "y").await.unwrap();

        let page = service.list(&PageRequest::first(10)).await.unwrap();
        let pairs: Vec<(String, String)> = page
            .items
            .into_iter()
            .map(|rt| (rt.role, rt.topic))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "y".to_string()),
                ("a".to_string(), "z".to_string()),
                ("b".to_string(), "x".to_string()),
            ]
        );
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn removing_unknown_grant_is_not_found() {
        let service = service();
        let created = service.create("a", "y").await.unwrap();
        service.remove(&created.id).await.unwrap();
        let err = service.remove(&created.id).await.unwrap_err();
        assert!(matches!(err, HookError::NotFound(_)));
    }
}
