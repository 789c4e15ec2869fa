use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{Cursor, DeliveryRecord, Hook, HookId, Page, PageRequest, RoleTopic};

/// Persistence for hooks.
///
/// Implementations must enforce the `(topic, endpoint)` uniqueness
/// invariant on both insert and replace, reporting violations as
/// [`StoreError::Duplicate`].
#[async_trait]
pub trait HookStore: Send + Sync {
    async fn insert_hook(&self, hook: &Hook) -> Result<(), StoreError>;
    /// Returns `false` when no hook with that id exists.
    async fn replace_hook(&self, hook: &Hook) -> Result<bool, StoreError>;
    async fn get_hook(&self, id: &HookId) -> Result<Option<Hook>, StoreError>;
    async fn find_hook(&self, topic: &str, endpoint: &str) -> Result<Option<Hook>, StoreError>;
    /// Deletes the hook and its delivery history.
    async fn delete_hook(&self, id: &HookId) -> Result<bool, StoreError>;
    async fn list_hooks(
        &self,
        owner: Option<&str>,
        page: &PageRequest,
    ) -> Result<Page<Hook>, StoreError>;
    /// Hooks eligible for dispatch on `topic`.
    async fn confirmed_hooks(&self, topic: &str) -> Result<Vec<Hook>, StoreError>;
}

/// Append-only delivery log, trimmed by [`HistoryLog`](crate::HistoryLog).
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append_record(&self, record: &DeliveryRecord) -> Result<(), StoreError>;
    /// Records for one hook, in no particular order.
    async fn list_records(&self, hook_id: &HookId) -> Result<Vec<DeliveryRecord>, StoreError>;
    async fn delete_records(&self, hook_id: &HookId, ids: &[String]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RoleTopicStore: Send + Sync {
    async fn insert_role_topic(&self, role_topic: &RoleTopic) -> Result<(), StoreError>;
    async fn get_role_topic(&self, id: &str) -> Result<Option<RoleTopic>, StoreError>;
    async fn find_role_topic(&self, role: &str, topic: &str)
        -> Result<Option<RoleTopic>, StoreError>;
    async fn delete_role_topic(&self, id: &str) -> Result<bool, StoreError>;
    /// Sorted by role, then topic.
    async fn list_role_topics(&self, page: &PageRequest) -> Result<Page<RoleTopic>, StoreError>;
    /// Distinct topics granted to any of `roles`, sorted.
    async fn topics_for_roles(&self, roles: &[String]) -> Result<Vec<String>, StoreError>;
}

/// Everything the engine persists.
pub trait Storage: HookStore + HistoryStore + RoleTopicStore {}

impl<T> Storage for T where T: HookStore + HistoryStore + RoleTopicStore {}

/// In-memory storage for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryStorage {
    hooks: RwLock<HashMap<HookId, Hook>>,
    histories: RwLock<HashMap<HookId, Vec<DeliveryRecord>>>,
    role_topics: RwLock<HashMap<String, RoleTopic>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HookStore for InMemoryStorage {
    async fn insert_hook(&self, hook: &Hook) -> Result<(), StoreError> {
        let mut hooks = self.hooks.write().await;
        if hooks.values().any(|h| h.topic == hook.topic && h.endpoint == hook.endpoint) {
            return Err(StoreError::Duplicate(format!("{}|{}", hook.topic, hook.endpoint)));
        }
        hooks.insert(hook.id.clone(), hook.clone());
        Ok(())
    }

    async fn replace_hook(&self, hook: &Hook) -> Result<bool, StoreError> {
        let mut hooks = self.hooks.write().await;
        if !hooks.contains_key(&hook.id) {
            return Ok(false);
        }
        let taken = hooks.values().any(|h| {
            h.id != hook.id && h.topic == hook.topic && h.endpoint == hook.endpoint
        });
        if taken {
            return Err(StoreError::Duplicate(format!("{}|{}", hook.topic, hook.endpoint)));
        }
        hooks.insert(hook.id.clone(), hook.clone());
        Ok(true)
    }

    async fn get_hook(&self, id: &HookId) -> Result<Option<Hook>, StoreError> {
        Ok(self.hooks.read().await.get(id).cloned())
    }

    async fn find_hook(&self, topic: &str, endpoint: &str) -> Result<Option<Hook>, StoreError> {
        let hooks = self.hooks.read().await;
        Ok(hooks
            .values()
            .find(|h| h.topic == topic && h.endpoint == endpoint)
            .cloned())
    }

    async fn delete_hook(&self, id: &HookId) -> Result<bool, StoreError> {
        let removed = self.hooks.write().await.remove(id).is_some();
        if removed {
            self.histories.write().await.remove(id);
        }
        Ok(removed)
    }

    async fn list_hooks(
        &self,
        owner: Option<&str>,
        page: &PageRequest,
    ) -> Result<Page<Hook>, StoreError> {
        let mut items: Vec<Hook> = {
            let hooks = self.hooks.read().await;
            hooks
                .values()
                .filter(|h| owner.map_or(true, |o| h.owner == o))
                .cloned()
                .collect()
        };
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        paginate(items, page)
    }

    async fn confirmed_hooks(&self, topic: &str) -> Result<Vec<Hook>, StoreError> {
        let hooks = self.hooks.read().await;
        Ok(hooks
            .values()
            .filter(|h| h.confirmed && h.topic == topic)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl HistoryStore for InMemoryStorage {
    async fn append_record(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        self.histories
            .write()
            .await
            .entry(record.hook_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn list_records(&self, hook_id: &HookId) -> Result<Vec<DeliveryRecord>, StoreError> {
        Ok(self
            .histories
            .read()
            .await
            .get(hook_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_records(&self, hook_id: &HookId, ids: &[String]) -> Result<(), StoreError> {
        let mut histories = self.histories.write().await;
        if let Some(records) = histories.get_mut(hook_id) {
            records.retain(|r| !ids.contains(&r.id));
        }
        Ok(())
    }
}

#[async_trait]
impl RoleTopicStore for InMemoryStorage {
    async fn insert_role_topic(&self, role_topic: &RoleTopic) -> Result<(), StoreError> {
        let mut role_topics = self.role_topics.write().await;
        if role_topics
            .values()
            .any(|rt| rt.role == role_topic.role && rt.topic == role_topic.topic)
        {
            return Err(StoreError::Duplicate(format!(
                "{}|{}",
                role_topic.role, role_topic.topic
            )));
        }
        role_topics.insert(role_topic.id.clone(), role_topic.clone());
        Ok(())
    }

    async fn get_role_topic(&self, id: &str) -> Result<Option<RoleTopic>, StoreError> {
        Ok(self.role_topics.read().await.get(id).cloned())
    }

    async fn find_role_topic(
        &self,
        role: &str,
        topic: &str,
    ) -> Result<Option<RoleTopic>, StoreError> {
        let role_topics = self.role_topics.read().await;
        Ok(role_topics
            .values()
            .find(|rt| rt.role == role && rt.topic == topic)
            .cloned())
    }

    async fn delete_role_topic(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.role_topics.write().await.remove(id).is_some())
    }

    async fn list_role_topics(&self, page: &PageRequest) -> Result<Page<RoleTopic>, StoreError> {
        let mut items: Vec<RoleTopic> = self.role_topics.read().await.values().cloned().collect();
        items.sort_by(|a, b| (&a.role, &a.topic).cmp(&(&b.role, &b.topic)));
        paginate(items, page)
    }

    async fn topics_for_roles(&self, roles: &[String]) -> Result<Vec<String>, StoreError> {
        if roles.is_empty() {
            return Ok(Vec::new());
        }
        let role_topics = self.role_topics.read().await;
        let topics: BTreeSet<String> = role_topics
            .values()
            .filter(|rt| roles.contains(&rt.role))
            .map(|rt| rt.topic.clone())
            .collect();
        Ok(topics.into_iter().collect())
    }
}

/// Decode an offset cursor. Used by adapters whose backend pages by offset.
pub(crate) fn cursor_offset(cursor: Option<&Cursor>) -> Result<usize, StoreError> {
    match cursor {
        None => Ok(0),
        Some(Cursor(raw)) => raw.parse().map_err(|_| StoreError::InvalidCursor),
    }
}

/// Cursor for the page following one that ended at `end`, if anything remains.
pub(crate) fn next_offset_cursor(end: usize, total: usize) -> Option<Cursor> {
    (end < total).then(|| Cursor(end.to_string()))
}

/// Slice an already-ordered listing into one page.
pub(crate) fn paginate<T>(items: Vec<T>, page: &PageRequest) -> Result<Page<T>, StoreError> {
    let total = items.len();
    let offset = cursor_offset(page.cursor.as_ref())?.min(total);
    let end = offset.saturating_add(page.limit.max(1)).min(total);
    let next = next_offset_cursor(end, total);
    let items = items.into_iter().skip(offset).take(end - offset).collect();
    Ok(Page {
        items,
        total: total as u64,
        next,
    })
}
