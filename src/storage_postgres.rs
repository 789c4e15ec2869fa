#![cfg(feature = "postgres")]

use async_trait::async_trait;
use serde_json::Value;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Row};

use crate::error::StoreError;
use crate::storage::{cursor_offset, next_offset_cursor, HistoryStore, HookStore, RoleTopicStore};
use crate::types::{DeliveryRecord, Hook, HookId, Page, PageRequest, RoleTopic, MAX_PAGE_LIMIT};

/// Postgres-backed storage.
///
/// Records live in JSONB `payload` columns next to the few columns that are
/// queried or constrained. The `(topic, endpoint)` and `(role, topic)` pairs
/// carry unique indexes and history rows cascade with their hook.
pub struct PostgresStorage {
    client: Client,
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
            StoreError::Duplicate(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

impl PostgresStorage {
    /// Wraps `client`, creating the tables if they do not exist yet.
    pub async fn new(client: Client) -> Result<Self, StoreError> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS resthook_hooks (
                    id TEXT PRIMARY KEY,
                    topic TEXT NOT NULL,
                    endpoint TEXT NOT NULL,
                    owner TEXT NOT NULL,
                    confirmed BOOLEAN NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    payload JSONB NOT NULL,
                    UNIQUE (topic, endpoint)
                );
                CREATE INDEX IF NOT EXISTS resthook_hooks_owner ON resthook_hooks (owner);
                CREATE TABLE IF NOT EXISTS resthook_histories (
                    id TEXT PRIMARY KEY,
                    hook_id TEXT NOT NULL REFERENCES resthook_hooks (id) ON DELETE CASCADE,
                    created_at TIMESTAMPTZ NOT NULL,
                    payload JSONB NOT NULL
                );
                CREATE INDEX IF NOT EXISTS resthook_histories_hook ON resthook_histories (hook_id);
                CREATE TABLE IF NOT EXISTS resthook_role_topics (
                    id TEXT PRIMARY KEY,
                    role TEXT NOT NULL,
                    topic TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    UNIQUE (role, topic)
                );",
            )
            .await?;

        Ok(Self { client })
    }
}

fn decode<T: serde::de::DeserializeOwned>(row: &Row) -> Result<T, StoreError> {
    let payload: Value = row.try_get("payload")?;
    Ok(serde_json::from_value(payload)?)
}

fn decode_all<T: serde::de::DeserializeOwned>(rows: &[Row]) -> Result<Vec<T>, StoreError> {
    rows.iter().map(decode).collect()
}

fn offset_and_limit(page: &PageRequest) -> Result<(i64, i64), StoreError> {
    let offset = cursor_offset(page.cursor.as_ref())?;
    let offset = i64::try_from(offset).map_err(|_| StoreError::InvalidCursor)?;
    Ok((offset, page.limit.clamp(1, MAX_PAGE_LIMIT) as i64))
}

fn page_of<T>(items: Vec<T>, offset: i64, total: i64) -> Page<T> {
    let end = offset as usize + items.len();
    Page {
        next: next_offset_cursor(end, total as usize),
        items,
        total: total as u64,
    }
}

#[async_trait]
impl HookStore for PostgresStorage {
    async fn insert_hook(&self, hook: &Hook) -> Result<(), StoreError> {
        let payload = serde_json::to_value(hook)?;
        self.client
            .execute(
                "INSERT INTO resthook_hooks (id, topic, endpoint, owner, confirmed, created_at, payload)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &hook.id.as_str(),
                    &hook.topic,
                    &hook.endpoint,
                    &hook.owner,
                    &hook.confirmed,
                    &hook.created_at,
                    &payload,
                ],
            )
            .await?;
        Ok(())
    }

    async fn replace_hook(&self, hook: &Hook) -> Result<bool, StoreError> {
        let payload = serde_json::to_value(hook)?;
        let updated = self
            .client
            .execute(
                "UPDATE resthook_hooks
                 SET topic = $2, endpoint = $3, owner = $4, confirmed = $5, payload = $6
                 WHERE id = $1",
                &[
                    &hook.id.as_str(),
                    &hook.topic,
                    &hook.endpoint,
                    &hook.owner,
                    &hook.confirmed,
                    &payload,
                ],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn get_hook(&self, id: &HookId) -> Result<Option<Hook>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT payload FROM resthook_hooks WHERE id = $1", &[&id.as_str()])
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn find_hook(&self, topic: &str, endpoint: &str) -> Result<Option<Hook>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM resthook_hooks WHERE topic = $1 AND endpoint = $2",
                &[&topic, &endpoint],
            )
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn delete_hook(&self, id: &HookId) -> Result<bool, StoreError> {
        let deleted = self
            .client
            .execute("DELETE FROM resthook_hooks WHERE id = $1", &[&id.as_str()])
            .await?;
        Ok(deleted > 0)
    }

    async fn list_hooks(
        &self,
        owner: Option<&str>,
        page: &PageRequest,
    ) -> Result<Page<Hook>, StoreError> {
        let (offset, limit) = offset_and_limit(page)?;
        let total: i64 = self
            .client
            .query_one(
                "SELECT COUNT(*) FROM resthook_hooks WHERE ($1::TEXT IS NULL OR owner = $1)",
                &[&owner],
            )
            .await?
            .try_get(0)?;
        let rows = self
            .client
            .query(
                "SELECT payload FROM resthook_hooks
                 WHERE ($1::TEXT IS NULL OR owner = $1)
                 ORDER BY created_at, id
                 OFFSET $2 LIMIT $3",
                &[&owner, &offset, &limit],
            )
            .await?;
        Ok(page_of(decode_all(&rows)?, offset, total))
    }

    async fn confirmed_hooks(&self, topic: &str) -> Result<Vec<Hook>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT payload FROM resthook_hooks WHERE topic = $1 AND confirmed",
                &[&topic],
            )
            .await?;
        decode_all(&rows)
    }
}

#[async_trait]
impl HistoryStore for PostgresStorage {
    async fn append_record(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_value(record)?;
        self.client
            .execute(
                "INSERT INTO resthook_histories (id, hook_id, created_at, payload)
                 VALUES ($1, $2, $3, $4)",
                &[&record.id, &record.hook_id.as_str(), &record.created_at, &payload],
            )
            .await?;
        Ok(())
    }

    async fn list_records(&self, hook_id: &HookId) -> Result<Vec<DeliveryRecord>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT payload FROM resthook_histories WHERE hook_id = $1",
                &[&hook_id.as_str()],
            )
            .await?;
        decode_all(&rows)
    }

    async fn delete_records(&self, hook_id: &HookId, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .execute(
                "DELETE FROM resthook_histories WHERE hook_id = $1 AND id = ANY($2)",
                &[&hook_id.as_str(), &ids],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RoleTopicStore for PostgresStorage {
    async fn insert_role_topic(&self, role_topic: &RoleTopic) -> Result<(), StoreError> {
        let payload = serde_json::to_value(role_topic)?;
        self.client
            .execute(
                "INSERT INTO resthook_role_topics (id, role, topic, payload) VALUES ($1, $2, $3, $4)",
                &[&role_topic.id, &role_topic.role, &role_topic.topic, &payload],
            )
            .await?;
        Ok(())
    }

    async fn get_role_topic(&self, id: &str) -> Result<Option<RoleTopic>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT payload FROM resthook_role_topics WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn find_role_topic(
        &self,
        role: &str,
        topic: &str,
    ) -> Result<Option<RoleTopic>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM resthook_role_topics WHERE role = $1 AND topic = $2",
                &[&role, &topic],
            )
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn delete_role_topic(&self, id: &str) -> Result<bool, StoreError> {
        let deleted = self
            .client
            .execute("DELETE FROM resthook_role_topics WHERE id = $1", &[&id])
            .await?;
        Ok(deleted > 0)
    }

    async fn list_role_topics(&self, page: &PageRequest) -> Result<Page<RoleTopic>, StoreError> {
        let (offset, limit) = offset_and_limit(page)?;
        let total: i64 = self
            .client
            .query_one("SELECT COUNT(*) FROM resthook_role_topics", &[])
            .await?
            .try_get(0)?;
        let rows = self
            .client
            .query(
                "SELECT payload FROM resthook_role_topics ORDER BY role, topic OFFSET $1 LIMIT $2",
                &[&offset, &limit],
            )
            .await?;
        Ok(page_of(decode_all(&rows)?, offset, total))
    }

    async fn topics_for_roles(&self, roles: &[String]) -> Result<Vec<String>, StoreError> {
        if roles.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .client
            .query(
                "SELECT DISTINCT topic FROM resthook_role_topics WHERE role = ANY($1) ORDER BY topic",
                &[&roles],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(StoreError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Cursor;

    #[test]
    fn limits_stay_in_range_for_sql() {
        assert_eq!(offset_and_limit(&PageRequest::first(usize::MAX)).unwrap(), (0, 1_000));
        assert_eq!(offset_and_limit(&PageRequest::first(0)).unwrap(), (0, 1));

        let past_i64 = PageRequest::after(Cursor(u64::MAX.to_string()), 10);
        assert!(matches!(offset_and_limit(&past_i64), Err(StoreError::InvalidCursor)));
    }
}
