#![cfg(feature = "redis")]

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::StoreError;
use crate::storage::{paginate, HistoryStore, HookStore, RoleTopicStore};
use crate::types::{Cursor, DeliveryRecord, Hook, HookId, Page, PageRequest, RoleTopic};

/// Redis-backed storage.
///
/// Layout under `prefix`:
/// - `hooks` hash: id -> hook JSON, with `hook_pairs` (topic + endpoint -> id),
///   `topic:<topic>` and `owner:<owner>` sets as indexes
/// - `history:<hook id>` sorted set of record JSON scored by creation time
/// - `role_topics` hash: id -> grant JSON, with `role_topic_pairs` and
///   `role:<role>` topic sets
///
/// Pair claims and the records they point at are written together by Lua
/// scripts, so a failed write never leaves a claim behind. Hook listings page
/// with `HSCAN`/`SSCAN`, so the cursor is Redis' own and order is unspecified.
pub struct RedisStorage {
    client: redis::Client,
    prefix: String,
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl RedisStorage {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    async fn conn(&self) -> Result<redis::aio::Connection, StoreError> {
        Ok(self.client.get_tokio_connection().await?)
    }

    fn hooks_key(&self) -> String {
        format!("{}:hooks", self.prefix)
    }

    fn hook_pairs_key(&self) -> String {
        format!("{}:hook_pairs", self.prefix)
    }

    fn topic_key(&self, topic: &str) -> String {
        format!("{}:topic:{}", self.prefix, topic)
    }

    fn owner_key(&self, owner: &str) -> String {
        format!("{}:owner:{}", self.prefix, owner)
    }

    fn history_key(&self, hook_id: &HookId) -> String {
        format!("{}:history:{}", self.prefix, hook_id)
    }

    fn role_topics_key(&self) -> String {
        format!("{}:role_topics", self.prefix)
    }

    fn role_topic_pairs_key(&self) -> String {
        format!("{}:role_topic_pairs", self.prefix)
    }

    fn role_key(&self, role: &str) -> String {
        format!("{}:role:{}", self.prefix, role)
    }

    async fn load_hooks(
        &self,
        conn: &mut redis::aio::Connection,
        ids: &[String],
    ) -> Result<Vec<Hook>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.hooks_key())
            .arg(ids)
            .query_async(conn)
            .await?;
        values
            .into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }
}

/// Claims a pair and writes the record it points at in one step.
///
/// KEYS: pair hash, record hash, then index sets. ARGV: pair field, record
/// id, record JSON, index set member. A claim whose record is gone is free.
const CLAIM_AND_INSERT: &str = r"
local holder = redis.call('HGET', KEYS[1], ARGV[1])
if holder and redis.call('HEXISTS', KEYS[2], holder) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[2], ARGV[3])
for i = 3, #KEYS do
    redis.call('SADD', KEYS[i], ARGV[4])
end
return 1
";

/// Swaps a hook record for a new one if it still matches what was read.
///
/// KEYS: pair hash, hooks hash, old and new topic sets, old and new owner
/// sets. ARGV: id, expected JSON, new JSON, old pair, new pair.
/// Returns 1 on success, 0 when the new pair is taken, -1 when the hook is
/// gone and -2 when it changed since it was read.
const REPLACE: &str = r"
local current = redis.call('HGET', KEYS[2], ARGV[1])
if not current then
    return -1
end
if current ~= ARGV[2] then
    return -2
end
if ARGV[4] ~= ARGV[5] then
    local holder = redis.call('HGET', KEYS[1], ARGV[5])
    if holder and holder ~= ARGV[1] and redis.call('HEXISTS', KEYS[2], holder) == 1 then
        return 0
    end
    redis.call('HDEL', KEYS[1], ARGV[4])
    redis.call('HSET', KEYS[1], ARGV[5], ARGV[1])
end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
redis.call('SREM', KEYS[3], ARGV[1])
redis.call('SREM', KEYS[5], ARGV[1])
redis.call('SADD', KEYS[4], ARGV[1])
redis.call('SADD', KEYS[6], ARGV[1])
return 1
";

const REPLACE_ATTEMPTS: usize = 5;

/// Field of a pair hash; the unit separator cannot appear in a topic or URL.
fn pair(a: &str, b: &str) -> String {
    format!("{a}\u{1f}{b}")
}

fn scan_cursor(page: &PageRequest) -> Result<u64, StoreError> {
    match &page.cursor {
        None => Ok(0),
        Some(Cursor(raw)) => raw.parse().map_err(|_| StoreError::InvalidCursor),
    }
}

#[async_trait]
impl HookStore for RedisStorage {
    async fn insert_hook(&self, hook: &Hook) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let key = pair(&hook.topic, &hook.endpoint);
        let json = serde_json::to_string(hook)?;
        let inserted: bool = redis::Script::new(CLAIM_AND_INSERT)
            .key(self.hook_pairs_key())
            .key(self.hooks_key())
            .key(self.topic_key(&hook.topic))
            .key(self.owner_key(&hook.owner))
            .arg(&key)
            .arg(hook.id.as_str())
            .arg(json)
            .arg(hook.id.as_str())
            .invoke_async(&mut conn)
            .await?;
        if !inserted {
            return Err(StoreError::Duplicate(key));
        }
        Ok(())
    }

    async fn replace_hook(&self, hook: &Hook) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(hook)?;
        let new_pair = pair(&hook.topic, &hook.endpoint);
        for _ in 0..REPLACE_ATTEMPTS {
            let current: Option<String> = conn.hget(self.hooks_key(), hook.id.as_str()).await?;
            let Some(expected) = current else {
                return Ok(false);
            };
            let current: Hook = serde_json::from_str(&expected)?;

            let outcome: i64 = redis::Script::new(REPLACE)
                .key(self.hook_pairs_key())
                .key(self.hooks_key())
                .key(self.topic_key(&current.topic))
                .key(self.topic_key(&hook.topic))
                .key(self.owner_key(&current.owner))
                .key(self.owner_key(&hook.owner))
                .arg(hook.id.as_str())
                .arg(&expected)
                .arg(&json)
                .arg(pair(&current.topic, &current.endpoint))
                .arg(&new_pair)
                .invoke_async(&mut conn)
                .await?;
            match outcome {
                1 => return Ok(true),
                0 => return Err(StoreError::Duplicate(new_pair)),
                -1 => return Ok(false),
                _ => tracing::debug!(hook_id = %hook.id, "hook changed during replace, retrying"),
            }
        }
        Err(StoreError::Backend(format!(
            "hook {} kept changing during replace",
            hook.id
        )))
    }

    async fn get_hook(&self, id: &HookId) -> Result<Option<Hook>, StoreError> {
        let mut conn = self.conn().await?;
        let json: Option<String> = conn.hget(self.hooks_key(), id.as_str()).await?;
        json.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn find_hook(&self, topic: &str, endpoint: &str) -> Result<Option<Hook>, StoreError> {
        let mut conn = self.conn().await?;
        let id: Option<String> = conn.hget(self.hook_pairs_key(), pair(topic, endpoint)).await?;
        match id {
            Some(id) => Ok(self.load_hooks(&mut conn, &[id]).await?.into_iter().next()),
            None => Ok(None),
        }
    }

    async fn delete_hook(&self, id: &HookId) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let json: Option<String> = conn.hget(self.hooks_key(), id.as_str()).await?;
        let Some(json) = json else {
            return Ok(false);
        };
        let hook: Hook = serde_json::from_str(&json)?;
        redis::pipe()
            .atomic()
            .hdel(self.hooks_key(), id.as_str())
            .ignore()
            .hdel(self.hook_pairs_key(), pair(&hook.topic, &hook.endpoint))
            .ignore()
            .srem(self.topic_key(&hook.topic), id.as_str())
            .ignore()
            .srem(self.owner_key(&hook.owner), id.as_str())
            .ignore()
            .del(self.history_key(id))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(true)
    }

    async fn list_hooks(
        &self,
        owner: Option<&str>,
        page: &PageRequest,
    ) -> Result<Page<Hook>, StoreError> {
        let mut conn = self.conn().await?;
        let cursor = scan_cursor(page)?;
        let count = page.limit.max(1);

        let (next, hooks, total) = match owner {
            Some(owner) => {
                let key = self.owner_key(owner);
                let (next, ids): (u64, Vec<String>) = redis::cmd("SSCAN")
                    .arg(&key)
                    .arg(cursor)
                    .arg("COUNT")
                    .arg(count)
                    .query_async(&mut conn)
                    .await?;
                let total: u64 = conn.scard(&key).await?;
                (next, self.load_hooks(&mut conn, &ids).await?, total)
            }
            None => {
                let (next, flat): (u64, Vec<String>) = redis::cmd("HSCAN")
                    .arg(self.hooks_key())
                    .arg(cursor)
                    .arg("COUNT")
                    .arg(count)
                    .query_async(&mut conn)
                    .await?;
                // HSCAN yields field, value, field, value, ...
                let hooks = flat
                    .chunks(2)
                    .filter_map(|chunk| chunk.get(1))
                    .map(|json| serde_json::from_str(json).map_err(StoreError::from))
                    .collect::<Result<Vec<Hook>, _>>()?;
                let total: u64 = conn.hlen(self.hooks_key()).await?;
                (next, hooks, total)
            }
        };

        Ok(Page {
            items: hooks,
            total,
            next: (next != 0).then(|| Cursor(next.to_string())),
        })
    }

    async fn confirmed_hooks(&self, topic: &str) -> Result<Vec<Hook>, StoreError> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(self.topic_key(topic)).await?;
        let hooks = self.load_hooks(&mut conn, &ids).await?;
        Ok(hooks.into_iter().filter(|h| h.confirmed && h.topic == topic).collect())
    }
}

#[async_trait]
impl HistoryStore for RedisStorage {
    async fn append_record(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(record)?;
        let score = record.created_at.timestamp_millis();
        conn.zadd::<_, _, _, ()>(self.history_key(&record.hook_id), json, score).await?;
        Ok(())
    }

    async fn list_records(&self, hook_id: &HookId) -> Result<Vec<DeliveryRecord>, StoreError> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn.zrange(self.history_key(hook_id), 0, -1).await?;
        members
            .iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    async fn delete_records(&self, hook_id: &HookId, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let key = self.history_key(hook_id);
        let members: Vec<String> = conn.zrange(&key, 0, -1).await?;
        let doomed: Vec<String> = members
            .into_iter()
            .filter(|json| {
                serde_json::from_str::<DeliveryRecord>(json)
                    .map_or(false, |record| ids.contains(&record.id))
            })
            .collect();
        if !doomed.is_empty() {
            conn.zrem::<_, _, ()>(&key, doomed).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RoleTopicStore for RedisStorage {
    async fn insert_role_topic(&self, role_topic: &RoleTopic) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let key = pair(&role_topic.role, &role_topic.topic);
        let json = serde_json::to_string(role_topic)?;
        let inserted: bool = redis::Script::new(CLAIM_AND_INSERT)
            .key(self.role_topic_pairs_key())
            .key(self.role_topics_key())
            .key(self.role_key(&role_topic.role))
            .arg(&key)
            .arg(&role_topic.id)
            .arg(json)
            .arg(&role_topic.topic)
            .invoke_async(&mut conn)
            .await?;
        if !inserted {
            return Err(StoreError::Duplicate(key));
        }
        Ok(())
    }

    async fn get_role_topic(&self, id: &str) -> Result<Option<RoleTopic>, StoreError> {
        let mut conn = self.conn().await?;
        let json: Option<String> = conn.hget(self.role_topics_key(), id).await?;
        json.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn find_role_topic(
        &self,
        role: &str,
        topic: &str,
    ) -> Result<Option<RoleTopic>, StoreError> {
        let id: Option<String> = {
            let mut conn = self.conn().await?;
            conn.hget(self.role_topic_pairs_key(), pair(role, topic)).await?
        };
        match id {
            Some(id) => self.get_role_topic(&id).await,
            None => Ok(None),
        }
    }

    async fn delete_role_topic(&self, id: &str) -> Result<bool, StoreError> {
        let Some(role_topic) = self.get_role_topic(id).await? else {
            return Ok(false);
        };
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .hdel(self.role_topics_key(), id)
            .ignore()
            .hdel(self.role_topic_pairs_key(), pair(&role_topic.role, &role_topic.topic))
            .ignore()
            .srem(self.role_key(&role_topic.role), &role_topic.topic)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(true)
    }

    async fn list_role_topics(&self, page: &PageRequest) -> Result<Page<RoleTopic>, StoreError> {
        let mut conn = self.conn().await?;
        let values: Vec<String> = conn.hvals(self.role_topics_key()).await?;
        let mut items = values
            .iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect::<Result<Vec<RoleTopic>, _>>()?;
        items.sort_by(|a, b| (&a.role, &a.topic).cmp(&(&b.role, &b.topic)));
        paginate(items, page)
    }

    async fn topics_for_roles(&self, roles: &[String]) -> Result<Vec<String>, StoreError> {
        if roles.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let keys: Vec<String> = roles.iter().map(|role| self.role_key(role)).collect();
        let mut topics: Vec<String> = conn.sunion(keys).await?;
        topics.sort();
        topics.dedup();
        Ok(topics)
    }
}
