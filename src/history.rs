use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::StoreError;
use crate::storage::Storage;
use crate::types::{DeliveryRecord, HookId};

/// Bounded per-hook delivery log.
///
/// Retention is enforced with a read-sort-delete pass after every append.
/// Concurrent deliveries to the same hook may briefly leave more than
/// `keep` records; the next trim converges. A trim never deletes any of the
/// `keep` newest records it observed.
#[derive(Clone)]
pub struct HistoryLog {
    store: Arc<dyn Storage>,
    keep: usize,
}

impl HistoryLog {
    pub fn new(store: Arc<dyn Storage>, keep: usize) -> Self {
        Self { store, keep }
    }

    pub fn retention(&self) -> usize {
        self.keep
    }

    /// Append `record`, then evict everything older than the retention window.
    pub async fn record(&self, record: DeliveryRecord) -> Result<(), StoreError> {
        let hook_id = record.hook_id.clone();
        self.store.append_record(&record).await?;
        self.trim(&hook_id, self.keep).await?;
        Ok(())
    }

    /// Records for `hook_id`, newest first.
    pub async fn list(&self, hook_id: &HookId) -> Result<Vec<DeliveryRecord>, StoreError> {
        let mut records = self.store.list_records(hook_id).await?;
        records.sort_by(newest_first);
        Ok(records)
    }

    /// Keep only the `keep` most recent records. Returns how many were removed.
    pub async fn trim(&self, hook_id: &HookId, keep: usize) -> Result<usize, StoreError> {
        let records = self.list(hook_id).await?;
        if records.len() <= keep {
            return Ok(0);
        }
        let evicted: Vec<String> = records.into_iter().skip(keep).map(|r| r.id).collect();
        self.store.delete_records(hook_id, &evicted).await?;
        Ok(evicted.len())
    }
}

fn newest_first(a: &DeliveryRecord, b: &DeliveryRecord) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{HistoryStore, InMemoryStorage};
    use chrono::{Duration, Utc};

    fn record_at(hook: &HookId, id: &str, secs_ago: i64) -> DeliveryRecord {
        DeliveryRecord {
            id: id.to_string(),
            hook_id: hook.clone(),
            request_data: None,
            response_status: 200,
            created_at: Utc::now() - Duration::seconds(secs_ago),
        }
    }

    #[tokio::test]
    async fn trim_keeps_most_recent_records() {
        let storage = Arc::new(InMemoryStorage::new());
        let log = HistoryLog::new(storage.clone(), 2);
        let hook = HookId::from("h1");

        for (id, age) in [("a", 40), ("b", 30), ("c", 20), ("d", 10)] {
            storage.append_record(&record_at(&hook, id, age)).await.unwrap();
        }

        assert_eq!(log.trim(&hook, 2).await.unwrap(), 2);
        let ids: Vec<String> = log.list(&hook).await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["d".to_string(), "c".to_string()]);

        // A second pass over an already-trimmed log is a no-op.
        assert_eq!(log.trim(&hook, 2).await.unwrap(), 0);
        assert_eq!(log.list(&hook).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn record_enforces_retention() {
        let storage = Arc::new(InMemoryStorage::new());
        let log = HistoryLog::new(storage, 3);
        let hook = HookId::from("h1");

        for age in (0..5).rev() {
            log.record(record_at(&hook, &format!("r{age}"), age)).await.unwrap();
        }

        let records = log.list(&hook).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].id, "r0");
        assert!(records.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }
}
