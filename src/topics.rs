use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ingest::is_system_topic;

/// Floor for the refresh interval; `tokio::time::interval` rejects zero.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);

/// Source of the topics events can currently be published on,
/// typically the message broker's metadata.
#[async_trait]
pub trait TopicSource: Send + Sync + 'static {
    async fn list_topics(&self) -> Result<Vec<String>, String>;
}

/// Fixed topic list, for tests and brokerless deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticTopics(pub Vec<String>);

#[async_trait]
impl TopicSource for StaticTopics {
    async fn list_topics(&self) -> Result<Vec<String>, String> {
        Ok(self.0.clone())
    }
}

/// Periodically refreshed snapshot of known topics.
///
/// A single background task owns the refresh and publishes immutable
/// snapshots; readers never block it. The task stops once every
/// `TopicCatalog` clone has been dropped.
#[derive(Debug, Clone)]
pub struct TopicCatalog {
    rx: watch::Receiver<Arc<Vec<String>>>,
}

impl TopicCatalog {
    /// Load the first snapshot, then keep refreshing every `interval`
    /// (at least one millisecond).
    pub async fn spawn<S: TopicSource>(source: S, interval: Duration) -> (Self, JoinHandle<()>) {
        let initial = match source.list_topics().await {
            Ok(topics) => normalize(topics),
            Err(err) => {
                tracing::warn!(error = %err, "initial topic refresh failed, starting empty");
                Vec::new()
            }
        };
        let (tx, rx) = watch::channel(Arc::new(initial));
        let interval = interval.max(MIN_REFRESH_INTERVAL);
        let handle = tokio::spawn(refresh_loop(source, tx, interval));
        (Self { rx }, handle)
    }

    /// Catalog that never refreshes.
    pub fn fixed(topics: Vec<String>) -> Self {
        let (_tx, rx) = watch::channel(Arc::new(normalize(topics)));
        Self { rx }
    }

    /// Sorted, distinct, non-system topics as of the last successful refresh.
    pub fn snapshot(&self) -> Arc<Vec<String>> {
        self.rx.borrow().clone()
    }
}

async fn refresh_loop<S: TopicSource>(
    source: S,
    tx: watch::Sender<Arc<Vec<String>>>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately and the initial load already ran.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tx.closed() => break,
            _ = ticker.tick() => {}
        }
        match source.list_topics().await {
            Ok(topics) => {
                let topics = normalize(topics);
                tracing::debug!(count = topics.len(), "topic catalog refreshed");
                if tx.send(Arc::new(topics)).is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "topic refresh failed, keeping previous snapshot");
            }
        }
    }
    tracing::debug!("topic catalog refresher stopped");
}

fn normalize(topics: Vec<String>) -> Vec<String> {
    topics
        .into_iter()
        .filter(|topic| !topic.trim().is_empty() && !is_system_topic(topic))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Succeeds once, then fails every refresh.
    struct FlakySource {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TopicSource for FlakySource {
        async fn list_topics(&self) -> Result<Vec<String>, String> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec!["orders".to_string()])
            } else {
                Err("broker unavailable".to_string())
            }
        }
    }

    #[test]
    fn snapshot_is_sorted_distinct_and_hides_system_topics() {
        let catalog = TopicCatalog::fixed(vec![
            "payments".to_string(),
            "__consumer_offsets".to_string(),
            "orders".to_string(),
            "payments".to_string(),
        ]);
        assert_eq!(
            catalog.snapshot().as_slice(),
            ["orders".to_string(), "payments".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = FlakySource {
            calls: calls.clone(),
        };
        let (catalog, _handle) = TopicCatalog::spawn(source, Duration::from_millis(10)).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(calls.load(Ordering::SeqCst) > 1);
        assert_eq!(catalog.snapshot().as_slice(), ["orders".to_string()]);
    }

    #[tokio::test]
    async fn refresher_stops_when_catalog_is_dropped() {
        let (catalog, handle) = TopicCatalog::spawn(
            StaticTopics(vec!["orders".to_string()]),
            Duration::from_millis(10),
        )
        .await;
        drop(catalog);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn zero_interval_is_clamped_instead_of_panicking() {
        let (catalog, handle) =
            TopicCatalog::spawn(StaticTopics(vec!["orders".to_string()]), Duration::ZERO).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        assert_eq!(catalog.snapshot().as_slice(), ["orders".to_string()]);

        drop(catalog);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
