use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::EngineConfig;
use crate::error::DispatchError;
use crate::filter::FilterSandbox;
use crate::history::HistoryLog;
use crate::storage::Storage;
use crate::types::{Event, Hook};
use crate::worker::{http_client, process_task, DeliveryReport, Task, WorkerContext};

/// Counts for one [`Dispatcher::notify`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Confirmed hooks subscribed to the event's topic.
    pub matched: usize,
    /// Hooks skipped because their filter rejected the event or failed.
    pub filtered_out: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl DispatchSummary {
    fn absorb(&mut self, result: Option<DeliveryReport>) {
        match result {
            None => self.filtered_out += 1,
            Some(report) if report.outcome.is_delivered() => self.delivered += 1,
            Some(_) => self.failed += 1,
        }
    }
}

/// Fans events out to the confirmed hooks of their topic.
///
/// Every matching hook gets its own task: filter, one delivery attempt,
/// one history record. Tasks are independent; a slow or failing endpoint
/// never holds up its siblings. The number of tasks in flight across all
/// `notify` calls is capped by a shared semaphore.
pub struct Dispatcher {
    store: Arc<dyn Storage>,
    filter: FilterSandbox,
    ctx: Arc<WorkerContext>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(config: &EngineConfig, store: Arc<dyn Storage>) -> Self {
        let ctx = WorkerContext {
            http_client: http_client(),
            history: HistoryLog::new(store.clone(), config.history_count),
            timeout: config.delivery_timeout(),
        };
        Self::with_parts(
            store,
            FilterSandbox::from_config(config),
            ctx,
            config.max_concurrent_deliveries,
        )
    }

    /// Assemble a dispatcher from explicit collaborators.
    pub fn with_parts(
        store: Arc<dyn Storage>,
        filter: FilterSandbox,
        ctx: WorkerContext,
        max_concurrent_deliveries: usize,
    ) -> Self {
        Self {
            store,
            filter,
            ctx: Arc::new(ctx),
            permits: Arc::new(Semaphore::new(max_concurrent_deliveries.max(1))),
        }
    }

    pub fn history(&self) -> &HistoryLog {
        &self.ctx.history
    }

    /// Deliver `event` to every confirmed hook on its topic whose filter accepts it.
    ///
    /// Resolves once every delivery has finished and been recorded. Only a
    /// failure to load the hooks is an error.
    pub async fn notify(&self, event: Event) -> Result<DispatchSummary, DispatchError> {
        let hooks = self
            .store
            .confirmed_hooks(&event.topic)
            .await
            .map_err(|source| DispatchError::Storage {
                topic: event.topic.clone(),
                source,
            })?;

        let mut summary = DispatchSummary {
            matched: hooks.len(),
            ..DispatchSummary::default()
        };
        if hooks.is_empty() {
            tracing::debug!(topic = %event.topic, "no confirmed hooks for topic");
            return Ok(summary);
        }

        let message = Arc::new(serde_json::to_value(&event)?);
        let body = Arc::new(message.to_string());
        let event = Arc::new(event);

        let mut tasks = JoinSet::new();
        for hook in hooks {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::error!(hook_id = %hook.id, "delivery permits closed, skipping hook");
                    summary.failed += 1;
                    continue;
                }
            };

            let filter = self.filter.clone();
            let ctx = self.ctx.clone();
            let message = message.clone();
            let task = Task {
                hook,
                event: event.clone(),
                body: body.clone(),
            };
            tasks.spawn(async move {
                let _permit = permit;
                run_one(task, &filter, &message, &ctx).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => summary.absorb(result),
                Err(err) => {
                    tracing::error!(topic = %event.topic, error = %err, "delivery task aborted");
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            topic = %event.topic,
            matched = summary.matched,
            filtered_out = summary.filtered_out,
            delivered = summary.delivered,
            failed = summary.failed,
            "event dispatched"
        );
        Ok(summary)
    }

    /// Run [`notify`](Self::notify) in the background.
    ///
    /// The returned handle may be dropped; errors are logged.
    pub fn spawn_notify(self: &Arc<Self>, event: Event) -> JoinHandle<Option<DispatchSummary>> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let topic = event.topic.clone();
            match dispatcher.notify(event).await {
                Ok(summary) => Some(summary),
                Err(err) => {
                    tracing::error!(topic = %topic, error = %err, "event dispatch failed");
                    None
                }
            }
        })
    }
}

/// `None` when the hook's filter skipped the event.
async fn run_one(
    task: Task,
    filter: &FilterSandbox,
    message: &Arc<Value>,
    ctx: &WorkerContext,
) -> Option<DeliveryReport> {
    if !wants(filter, &task.hook, message).await {
        return None;
    }
    Some(process_task(task, ctx).await)
}

async fn wants(filter: &FilterSandbox, hook: &Hook, message: &Arc<Value>) -> bool {
    hook.confirmed && filter.evaluate(hook, message).await
}
