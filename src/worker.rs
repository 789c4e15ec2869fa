use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};

use crate::error::{DeliveryOutcome, FailureReason};
use crate::history::HistoryLog;
use crate::telemetry::{metric_inc_topic, DELIVERY_FAILURE, DELIVERY_SUCCESS};
use crate::types::{DeliveryRecord, Event, Hook};

/// One event bound for one hook.
#[derive(Debug, Clone)]
pub struct Task {
    pub hook: Hook,
    pub event: Arc<Event>,
    /// The event serialized once per dispatch, shared by every task.
    pub body: Arc<String>,
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub hook: Hook,
    pub outcome: DeliveryOutcome,
}

/// Shared, read-only context for delivery tasks.
pub struct WorkerContext {
    pub http_client: reqwest::Client,
    pub history: HistoryLog,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// HTTP client that never follows redirects.
///
/// A 3xx answer is reported as-is, so requests only ever reach the endpoint
/// that passed confirmation.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_else(|err| {
            tracing::error!(error = %err, "failed to build HTTP client");
            reqwest::Client::new()
        })
}

/// Deliver one task and record the outcome in the hook's history.
///
/// Never fails: delivery and history errors are logged and folded into the report.
pub async fn process_task(task: Task, ctx: &WorkerContext) -> DeliveryReport {
    let outcome = deliver(&ctx.http_client, &task.hook, &task.body, ctx.timeout).await;

    match &outcome {
        DeliveryOutcome::Delivered { status } => {
            metric_inc_topic(DELIVERY_SUCCESS, &task.event.topic);
            tracing::debug!(hook_id = %task.hook.id, endpoint = %task.hook.endpoint, status, "event delivered");
        }
        DeliveryOutcome::Failed(reason) => {
            metric_inc_topic(DELIVERY_FAILURE, &task.event.topic);
            tracing::warn!(
                hook_id = %task.hook.id,
                endpoint = %task.hook.endpoint,
                topic = %task.event.topic,
                reason = %reason,
                "event delivery failed"
            );
        }
    }

    let record = DeliveryRecord::new(
        task.hook.id.clone(),
        Some(task.body.as_ref().clone()),
        outcome.response_status(),
    );
    if let Err(err) = ctx.history.record(record).await {
        tracing::error!(hook_id = %task.hook.id, error = %err, "failed to record delivery history");
    }

    DeliveryReport {
        hook: task.hook,
        outcome,
    }
}

/// Single HTTP attempt; no retries.
pub async fn deliver(
    client: &reqwest::Client,
    hook: &Hook,
    body: &str,
    timeout: Duration,
) -> DeliveryOutcome {
    let headers = match build_headers(hook) {
        Ok(headers) => headers,
        Err(reason) => return DeliveryOutcome::Failed(reason),
    };

    let response = client
        .post(&hook.endpoint)
        .headers(headers)
        .body(body.to_string())
        .timeout(timeout)
        .send()
        .await;

    match response {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                DeliveryOutcome::Delivered {
                    status: status.as_u16(),
                }
            } else if status.is_client_error() {
                DeliveryOutcome::Failed(FailureReason::ClientError(status.as_u16()))
            } else {
                DeliveryOutcome::Failed(FailureReason::RemoteError(status.as_u16()))
            }
        }
        Err(err) => {
            if err.is_timeout() {
                DeliveryOutcome::Failed(FailureReason::Timeout)
            } else if err.is_builder() {
                DeliveryOutcome::Failed(FailureReason::InvalidRequest)
            } else {
                DeliveryOutcome::Failed(FailureReason::Network)
            }
        }
    }
}

fn build_headers(hook: &Hook) -> Result<HeaderMap, FailureReason> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    for (name, value) in hook.headers.iter().flatten() {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| FailureReason::InvalidRequest)?;
        let value = HeaderValue::from_str(value).map_err(|_| FailureReason::InvalidRequest)?;
        headers.insert(name, value);
    }
    Ok(headers)
}
