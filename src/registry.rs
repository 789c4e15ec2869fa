use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;

use crate::auth::AuthorizationGate;
use crate::config::EngineConfig;
use crate::confirm::{EndpointConfirmer, HttpConfirmer};
use crate::error::{HookError, StoreError};
use crate::filter::FilterSandbox;
use crate::history::HistoryLog;
use crate::storage::Storage;
use crate::types::{DeliveryRecord, Hook, HookData, HookId, Page, PageRequest, Principal};

pub const NAME_MAX_LENGTH: usize = 50;
pub const DESCRIPTION_MAX_LENGTH: usize = 400;

/// CRUD over hooks, scoped by ownership and role-topic grants.
///
/// Every check (validation, topic grant, ownership, uniqueness) runs before
/// the first write. Creating a hook, or moving it to a new endpoint, runs the
/// confirmation handshake; the write succeeds whatever its result.
#[derive(Clone)]
pub struct HookRegistry {
    store: Arc<dyn Storage>,
    gate: AuthorizationGate,
    confirmer: Arc<dyn EndpointConfirmer>,
    filter: FilterSandbox,
    history: HistoryLog,
    filter_max_length: usize,
    max_headers: usize,
}

/// Validated, trimmed form of [`HookData`].
struct Fields {
    name: String,
    description: Option<String>,
    topic: String,
    endpoint: String,
    filter: Option<String>,
    headers: Option<BTreeMap<String, String>>,
}

impl HookRegistry {
    pub fn new(config: &EngineConfig, store: Arc<dyn Storage>) -> Self {
        Self {
            gate: AuthorizationGate::new(store.clone()),
            confirmer: Arc::new(HttpConfirmer::new(config.confirm_timeout())),
            filter: FilterSandbox::from_config(config),
            history: HistoryLog::new(store.clone(), config.history_count),
            filter_max_length: config.filter_max_length,
            max_headers: config.max_headers,
            store,
        }
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn EndpointConfirmer>) -> Self {
        self.confirmer = confirmer;
        self
    }

    pub fn gate(&self) -> &AuthorizationGate {
        &self.gate
    }

    /// Non-admins only ever see their own hooks, whatever `owner` says.
    pub async fn list(
        &self,
        principal: &Principal,
        owner: Option<&str>,
        page: &PageRequest,
    ) -> Result<Page<Hook>, HookError> {
        let owner = if principal.is_admin {
            owner.map(str::trim).filter(|o| !o.is_empty())
        } else {
            Some(principal.handle.as_str())
        };
        Ok(self.store.list_hooks(owner, page).await?)
    }

    pub async fn create(&self, principal: &Principal, data: HookData) -> Result<Hook, HookError> {
        let fields = self.validate(&data)?;
        self.gate.assert_topic_allowed(principal, &fields.topic).await?;
        if self.store.find_hook(&fields.topic, &fields.endpoint).await?.is_some() {
            return Err(conflict());
        }

        let owner = match data.owner.as_deref().map(str::trim) {
            Some(owner) if principal.is_admin && !owner.is_empty() => owner.to_string(),
            _ => principal.handle.clone(),
        };
        let confirmed = self.confirmer.confirm(&fields.endpoint).await;

        let now = Utc::now();
        let hook = Hook {
            id: HookId::generate(),
            name: fields.name,
            description: fields.description,
            topic: fields.topic,
            endpoint: fields.endpoint,
            owner,
            filter: fields.filter,
            headers: fields.headers,
            confirmed,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_hook(&hook).await.map_err(write_error)?;

        tracing::info!(hook_id = %hook.id, topic = %hook.topic, endpoint = %hook.endpoint, confirmed, "hook created");
        Ok(hook)
    }

    pub async fn get(&self, principal: &Principal, id: &HookId) -> Result<Hook, HookError> {
        self.resolve(principal, id).await
    }

    pub async fn update(
        &self,
        principal: &Principal,
        id: &HookId,
        data: HookData,
    ) -> Result<Hook, HookError> {
        let existing = self.resolve(principal, id).await?;
        let fields = self.validate(&data)?;
        self.gate.assert_topic_allowed(principal, &fields.topic).await?;
        if let Some(other) = self.store.find_hook(&fields.topic, &fields.endpoint).await? {
            if other.id != existing.id {
                return Err(conflict());
            }
        }

        let owner = match data.owner.as_deref().map(str::trim) {
            Some(owner) if principal.is_admin && !owner.is_empty() => owner.to_string(),
            _ => existing.owner.clone(),
        };
        let endpoint_changed = fields.endpoint != existing.endpoint;
        let confirmed = if endpoint_changed {
            self.confirmer.confirm(&fields.endpoint).await
        } else {
            existing.confirmed
        };

        let hook = Hook {
            id: existing.id,
            name: fields.name,
            description: fields.description,
            topic: fields.topic,
            endpoint: fields.endpoint,
            owner,
            filter: fields.filter,
            headers: fields.headers,
            confirmed,
            created_at: existing.created_at,
            updated_at: Utc::now(),
        };
        if !self.store.replace_hook(&hook).await.map_err(write_error)? {
            return Err(not_found(&hook.id));
        }

        tracing::info!(hook_id = %hook.id, endpoint_changed, confirmed, "hook updated");
        Ok(hook)
    }

    /// Removes the hook together with its delivery history.
    pub async fn delete(&self, principal: &Principal, id: &HookId) -> Result<(), HookError> {
        let hook = self.resolve(principal, id).await?;
        if !self.store.delete_hook(&hook.id).await? {
            return Err(not_found(id));
        }
        tracing::info!(hook_id = %hook.id, "hook deleted");
        Ok(())
    }

    /// Re-run the confirmation handshake against the current endpoint.
    ///
    /// Only the confirmation flag is written back, onto a fresh read of the
    /// hook, so updates made during the handshake survive. A result for an
    /// endpoint the hook no longer has is dropped.
    pub async fn confirm(&self, principal: &Principal, id: &HookId) -> Result<Hook, HookError> {
        let hook = self.resolve(principal, id).await?;
        let confirmed = self.confirmer.confirm(&hook.endpoint).await;

        let mut current = self.store.get_hook(id).await?.ok_or_else(|| not_found(id))?;
        if current.endpoint != hook.endpoint {
            tracing::info!(hook_id = %id, "endpoint changed during confirmation, result dropped");
            return Ok(current);
        }
        current.confirmed = confirmed;
        current.updated_at = Utc::now();
        if !self.store.replace_hook(&current).await.map_err(write_error)? {
            return Err(not_found(id));
        }
        Ok(current)
    }

    /// Delivery records of the hook, newest first.
    pub async fn histories(
        &self,
        principal: &Principal,
        id: &HookId,
    ) -> Result<Vec<DeliveryRecord>, HookError> {
        let hook = self.resolve(principal, id).await?;
        Ok(self.history.list(&hook.id).await?)
    }

    async fn resolve(&self, principal: &Principal, id: &HookId) -> Result<Hook, HookError> {
        let hook = self
            .store
            .get_hook(id)
            .await?
            .ok_or_else(|| not_found(id))?;
        if !principal.can_access(&hook) {
            return Err(HookError::Forbidden(format!(
                "you are not allowed to access hook {id}"
            )));
        }
        Ok(hook)
    }

    fn validate(&self, data: &HookData) -> Result<Fields, HookError> {
        let topic = data.topic.trim();
        if topic.is_empty() {
            return Err(HookError::validation("topic is required"));
        }
        let endpoint = data.endpoint.trim();
        if endpoint.is_empty() {
            return Err(HookError::validation("endpoint is required"));
        }
        validate_endpoint(endpoint)?;

        let name = match data.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => topic,
        };
        if name.chars().count() > NAME_MAX_LENGTH {
            return Err(HookError::validation(format!(
                "name must be at most {NAME_MAX_LENGTH} characters"
            )));
        }

        let description = data
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty());
        if description.map_or(false, |d| d.chars().count() > DESCRIPTION_MAX_LENGTH) {
            return Err(HookError::validation(format!(
                "description must be at most {DESCRIPTION_MAX_LENGTH} characters"
            )));
        }

        let filter = data
            .filter
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty());
        if let Some(filter) = filter {
            if filter.chars().count() > self.filter_max_length {
                return Err(HookError::validation(format!(
                    "filter must be at most {} characters",
                    self.filter_max_length
                )));
            }
            self.filter
                .check(filter)
                .map_err(|err| HookError::validation(format!("invalid filter: {err}")))?;
        }

        let headers = match &data.headers {
            Some(headers) if !headers.is_empty() => {
                self.validate_headers(headers)?;
                Some(headers.clone())
            }
            _ => None,
        };

        Ok(Fields {
            name: name.to_string(),
            description: description.map(str::to_string),
            topic: topic.to_string(),
            endpoint: endpoint.to_string(),
            filter: filter.map(str::to_string),
            headers,
        })
    }

    fn validate_headers(&self, headers: &BTreeMap<String, String>) -> Result<(), HookError> {
        if headers.len() > self.max_headers {
            return Err(HookError::validation(format!(
                "at most {} headers are allowed",
                self.max_headers
            )));
        }
        for (name, value) in headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| HookError::validation(format!("invalid header name {name:?}")))?;
            HeaderValue::from_str(value)
                .map_err(|_| HookError::validation(format!("invalid value for header {name}")))?;
        }
        Ok(())
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), HookError> {
    let url = Url::parse(endpoint)
        .map_err(|err| HookError::validation(format!("endpoint is not a valid URL: {err}")))?;
    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(()),
        "http" | "https" => Err(HookError::validation("endpoint must include a host")),
        scheme => Err(HookError::validation(format!(
            "endpoint scheme {scheme} is not supported"
        ))),
    }
}

fn conflict() -> HookError {
    HookError::Conflict("The hook is already defined.".to_string())
}

fn not_found(id: &HookId) -> HookError {
    HookError::NotFound(format!("RestHook not found with id: {id}"))
}

/// The unique `(topic, endpoint)` index is the final arbiter for racing writers.
fn write_error(err: StoreError) -> HookError {
    match err {
        StoreError::Duplicate(_) => conflict(),
        other => other.into(),
    }
}
