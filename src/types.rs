use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered subscription.
///
/// A `Hook` describes *which* topic a subscriber listens to and *where*
/// matching events are delivered. The `(topic, endpoint)` pair is unique
/// across all hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    /// Opaque identifier assigned at creation.
    pub id: HookId,

    /// Human readable label.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Topic the hook listens to.
    pub topic: String,

    /// Target URL for delivery.
    pub endpoint: String,

    /// Handle of the owning principal.
    pub owner: String,

    /// Optional boolean expression evaluated against each event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Extra request headers sent with every delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,

    /// Whether the endpoint proved ownership. Only confirmed hooks receive events.
    pub confirmed: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Unique identifier for a hook.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of hook IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HookId(pub String);

impl HookId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HookId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Request body for creating or replacing a hook.
///
/// Optional fields are replaced wholesale on update: omitting
/// `description`, `filter` or `headers` clears them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    /// Honoured for admins only; everyone else owns what they create.
    #[serde(default)]
    pub owner: Option<String>,
}

impl HookData {
    pub fn new(topic: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// One delivery attempt of one event to one hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub id: String,
    pub hook_id: HookId,
    /// The delivered event, serialized as JSON.
    pub request_data: Option<String>,
    /// HTTP status returned by the endpoint, or `500` when none was received.
    pub response_status: u16,
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn new(hook_id: HookId, request_data: Option<String>, response_status: u16) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            hook_id,
            request_data,
            response_status,
            created_at: Utc::now(),
        }
    }
}

/// Grant allowing every principal holding `role` to subscribe to `topic`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleTopic {
    pub id: String,
    pub role: String,
    pub topic: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RoleTopic {
    pub fn new(role: impl Into<String>, topic: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            role: role.into(),
            topic: topic.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Logical event published on a topic.
///
/// The payload is opaque to the engine; it is only inspected by hook filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub originator: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(rename = "mime-type", default)]
    pub mime_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            originator: String::new(),
            timestamp: now_rfc3339(),
            mime_type: "application/json".to_string(),
            payload,
        }
    }

    pub fn with_originator(mut self, originator: impl Into<String>) -> Self {
        self.originator = originator.into();
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }
}

/// Already-authenticated caller of registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub handle: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub is_admin: bool,
}

impl Principal {
    pub fn user(handle: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            handle: handle.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            is_admin: false,
        }
    }

    pub fn admin(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            roles: Vec::new(),
            is_admin: true,
        }
    }

    /// Admins may touch any hook; everyone else only their own.
    pub fn can_access(&self, hook: &Hook) -> bool {
        self.is_admin || hook.owner == self.handle
    }
}

/// Opaque, forward-only pagination token.
///
/// Callers must pass the `next` cursor of a [`Page`] back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

/// Largest page the API hands out; bigger requests are clamped.
pub const MAX_PAGE_LIMIT: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default = "default_page_limit")]
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            cursor: None,
            limit,
        }
    }

    pub fn after(cursor: Cursor, limit: usize) -> Self {
        Self {
            cursor: Some(cursor),
            limit,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::first(default_page_limit())
    }
}

fn default_page_limit() -> usize {
    10
}

/// One page of results plus the total number of matching records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    /// `None` once the listing is exhausted.
    pub next: Option<Cursor>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            next: None,
        }
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
