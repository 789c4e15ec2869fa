//! A topic-based REST hook registry and webhook dispatch engine.
//!
//! Subscribers register a [`Hook`] (topic + HTTP endpoint, optionally a
//! filter expression and extra headers). Each hook must prove it controls its
//! endpoint through a challenge/response handshake before it receives
//! anything. Events published on a topic are then POSTed to every confirmed,
//! matching hook, and each attempt is kept in a bounded per-hook history.
//!
//! ## Guarantees
//! - Unconfirmed hooks never receive events
//! - One `(topic, endpoint)` pair per hook
//! - Bounded resource usage (filter budget, delivery concurrency, history size)
//! - Per-hook isolation: one failing endpoint never affects another
//!
//! ## Non-Guarantees
//! - Retries or redelivery
//! - Delivery ordering
//! - Exactly-once delivery
//! - Atomic history trimming under concurrent deliveries
//!
//! This crate is a library, not a hosted service. Authentication, the HTTP
//! server and the message broker consumer belong to the host; see
//! [`Api`] and [`EventIngestor`] for the seams.

mod api;
mod auth;
mod config;
mod confirm;
mod dispatcher;
mod error;
mod filter;
mod history;
mod ingest;
mod registry;
mod role_topics;
mod storage;
mod telemetry;
mod topics;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod storage_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use api::{Api, ApiRequest, ApiResponse, Route, RouteError, RouteMatch, RouteTable};
pub use auth::AuthorizationGate;
pub use config::{ConfigError, EngineConfig};
pub use confirm::{generate_secret, EndpointConfirmer, HttpConfirmer, HOOK_SECRET_HEADER};
pub use dispatcher::{DispatchSummary, Dispatcher};
pub use error::{
    DeliveryOutcome,
    DispatchError,
    FailureReason,
    HookError,
    StoreError,
    TRANSPORT_FAILURE_STATUS,
};
pub use filter::{Evaluator, ExpressionEvaluator, FilterError, FilterSandbox};
pub use history::HistoryLog;
pub use ingest::{decode as decode_event, is_system_topic, EventIngestor, IngestError, Ingested};
pub use registry::{HookRegistry, DESCRIPTION_MAX_LENGTH, NAME_MAX_LENGTH};
pub use role_topics::RoleTopicService;
pub use storage::{HistoryStore, HookStore, InMemoryStorage, RoleTopicStore, Storage};
pub use topics::{StaticTopics, TopicCatalog, TopicSource};
pub use types::{
    Cursor,
    DeliveryRecord,
    Event,
    Hook,
    HookData,
    HookId,
    Page,
    PageRequest,
    Principal,
    RoleTopic,
    MAX_PAGE_LIMIT,
};
pub use worker::{deliver, DeliveryReport, WorkerContext};

#[cfg(feature = "redis")]
pub use storage_redis::RedisStorage;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStorage;
