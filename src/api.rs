//! Transport-agnostic request routing for the registry.
//!
//! Hosts map their HTTP framework's requests onto [`ApiRequest`], call
//! [`Api::handle`] with the already-authenticated [`Principal`] and write
//! the [`ApiResponse`] back out.

use std::collections::{BTreeMap, HashSet};

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::error::HookError;
use crate::registry::HookRegistry;
use crate::role_topics::RoleTopicService;
use crate::topics::TopicCatalog;
use crate::types::{Cursor, HookData, HookId, PageRequest, Principal, MAX_PAGE_LIMIT};

/// Every operation the API exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    ListHooks,
    CreateHook,
    GetHook,
    UpdateHook,
    DeleteHook,
    HookHistories,
    ConfirmHook,
    ListTopics,
    ListRoleTopics,
    CreateRoleTopic,
    DeleteRoleTopic,
}

impl Route {
    pub const ALL: [Route; 11] = [
        Route::ListHooks,
        Route::CreateHook,
        Route::GetHook,
        Route::UpdateHook,
        Route::DeleteHook,
        Route::HookHistories,
        Route::ConfirmHook,
        Route::ListTopics,
        Route::ListRoleTopics,
        Route::CreateRoleTopic,
        Route::DeleteRoleTopic,
    ];

    pub fn method(self) -> Method {
        match self {
            Route::ListHooks
            | Route::GetHook
            | Route::HookHistories
            | Route::ListTopics
            | Route::ListRoleTopics => Method::GET,
            Route::CreateHook | Route::ConfirmHook | Route::CreateRoleTopic => Method::POST,
            Route::UpdateHook => Method::PUT,
            Route::DeleteHook | Route::DeleteRoleTopic => Method::DELETE,
        }
    }

    pub fn template(self) -> &'static str {
        match self {
            Route::ListHooks | Route::CreateHook => "/hooks",
            Route::GetHook | Route::UpdateHook | Route::DeleteHook => "/hooks/:id",
            Route::HookHistories => "/hooks/:id/histories",
            Route::ConfirmHook => "/hooks/:id/confirm",
            Route::ListTopics => "/topics",
            Route::ListRoleTopics | Route::CreateRoleTopic => "/roletopics",
            Route::DeleteRoleTopic => "/roletopics/:id",
        }
    }

    pub fn admin_only(self) -> bool {
        matches!(
            self,
            Route::ListRoleTopics | Route::CreateRoleTopic | Route::DeleteRoleTopic
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("route {method} {path} is registered twice")]
    Duplicate { method: Method, path: String },

    #[error("malformed route template {path:?}: {reason}")]
    Malformed { path: String, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
struct Entry {
    method: Method,
    segments: Vec<Segment>,
    route: Route,
}

/// A resolved request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub route: Route,
    pub params: BTreeMap<String, String>,
}

/// Method + path template lookup, validated once at startup.
#[derive(Debug, Clone)]
pub struct RouteTable {
    entries: Vec<Entry>,
}

impl RouteTable {
    pub fn build() -> Result<Self, RouteError> {
        Self::from_routes(Route::ALL.iter().map(|r| (r.method(), r.template(), *r)))
    }

    fn from_routes<'a, I>(routes: I) -> Result<Self, RouteError>
    where
        I: IntoIterator<Item = (Method, &'a str, Route)>,
    {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for (method, template, route) in routes {
            let segments = parse_template(template)?;
            // Parameter names do not disambiguate two templates.
            let shape: Vec<Option<&str>> = segments
                .iter()
                .map(|s| match s {
                    Segment::Literal(lit) => Some(lit.as_str()),
                    Segment::Param(_) => None,
                })
                .collect();
            let key = (method.clone(), format!("{shape:?}"));
            if !seen.insert(key) {
                return Err(RouteError::Duplicate {
                    method,
                    path: template.to_string(),
                });
            }
            entries.push(Entry {
                method,
                segments,
                route,
            });
        }
        Ok(Self { entries })
    }

    /// Query strings are ignored; pass them through [`ApiRequest::query`].
    pub fn resolve(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let path = path.split('?').next().unwrap_or_default();
        let parts: Vec<&str> = path.trim_end_matches('/').split('/').skip(1).collect();
        self.entries
            .iter()
            .filter(|entry| &entry.method == method && entry.segments.len() == parts.len())
            .find_map(|entry| {
                let mut params = BTreeMap::new();
                for (segment, part) in entry.segments.iter().zip(&parts) {
                    match segment {
                        Segment::Literal(lit) if lit == part => {}
                        Segment::Param(name) if !part.is_empty() => {
                            params.insert(name.clone(), (*part).to_string());
                        }
                        _ => return None,
                    }
                }
                Some(RouteMatch {
                    route: entry.route,
                    params,
                })
            })
    }
}

fn parse_template(template: &str) -> Result<Vec<Segment>, RouteError> {
    let malformed = |reason| RouteError::Malformed {
        path: template.to_string(),
        reason,
    };
    let rest = template
        .strip_prefix('/')
        .ok_or_else(|| malformed("must start with '/'"))?;
    if rest.is_empty() {
        return Err(malformed("must name at least one segment"));
    }
    rest.split('/')
        .map(|part| match part.strip_prefix(':') {
            _ if part.is_empty() => Err(malformed("empty segment")),
            Some(name) if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') => {
                Err(malformed("invalid parameter name"))
            }
            Some(name) => Ok(Segment::Param(name.to_string())),
            None => Ok(Segment::Literal(part.to_string())),
        })
        .collect()
}

/// Inbound API call, already authenticated.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self { status: 200, body },
            Err(err) => {
                tracing::error!(error = %err, "failed to encode response");
                Self::message(500, "failed to encode response")
            }
        }
    }

    fn message(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "message": message.into() }),
        }
    }

    fn from_error(err: &HookError) -> Self {
        if let HookError::Storage(source) = err {
            tracing::error!(error = %source, "storage failure while serving request");
        }
        Self::message(err.status_code(), err.to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RoleTopicData {
    #[serde(default)]
    role: String,
    #[serde(default)]
    topic: String,
}

/// Registry, role-topic administration and the topic catalog behind one router.
#[derive(Clone)]
pub struct Api {
    registry: HookRegistry,
    role_topics: RoleTopicService,
    catalog: TopicCatalog,
    routes: RouteTable,
}

impl Api {
    /// Fails if the route table is inconsistent.
    pub fn new(
        registry: HookRegistry,
        role_topics: RoleTopicService,
        catalog: TopicCatalog,
    ) -> Result<Self, RouteError> {
        Ok(Self {
            registry,
            role_topics,
            catalog,
            routes: RouteTable::build()?,
        })
    }

    pub async fn handle(&self, principal: &Principal, request: ApiRequest) -> ApiResponse {
        let Some(matched) = self.routes.resolve(&request.method, &request.path) else {
            return ApiResponse::message(404, format!("no route for {} {}", request.method, request.path));
        };
        if matched.route.admin_only() && !principal.is_admin {
            return ApiResponse::from_error(&HookError::Forbidden(
                "only admins may perform this operation".to_string(),
            ));
        }
        match self.dispatch(principal, &matched, request).await {
            Ok(response) => response,
            Err(err) => ApiResponse::from_error(&err),
        }
    }

    async fn dispatch(
        &self,
        principal: &Principal,
        matched: &RouteMatch,
        request: ApiRequest,
    ) -> Result<ApiResponse, HookError> {
        let id = || matched.params.get("id").cloned().unwrap_or_default();
        let response = match matched.route {
            Route::ListHooks => {
                let owner = request.query.get("owner").map(String::as_str);
                let page = page_request(&request.query)?;
                ApiResponse::ok(&self.registry.list(principal, owner, &page).await?)
            }
            Route::CreateHook => {
                let data: HookData = body(request.body)?;
                ApiResponse::ok(&self.registry.create(principal, data).await?)
            }
            Route::GetHook => {
                ApiResponse::ok(&self.registry.get(principal, &HookId(id())).await?)
            }
            Route::UpdateHook => {
                let data: HookData = body(request.body)?;
                ApiResponse::ok(&self.registry.update(principal, &HookId(id()), data).await?)
            }
            Route::DeleteHook => {
                self.registry.delete(principal, &HookId(id())).await?;
                ApiResponse::ok(&Value::Null)
            }
            Route::HookHistories => {
                ApiResponse::ok(&self.registry.histories(principal, &HookId(id())).await?)
            }
            Route::ConfirmHook => {
                ApiResponse::ok(&self.registry.confirm(principal, &HookId(id())).await?)
            }
            Route::ListTopics => {
                if principal.is_admin {
                    ApiResponse::ok(&*self.catalog.snapshot())
                } else {
                    ApiResponse::ok(&self.registry.gate().topics_for_roles(&principal.roles).await?)
                }
            }
            Route::ListRoleTopics => {
                let page = page_request(&request.query)?;
                ApiResponse::ok(&self.role_topics.list(&page).await?)
            }
            Route::CreateRoleTopic => {
                let data: RoleTopicData = body(request.body)?;
                ApiResponse::ok(&self.role_topics.create(&data.role, &data.topic).await?)
            }
            Route::DeleteRoleTopic => {
                self.role_topics.remove(&id()).await?;
                ApiResponse::ok(&Value::Null)
            }
        };
        Ok(response)
    }
}

fn body<T: for<'de> Deserialize<'de> + Default>(body: Option<Value>) -> Result<T, HookError> {
    match body {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value)
            .map_err(|err| HookError::validation(format!("invalid request body: {err}"))),
    }
}

fn page_request(query: &BTreeMap<String, String>) -> Result<PageRequest, HookError> {
    let mut page = PageRequest::default();
    if let Some(limit) = query.get("limit") {
        page.limit = limit
            .parse::<usize>()
            .ok()
            .filter(|limit| *limit > 0)
            .ok_or_else(|| HookError::validation(format!("invalid limit {limit:?}")))?
            .min(MAX_PAGE_LIMIT);
    }
    page.cursor = query.get("cursor").map(|c| Cursor(c.clone()));
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_route_resolves_to_itself() {
        let table = RouteTable::build().unwrap();
        for route in Route::ALL {
            let path = route.template().replace(":id", "abc");
            let matched = table.resolve(&route.method(), &path).unwrap();
            assert_eq!(matched.route, route, "{path}");
            if route.template().contains(":id") {
                assert_eq!(matched.params.get("id").map(String::as_str), Some("abc"));
            }
        }
    }

    #[test]
    fn unknown_method_or_path_does_not_resolve() {
        let table = RouteTable::build().unwrap();
        assert!(table.resolve(&Method::PATCH, "/hooks/abc").is_none());
        assert!(table.resolve(&Method::GET, "/hooks/abc/unknown").is_none());
        assert!(table.resolve(&Method::GET, "/hooks//histories").is_none());
        assert_eq!(
            table.resolve(&Method::GET, "/hooks?owner=alice").map(|m| m.route),
            Some(Route::ListHooks)
        );
    }

    #[test]
    fn duplicate_routes_fail_fast() {
        let err = RouteTable::from_routes([
            (Method::GET, "/hooks/:id", Route::GetHook),
            (Method::GET, "/hooks/:hook", Route::HookHistories),
        ])
        .unwrap_err();
        assert!(matches!(err, RouteError::Duplicate { .. }));
    }

    #[test]
    fn malformed_templates_fail_fast() {
        for template in ["hooks", "/", "/hooks//x", "/hooks/:", "/hooks/:a-b"] {
            let err = RouteTable::from_routes([(Method::GET, template, Route::ListHooks)]).unwrap_err();
            assert!(matches!(err, RouteError::Malformed { .. }), "{template}");
        }
    }

    #[test]
    fn only_role_topic_routes_are_admin_only() {
        let admin: Vec<Route> = Route::ALL.into_iter().filter(|r| r.admin_only()).collect();
        assert_eq!(
            admin,
            vec![Route::ListRoleTopics, Route::CreateRoleTopic, Route::DeleteRoleTopic]
        );
    }

    #[test]
    fn limit_must_be_positive() {
        let mut query = BTreeMap::new();
        query.insert("limit".to_string(), "0".to_string());
        assert!(page_request(&query).is_err());
        query.insert("limit".to_string(), "25".to_string());
        assert_eq!(page_request(&query).unwrap().limit, 25);
    }

    #[test]
    fn oversized_limit_is_clamped() {
        let mut query = BTreeMap::new();
        query.insert("limit".to_string(), u64::MAX.to_string());
        assert_eq!(page_request(&query).unwrap().limit, MAX_PAGE_LIMIT);
    }
}
