mod common;

use std::sync::Arc;

use serde_json::json;

use common::{spawn_endpoint, test_config, Engine, Mode};
use resthook::{Api, ApiRequest, Event, Principal, RoleTopicService, Storage, TopicCatalog};

fn api(engine: &Engine, topics: &[&str]) -> Api {
    let storage: Arc<dyn Storage> = engine.storage.clone();
    let catalog = TopicCatalog::fixed(topics.iter().map(|t| t.to_string()).collect());
    Api::new(engine.registry.clone(), RoleTopicService::new(storage), catalog).unwrap()
}

#[tokio::test]
async fn test_hook_lifecycle_over_api() {
    let engine = Engine::new(test_config());
    let api = api(&engine, &["orders"]);
    let admin = Principal::admin("root");
    let alice = Principal::user("alice", &["copilot"]);
    let endpoint = spawn_endpoint(Mode::Echo).await;

    let grant = api
        .handle(&admin, ApiRequest::post("/roletopics", json!({ "role": "copilot", "topic": "orders" })))
        .await;
    assert_eq!(grant.status, 200);

    let created = api
        .handle(&alice, ApiRequest::post("/hooks", json!({ "topic": "orders", "endpoint": endpoint.url })))
        .await;
    assert_eq!(created.status, 200);
    assert_eq!(created.body["confirmed"], true);
    assert_eq!(created.body["owner"], "alice");
    let id = created.body["id"].as_str().unwrap().to_string();

    let listed = api.handle(&alice, ApiRequest::get("/hooks")).await;
    assert_eq!(listed.body["total"], 1);

    engine
        .dispatcher
        .notify(Event::new("orders", json!({ "id": 1 })).with_originator("shop"))
        .await
        .unwrap();
    let histories = api
        .handle(&alice, ApiRequest::get(format!("/hooks/{id}/histories")))
        .await;
    assert_eq!(histories.status, 200);
    assert_eq!(histories.body.as_array().unwrap().len(), 1);
    assert_eq!(histories.body[0]["responseStatus"], 200);

    let updated = api
        .handle(
            &alice,
            ApiRequest::put(
                format!("/hooks/{id}"),
                json!({ "topic": "orders", "endpoint": endpoint.url, "name": "renamed" }),
            ),
        )
        .await;
    assert_eq!(updated.body["name"], "renamed");

    let confirmed = api
        .handle(&alice, ApiRequest::post(format!("/hooks/{id}/confirm"), json!(null)))
        .await;
    assert_eq!(confirmed.body["confirmed"], true);

    let deleted = api.handle(&alice, ApiRequest::delete(format!("/hooks/{id}"))).await;
    assert_eq!(deleted.status, 200);
    let missing = api.handle(&alice, ApiRequest::get(format!("/hooks/{id}"))).await;
    assert_eq!(missing.status, 404);
    assert!(missing.body["message"].as_str().unwrap().contains(&id));
}

#[tokio::test]
async fn test_errors_map_to_status_codes() {
    let engine = Engine::new(test_config());
    let api = api(&engine, &[]);
    let admin = Principal::admin("root");
    let alice = Principal::user("alice", &["copilot"]);
    let endpoint = spawn_endpoint(Mode::Echo).await;

    let invalid = api.handle(&alice, ApiRequest::post("/hooks", json!({ "topic": "orders" }))).await;
    assert_eq!(invalid.status, 400);

    let malformed = api.handle(&alice, ApiRequest::post("/hooks", json!([1, 2]))).await;
    assert_eq!(malformed.status, 400);

    let forbidden = api
        .handle(&alice, ApiRequest::post("/hooks", json!({ "topic": "orders", "endpoint": endpoint.url })))
        .await;
    assert_eq!(forbidden.status, 403);

    let body = json!({ "topic": "orders", "endpoint": endpoint.url });
    assert_eq!(api.handle(&admin, ApiRequest::post("/hooks", body.clone())).await.status, 200);
    assert_eq!(api.handle(&admin, ApiRequest::post("/hooks", body)).await.status, 409);

    let unknown = api.handle(&admin, ApiRequest::get("/nowhere")).await;
    assert_eq!(unknown.status, 404);

    let bad_limit = api.handle(&admin, ApiRequest::get("/hooks").with_query("limit", "x")).await;
    assert_eq!(bad_limit.status, 400);
}

#[tokio::test]
async fn test_role_topic_routes_are_admin_only() {
    let engine = Engine::new(test_config());
    let api = api(&engine, &[]);
    let admin = Principal::admin("root");
    let alice = Principal::user("alice", &["copilot"]);

    let denied = api.handle(&alice, ApiRequest::get("/roletopics")).await;
    assert_eq!(denied.status, 403);
    let denied = api
        .handle(&alice, ApiRequest::post("/roletopics", json!({ "role": "copilot", "topic": "orders" })))
        .await;
    assert_eq!(denied.status, 403);

    let created = api
        .handle(&admin, ApiRequest::post("/roletopics", json!({ "role": "copilot", "topic": "orders" })))
        .await;
    let id = created.body["id"].as_str().unwrap().to_string();

    let duplicate = api
        .handle(&admin, ApiRequest::post("/roletopics", json!({ "role": "copilot", "topic": "orders" })))
        .await;
    assert_eq!(duplicate.status, 409);
    assert_eq!(duplicate.body["message"], "The role topic is already defined.");

    let listed = api.handle(&admin, ApiRequest::get("/roletopics")).await;
    assert_eq!(listed.body["total"], 1);

    let denied = api.handle(&alice, ApiRequest::delete(format!("/roletopics/{id}"))).await;
    assert_eq!(denied.status, 403);
    assert_eq!(api.handle(&admin, ApiRequest::delete(format!("/roletopics/{id}"))).await.status, 200);
    assert_eq!(api.handle(&admin, ApiRequest::delete(format!("/roletopics/{id}"))).await.status, 404);
}

#[tokio::test]
async fn test_topics_depend_on_caller() {
    let engine = Engine::new(test_config());
    engine.grant("copilot", "orders").await;
    engine.grant("copilot", "billing").await;
    let api = api(&engine, &["orders", "billing", "payroll", "__consumer_offsets"]);

    let admin_topics = api.handle(&Principal::admin("root"), ApiRequest::get("/topics")).await;
    assert_eq!(admin_topics.body, json!(["billing", "orders", "payroll"]));

    let user_topics = api
        .handle(&Principal::user("alice", &["copilot"]), ApiRequest::get("/topics"))
        .await;
    assert_eq!(user_topics.body, json!(["billing", "orders"]));

    let nobody = api.handle(&Principal::user("bob", &[]), ApiRequest::get("/topics")).await;
    assert_eq!(nobody.body, json!([]));
}
