use std::sync::Arc;

use resthook::{
    Dispatcher, EngineConfig, Event, EventIngestor, HookData, HookRegistry, InMemoryStorage,
    Ingested, Principal, RoleTopicService, Storage,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::from_env()?;
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());

    let registry = HookRegistry::new(&config, storage.clone());
    let role_topics = RoleTopicService::new(storage.clone());
    let dispatcher = Arc::new(Dispatcher::new(&config, storage));

    role_topics.create("copilot", "orders").await?;

    let alice = Principal::user("alice", &["copilot"]);
    let hook = registry
        .create(
            &alice,
            HookData::new("orders", "https://example.com/webhook")
                .with_filter("message.payload.total > 100")
                .with_header("x-api-key", "demo"),
        )
        .await?;
    println!("hook {} confirmed: {}", hook.id, hook.confirmed);

    let summary = dispatcher
        .notify(Event::new("orders", serde_json::json!({ "id": 123, "total": 250 })).with_originator("shop"))
        .await?;
    println!("{summary:?}");

    let ingestor = EventIngestor::new(dispatcher);
    let message = br#"{"originator":"shop","mime-type":"application/json","payload":{"id":124,"total":5}}"#;
    if let Ingested::Dispatched(handle) = ingestor.handle("orders", message)? {
        println!("{:?}", handle.await?);
    }

    Ok(())
}
