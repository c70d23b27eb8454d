//! Key/value demo over the in-process memory channel.
//!
//! A dispatcher and a client run in one process with separate name
//! registries; the server's exported mapping document is handed to the
//! client the way independently built binaries would exchange it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use strand_core::Result;
use strand_registry::{HashIds, NameRegistry};
use strand_rpc::{Dispatcher, RpcClient, StreamProducer};
use strand_transport::{memory, TransportConfig};
use tracing::info;

#[derive(Serialize, Deserialize)]
struct PutRequest {
    key: String,
    value: String,
}

#[derive(Serialize, Deserialize)]
struct GetRequest {
    key: String,
}

#[derive(Serialize, Deserialize)]
struct GetResponse {
    value: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let (client_transport, server_transport) =
        memory::transport_pair(TransportConfig::default(), TransportConfig::default()).await?;
    let client_transport = Arc::new(client_transport);
    let server_transport = Arc::new(server_transport);

    // server side: a small key/value store
    let store: Arc<RwLock<HashMap<String, String>>> = Arc::new(RwLock::new(HashMap::new()));
    let server_registry = Arc::new(NameRegistry::with_strategy(Box::new(HashIds::new(6))));
    let dispatcher = Dispatcher::new(Arc::clone(&server_registry));

    {
        let store = Arc::clone(&store);
        dispatcher.register_typed("KvService", "put", move |request: PutRequest| {
            store.write().insert(request.key, request.value);
            Ok(true)
        })?;
    }
    {
        let store = Arc::clone(&store);
        dispatcher.register_typed("KvService", "get", move |request: GetRequest| {
            Ok(GetResponse {
                value: store.read().get(&request.key).cloned(),
            })
        })?;
    }
    {
        let store = Arc::clone(&store);
        dispatcher.register_stream_closure("KvService", "listKeys", move |_params, out: StreamProducer| {
            let mut keys: Vec<String> = store.read().keys().cloned().collect();
            keys.sort();
            for key in keys {
                out.send(key.into_bytes())?;
            }
            Ok(())
        })?;
    }
    dispatcher.serve(Arc::clone(&server_transport));

    // client side: built against the exported mapping document
    let client_registry = Arc::new(NameRegistry::new());
    client_registry.load(&server_registry.export())?;
    info!(
        "client loaded {} wire identifiers, e.g. KvService.put -> '{}'",
        client_registry.len(),
        client_registry.wire_id("KvService", "put")
    );

    let client = RpcClient::new(Arc::clone(&client_transport), client_registry);
    client.start();

    for (key, value) in [("alpha", "1"), ("beta", "2"), ("gamma", "3")] {
        let stored: bool = client
            .call_typed(
                "KvService",
                "put",
                &PutRequest {
                    key: key.to_string(),
                    value: value.to_string(),
                },
            )
            .await?;
        info!("put {} = {} (stored: {})", key, value, stored);
    }

    let fetched: GetResponse = client
        .call_typed(
            "KvService",
            "get",
            &GetRequest {
                key: "beta".to_string(),
            },
        )
        .await?;
    info!("get beta -> {:?}", fetched.value);

    let mut keys = client.stream("KvService", "listKeys", Vec::new())?;
    while let Some(item) = keys.next().await {
        info!("listKeys -> {}", String::from_utf8_lossy(&item?));
    }

    let health = client.call("health", "check", Vec::new()).await?;
    if let Some(body) = health {
        info!("health.check -> {}", String::from_utf8_lossy(&body));
    }

    client_transport.disconnect().await?;
    server_transport.disconnect().await?;
    Ok(())
}
