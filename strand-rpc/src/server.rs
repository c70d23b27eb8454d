//! Server-side request dispatch and stream production.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use strand_core::{next_message_id, Error, Result, StreamId};
use strand_registry::NameRegistry;
use strand_transport::{ConnectionState, Transport};
use strand_wire::{FrameCodec, Message, Payload, WireError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Handles one unary method; the result payload is absent for void methods
#[async_trait]
pub trait UnaryHandler: Send + Sync {
    async fn handle(&self, params: Vec<Payload>) -> Result<Option<Payload>>;
}

/// Handles one streaming method, yielding values through the producer in
/// production order
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, params: Vec<Payload>, out: StreamProducer) -> Result<()>;
}

/// Hands produced stream values to the dispatcher
pub struct StreamProducer {
    tx: mpsc::UnboundedSender<Payload>,
}

impl StreamProducer {
    /// Queue one value for emission; fails once the stream is torn down
    pub fn send(&self, value: Payload) -> Result<()> {
        self.tx.send(value).map_err(|_| Error::Cancelled)
    }
}

/// Unary handler from a plain closure
pub struct ClosureUnary<F>
where
    F: Fn(Vec<Payload>) -> Result<Option<Payload>> + Send + Sync,
{
    f: F,
}

impl<F> ClosureUnary<F>
where
    F: Fn(Vec<Payload>) -> Result<Option<Payload>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> UnaryHandler for ClosureUnary<F>
where
    F: Fn(Vec<Payload>) -> Result<Option<Payload>> + Send + Sync,
{
    async fn handle(&self, params: Vec<Payload>) -> Result<Option<Payload>> {
        (self.f)(params)
    }
}

/// Stream handler from a plain closure
pub struct ClosureStream<F>
where
    F: Fn(Vec<Payload>, StreamProducer) -> Result<()> + Send + Sync,
{
    f: F,
}

impl<F> ClosureStream<F>
where
    F: Fn(Vec<Payload>, StreamProducer) -> Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> StreamHandler for ClosureStream<F>
where
    F: Fn(Vec<Payload>, StreamProducer) -> Result<()> + Send + Sync,
{
    async fn handle(&self, params: Vec<Payload>, out: StreamProducer) -> Result<()> {
        (self.f)(params, out)
    }
}

/// Unary handler decoding one typed parameter and encoding a typed result
pub struct TypedUnary<Req, Resp, F>
where
    Req: DeserializeOwned + Send + Sync,
    Resp: Serialize + Send + Sync,
    F: Fn(Req) -> Result<Resp> + Send + Sync,
{
    f: F,
    codec: FrameCodec,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> TypedUnary<Req, Resp, F>
where
    Req: DeserializeOwned + Send + Sync,
    Resp: Serialize + Send + Sync,
    F: Fn(Req) -> Result<Resp> + Send + Sync,
{
    pub fn new(f: F, codec: FrameCodec) -> Self {
        Self {
            f,
            codec,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<Req, Resp, F> UnaryHandler for TypedUnary<Req, Resp, F>
where
    Req: DeserializeOwned + Send + Sync,
    Resp: Serialize + Send + Sync,
    F: Fn(Req) -> Result<Resp> + Send + Sync,
{
    async fn handle(&self, params: Vec<Payload>) -> Result<Option<Payload>> {
        if params.len() != 1 {
            return Err(Error::InvalidArgument(format!(
                "expected exactly one parameter, got {}",
                params.len()
            )));
        }
        let request: Req = self.codec.deserialize(&params[0])?;
        let response = (self.f)(request)?;
        Ok(Some(self.codec.serialize(&response)?))
    }
}

#[derive(Clone)]
enum Handler {
    Unary(Arc<dyn UnaryHandler>),
    Stream(Arc<dyn StreamHandler>),
}

type HandlerKey = (String, String);
type HandlerTable = Arc<RwLock<HashMap<HandlerKey, Handler>>>;

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Register the reflection and health services at construction
    pub enable_builtin_services: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enable_builtin_services: true,
        }
    }
}

/// Resolves incoming wire identifiers to handlers and drives responses and
/// stream emission back through the transport.
///
/// Registration also records the name pair in the shared registry, so the
/// wire identifier exists before the first request arrives. Handler
/// failures are converted to wire errors; the server never crashes on one.
pub struct Dispatcher {
    registry: Arc<NameRegistry>,
    config: DispatcherConfig,
    codec: FrameCodec,
    handlers: HandlerTable,
}

impl Dispatcher {
    pub fn new(registry: Arc<NameRegistry>) -> Self {
        Self::with_config(registry, DispatcherConfig::default())
    }

    pub fn with_config(registry: Arc<NameRegistry>, config: DispatcherConfig) -> Self {
        let dispatcher = Self {
            registry,
            config,
            codec: FrameCodec::new(),
            handlers: Arc::new(RwLock::new(HashMap::new())),
        };
        if dispatcher.config.enable_builtin_services {
            dispatcher.register_builtins();
        }
        dispatcher
    }

    /// Register a unary handler; returns the wire identifier
    pub fn register_method(
        &self,
        service: &str,
        method: &str,
        handler: Arc<dyn UnaryHandler>,
    ) -> Result<String> {
        let id = self.registry.register(service, method, None)?;
        self.handlers
            .write()
            .insert((service.to_string(), method.to_string()), Handler::Unary(handler));
        info!("registered {}.{} as '{}'", service, method, id);
        Ok(id)
    }

    /// Register a streaming handler; returns the wire identifier
    pub fn register_stream_method(
        &self,
        service: &str,
        method: &str,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<String> {
        let id = self.registry.register(service, method, None)?;
        self.handlers.write().insert(
            (service.to_string(), method.to_string()),
            Handler::Stream(handler),
        );
        info!("registered streaming {}.{} as '{}'", service, method, id);
        Ok(id)
    }

    /// Register a unary handler from a closure
    pub fn register_closure<F>(&self, service: &str, method: &str, f: F) -> Result<String>
    where
        F: Fn(Vec<Payload>) -> Result<Option<Payload>> + Send + Sync + 'static,
    {
        self.register_method(service, method, Arc::new(ClosureUnary::new(f)))
    }

    /// Register a streaming handler from a closure
    pub fn register_stream_closure<F>(&self, service: &str, method: &str, f: F) -> Result<String>
    where
        F: Fn(Vec<Payload>, StreamProducer) -> Result<()> + Send + Sync + 'static,
    {
        self.register_stream_method(service, method, Arc::new(ClosureStream::new(f)))
    }

    /// Register a serde-typed unary handler
    pub fn register_typed<Req, Resp, F>(&self, service: &str, method: &str, f: F) -> Result<String>
    where
        Req: DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + Send + Sync + 'static,
        F: Fn(Req) -> Result<Resp> + Send + Sync + 'static,
    {
        self.register_method(
            service,
            method,
            Arc::new(TypedUnary::new(f, self.codec.clone())),
        )
    }

    /// Number of registered methods
    pub fn method_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Subscribe to the transport and dispatch until it closes permanently
    pub fn serve(&self, transport: Arc<Transport>) -> JoinHandle<()> {
        let handlers = Arc::clone(&self.handlers);
        let registry = Arc::clone(&self.registry);
        let mut inbound = transport.subscribe();
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(Message::Request {
                        id,
                        service,
                        method,
                        params,
                        ..
                    }) => {
                        let handlers = Arc::clone(&handlers);
                        let registry = Arc::clone(&registry);
                        let transport = Arc::clone(&transport);
                        tokio::spawn(async move {
                            handle_request(id, &service, &method, params, handlers, registry, transport)
                                .await;
                        });
                    }
                    Ok(Message::StreamStart {
                        stream_id,
                        service,
                        method,
                        params,
                        ..
                    }) => {
                        let handlers = Arc::clone(&handlers);
                        let registry = Arc::clone(&registry);
                        let transport = Arc::clone(&transport);
                        tokio::spawn(async move {
                            handle_stream(
                                stream_id, &service, &method, params, handlers, registry, transport,
                            )
                            .await;
                        });
                    }
                    Ok(other) => trace!("ignoring {} message at server", other.kind()),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("dispatcher lagged by {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            info!("dispatcher finished");
        })
    }

    fn register_builtins(&self) {
        let handlers = Arc::clone(&self.handlers);
        let list_services = move |_params: Vec<Payload>| -> Result<Option<Payload>> {
            let mut services: Vec<String> =
                handlers.read().keys().map(|(s, _)| s.clone()).collect();
            services.sort();
            services.dedup();
            let body = serde_json::to_vec(&services)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            Ok(Some(body))
        };
        if let Err(e) = self.register_closure("reflection", "list_services", list_services) {
            warn!("failed to register reflection service: {}", e);
        }

        let registry = Arc::clone(&self.registry);
        let export = move |_params: Vec<Payload>| -> Result<Option<Payload>> {
            let body = serde_json::to_vec(&registry.export())
                .map_err(|e| Error::Serialization(e.to_string()))?;
            Ok(Some(body))
        };
        if let Err(e) = self.register_closure("reflection", "export_mappings", export) {
            warn!("failed to register reflection service: {}", e);
        }

        let health = |_params: Vec<Payload>| -> Result<Option<Payload>> {
            let body = serde_json::json!({
                "status": "healthy",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            });
            let body = serde_json::to_vec(&body).map_err(|e| Error::Serialization(e.to_string()))?;
            Ok(Some(body))
        };
        if let Err(e) = self.register_closure("health", "check", health) {
            warn!("failed to register health service: {}", e);
        }
    }
}

/// Resolve a wire identifier back to a name pair, falling back to the
/// literal identifier as method name when unmapped
fn resolve(registry: &NameRegistry, service: &str, wire_method: &str) -> (String, String) {
    registry
        .resolve_name(wire_method)
        .unwrap_or_else(|| (service.to_string(), wire_method.to_string()))
}

async fn handle_request(
    id: strand_core::MessageId,
    service: &str,
    wire_method: &str,
    params: Vec<Payload>,
    handlers: HandlerTable,
    registry: Arc<NameRegistry>,
    transport: Arc<Transport>,
) {
    let (service, method) = resolve(&registry, service, wire_method);
    let handler = handlers
        .read()
        .get(&(service.clone(), method.clone()))
        .cloned();

    let reply = match handler {
        None => {
            debug!("no handler for {}.{}", service, method);
            Message::error(id, WireError::method_not_found(&service, &method))
        }
        Some(Handler::Unary(handler)) => match handler.handle(params).await {
            Ok(result) => Message::response(id, result),
            Err(e) => {
                warn!("handler {}.{} failed: {}", service, method, e);
                Message::error(id, WireError::from_error(&e))
            }
        },
        Some(Handler::Stream(_)) => Message::error(
            id,
            WireError::invalid_parameters(format!(
                "'{}.{}' is a streaming method",
                service, method
            )),
        ),
    };

    if let Err(e) = transport.send(reply) {
        warn!("could not reply to request {}: {}", id, e);
    }
}

async fn handle_stream(
    stream_id: StreamId,
    service: &str,
    wire_method: &str,
    params: Vec<Payload>,
    handlers: HandlerTable,
    registry: Arc<NameRegistry>,
    transport: Arc<Transport>,
) {
    let (service, method) = resolve(&registry, service, wire_method);
    let handler = handlers
        .read()
        .get(&(service.clone(), method.clone()))
        .cloned();

    let handler = match handler {
        Some(Handler::Stream(handler)) => handler,
        Some(Handler::Unary(_)) => {
            let error = WireError::invalid_parameters(format!(
                "'{}.{}' is not a streaming method",
                service, method
            ));
            let _ = transport.send(Message::stream_error(next_message_id(), stream_id, error));
            return;
        }
        None => {
            debug!("no streaming handler for {}.{}", service, method);
            let error = WireError::method_not_found(&service, &method);
            let _ = transport.send(Message::stream_error(next_message_id(), stream_id, error));
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let producer = StreamProducer { tx };
    let worker = tokio::spawn(async move { handler.handle(params, producer).await });

    // emit in production order; stop at once if the connection goes away
    while let Some(value) = rx.recv().await {
        if transport.state() != ConnectionState::Connected {
            debug!("connection gone mid-stream, abandoning stream {}", stream_id);
            worker.abort();
            return;
        }
        let message = Message::stream_data(next_message_id(), stream_id, value);
        if transport.send(message).is_err() {
            worker.abort();
            return;
        }
    }

    let outcome = match worker.await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            warn!("stream handler {}.{} failed: {}", service, method, e);
            Some(WireError::from_error(&e))
        }
        Err(join_error) => Some(WireError::internal(format!(
            "stream handler aborted: {}",
            join_error
        ))),
    };

    if transport.state() != ConnectionState::Connected {
        return;
    }
    let terminal = match outcome {
        None => Message::stream_end(next_message_id(), stream_id),
        Some(error) => Message::stream_error(next_message_id(), stream_id, error),
    };
    if let Err(e) = transport.send(terminal) {
        warn!("could not terminate stream {}: {}", stream_id, e);
    }
}
