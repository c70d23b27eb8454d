//! Client-side call and stream multiplexing.

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use strand_core::{next_message_id, next_stream_id, Error, MessageId, Result, StreamId};
use strand_registry::NameRegistry;
use strand_transport::{Transport, TransportEvent};
use strand_wire::{FrameCodec, Message, Payload, WireError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Default deadline for `call`
    pub call_timeout: Duration,
    /// How often abandoned pending calls are swept
    pub sweep_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }
}

/// Bookkeeping for one in-flight call
struct PendingCall {
    deadline: Instant,
    tx: oneshot::Sender<Result<Option<Payload>>>,
}

/// Bookkeeping for one open stream
struct PendingStream {
    tx: mpsc::UnboundedSender<StreamItem>,
}

enum StreamItem {
    Data(Payload),
    End,
    Failed(Error),
}

type CallTable = Arc<Mutex<HashMap<MessageId, PendingCall>>>;
type StreamTable = Arc<Mutex<HashMap<StreamId, PendingStream>>>;

/// Multiplexes concurrent calls and streams over one transport.
///
/// A single background task demultiplexes inbound messages by correlation
/// id. Call completions go through oneshot channels and stream values
/// through unbounded queues, so one caller's slow consumption never blocks
/// another's delivery. The moment the transport reports a disconnect, every
/// pending entry is failed with a connection error.
pub struct RpcClient {
    transport: Arc<Transport>,
    registry: Arc<NameRegistry>,
    config: ClientConfig,
    codec: FrameCodec,
    calls: CallTable,
    streams: StreamTable,
    started: AtomicBool,
}

impl RpcClient {
    pub fn new(transport: Arc<Transport>, registry: Arc<NameRegistry>) -> Self {
        Self::with_config(transport, registry, ClientConfig::default())
    }

    pub fn with_config(
        transport: Arc<Transport>,
        registry: Arc<NameRegistry>,
        config: ClientConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            config,
            codec: FrameCodec::new(),
            calls: Arc::new(Mutex::new(HashMap::new())),
            streams: Arc::new(Mutex::new(HashMap::new())),
            started: AtomicBool::new(false),
        }
    }

    /// Start the demultiplex and sweep tasks. Subsequent calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inbound = self.transport.subscribe();
        let events = self.transport.events();
        tokio::spawn(demux_loop(
            inbound,
            events,
            Arc::clone(&self.calls),
            Arc::clone(&self.streams),
        ));
        tokio::spawn(sweep_loop(
            Arc::clone(&self.calls),
            self.config.sweep_interval,
        ));
        info!("rpc client started");
    }

    /// Invoke a unary method with the default deadline
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        params: Vec<Payload>,
    ) -> Result<Option<Payload>> {
        self.call_with_timeout(service, method, params, self.config.call_timeout)
            .await
    }

    /// Invoke a unary method, suspending until the matching response or
    /// error arrives or the deadline elapses, whichever comes first. On
    /// timeout the pending entry is removed; a late match is discarded at
    /// the demultiplexer.
    pub async fn call_with_timeout(
        &self,
        service: &str,
        method: &str,
        params: Vec<Payload>,
        timeout: Duration,
    ) -> Result<Option<Payload>> {
        let wire_method = self.registry.wire_id(service, method);
        let id = next_message_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut calls = self.calls.lock();
            calls.insert(
                id,
                PendingCall {
                    deadline: Instant::now() + timeout,
                    tx,
                },
            );
        }

        let request = Message::request(id, service, wire_method, params, false);
        if let Err(e) = self.transport.send(request) {
            self.calls.lock().remove(&id);
            return Err(e);
        }
        debug!("sent request {} for {}.{}", id, service, method);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Connection("client was stopped".to_string())),
            Err(_) => {
                self.calls.lock().remove(&id);
                debug!("request {} timed out after {:?}", id, timeout);
                Err(Error::Timeout)
            }
        }
    }

    /// Serde convenience over `call`: one encoded parameter in, one decoded
    /// result out
    pub async fn call_typed<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let param = self.codec.serialize(request)?;
        let result = self.call(service, method, vec![param]).await?;
        let payload = result
            .ok_or_else(|| Error::Protocol("void response to a typed call".to_string()))?;
        self.codec.deserialize(&payload)
    }

    /// Open a stream and return its lazy, single-consumer value sequence
    pub fn stream(&self, service: &str, method: &str, params: Vec<Payload>) -> Result<CallStream> {
        let wire_method = self.registry.wire_id(service, method);
        let id = next_message_id();
        let stream_id = next_stream_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .insert(stream_id, PendingStream { tx });

        let message = Message::stream_start(id, stream_id, service, wire_method, params);
        if let Err(e) = self.transport.send(message) {
            self.streams.lock().remove(&stream_id);
            return Err(e);
        }
        debug!("opened stream {} for {}.{}", stream_id, service, method);

        Ok(CallStream {
            stream_id,
            rx,
            streams: Arc::clone(&self.streams),
            finished: false,
        })
    }

    /// In-flight call count
    pub fn pending_call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Open stream count
    pub fn pending_stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

async fn demux_loop(
    mut inbound: broadcast::Receiver<Message>,
    mut events: broadcast::Receiver<TransportEvent>,
    calls: CallTable,
    streams: StreamTable,
) {
    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Ok(message) => demux(message, &calls, &streams),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("demultiplexer lagged by {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = events.recv() => match event {
                Ok(TransportEvent::Disconnected) | Ok(TransportEvent::ReconnectFailed) => {
                    fail_all(&calls, &streams);
                }
                Ok(TransportEvent::Connected) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // missed events may include a disconnect
                    fail_all(&calls, &streams);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    fail_all(&calls, &streams);
    debug!("demultiplexer finished");
}

fn demux(message: Message, calls: &CallTable, streams: &StreamTable) {
    match message {
        Message::Response { id, result, .. } => match calls.lock().remove(&id) {
            Some(pending) => {
                let _ = pending.tx.send(Ok(result));
            }
            None => debug!("discarding late response for call {}", id),
        },
        Message::Error {
            id,
            code,
            message,
            details,
            ..
        } => match calls.lock().remove(&id) {
            Some(pending) => {
                let error = WireError {
                    code,
                    message,
                    details,
                };
                let _ = pending.tx.send(Err(error.into()));
            }
            None => debug!("discarding late error for call {}", id),
        },
        Message::StreamData {
            stream_id, data, ..
        } => {
            let mut streams = streams.lock();
            let consumer_gone = match streams.get(&stream_id) {
                Some(pending) => pending.tx.send(StreamItem::Data(data)).is_err(),
                None => {
                    debug!("discarding data for unknown stream {}", stream_id);
                    false
                }
            };
            if consumer_gone {
                streams.remove(&stream_id);
            }
        }
        Message::StreamEnd { stream_id, .. } => match streams.lock().remove(&stream_id) {
            Some(pending) => {
                let _ = pending.tx.send(StreamItem::End);
            }
            None => debug!("discarding end for unknown stream {}", stream_id),
        },
        Message::StreamError {
            stream_id,
            code,
            message,
            details,
            ..
        } => match streams.lock().remove(&stream_id) {
            Some(pending) => {
                let error = WireError {
                    code,
                    message,
                    details,
                };
                let _ = pending.tx.send(StreamItem::Failed(error.into()));
            }
            None => debug!("discarding error for unknown stream {}", stream_id),
        },
        other => trace!("ignoring {} message at client", other.kind()),
    }
}

/// Fail every pending call and stream with a connection error
fn fail_all(calls: &CallTable, streams: &StreamTable) {
    let failed_calls: Vec<_> = calls.lock().drain().collect();
    let failed_streams: Vec<_> = streams.lock().drain().collect();
    if failed_calls.is_empty() && failed_streams.is_empty() {
        return;
    }
    warn!(
        "failing {} pending calls and {} streams after disconnect",
        failed_calls.len(),
        failed_streams.len()
    );
    for (_, pending) in failed_calls {
        let _ = pending
            .tx
            .send(Err(Error::Connection("connection lost".to_string())));
    }
    for (_, pending) in failed_streams {
        let _ = pending.tx.send(StreamItem::Failed(Error::Connection(
            "connection lost".to_string(),
        )));
    }
}

/// Periodically drop pending calls whose deadline passed with no waiter
/// left to observe them
async fn sweep_loop(calls: CallTable, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let now = Instant::now();
        let expired: Vec<_> = {
            let mut calls = calls.lock();
            let ids: Vec<MessageId> = calls
                .iter()
                .filter(|(_, pending)| pending.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| calls.remove(&id).map(|p| (id, p)))
                .collect()
        };
        for (id, pending) in expired {
            debug!("sweeping expired call {}", id);
            let _ = pending.tx.send(Err(Error::Timeout));
        }
    }
}

/// Lazy, single-consumer sequence of stream values.
///
/// Ends after the stream's terminal message. Dropping it cancels the stream
/// locally: no upstream message is sent, and late data is discarded at the
/// demultiplexer.
pub struct CallStream {
    stream_id: StreamId,
    rx: mpsc::UnboundedReceiver<StreamItem>,
    streams: StreamTable,
    finished: bool,
}

impl CallStream {
    /// The stream's correlation id
    pub fn id(&self) -> StreamId {
        self.stream_id
    }

    /// Next value, `None` after graceful completion
    pub async fn next(&mut self) -> Option<Result<Payload>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(StreamItem::Data(payload)) => Some(Ok(payload)),
            Some(StreamItem::End) => {
                self.finished = true;
                None
            }
            Some(StreamItem::Failed(error)) => {
                self.finished = true;
                Some(Err(error))
            }
            None => {
                self.finished = true;
                Some(Err(Error::Connection("connection lost".to_string())))
            }
        }
    }

    /// Stop consuming and drop the pending entry
    pub fn cancel(&mut self) {
        self.finished = true;
        self.streams.lock().remove(&self.stream_id);
        self.rx.close();
    }
}

impl Drop for CallStream {
    fn drop(&mut self) {
        self.streams.lock().remove(&self.stream_id);
    }
}

impl futures::Stream for CallStream {
    type Item = Result<Payload>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(StreamItem::Data(payload))) => Poll::Ready(Some(Ok(payload))),
            Poll::Ready(Some(StreamItem::End)) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamItem::Failed(error))) => {
                this.finished = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(Err(Error::Connection(
                    "connection lost".to_string(),
                ))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_transport::memory;
    use strand_transport::{MessageSink as _, MessageSource as _, TransportConfig};

    async fn client_with_raw_peer() -> (
        RpcClient,
        Arc<Transport>,
        Box<dyn strand_transport::MessageSink>,
        Box<dyn strand_transport::MessageSource>,
    ) {
        let (connector, mut listener) = memory::link();
        let transport = Arc::new(Transport::new(Arc::new(connector), TransportConfig::default()));
        transport.connect().await.unwrap();
        let (peer_sink, peer_source) = listener.accept().await.unwrap();

        let registry = Arc::new(NameRegistry::new());
        let client = RpcClient::new(Arc::clone(&transport), registry);
        client.start();
        (client, transport, peer_sink, peer_source)
    }

    #[tokio::test]
    async fn call_correlates_by_message_id() {
        let (client, _transport, mut peer_sink, mut peer_source) = client_with_raw_peer().await;

        let handle = tokio::spawn(async move {
            let request = peer_source.recv().await.unwrap().unwrap();
            let id = request.id();
            peer_sink
                .send(Message::response(id, Some(b"{\"id\":\"u1\"}".to_vec())))
                .await
                .unwrap();
        });

        let result = client
            .call("UserService", "createUser", vec![b"{\"name\":\"Ann\"}".to_vec()])
            .await
            .unwrap();
        assert_eq!(result, Some(b"{\"id\":\"u1\"}".to_vec()));
        assert_eq!(client.pending_call_count(), 0);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_calls_complete_out_of_order() {
        let (client, _transport, mut peer_sink, mut peer_source) = client_with_raw_peer().await;
        let client = Arc::new(client);

        let echo = tokio::spawn(async move {
            let first = peer_source.recv().await.unwrap().unwrap();
            let second = peer_source.recv().await.unwrap().unwrap();
            // answer in reverse order
            peer_sink
                .send(Message::response(second.id(), Some(b"2".to_vec())))
                .await
                .unwrap();
            peer_sink
                .send(Message::response(first.id(), Some(b"1".to_vec())))
                .await
                .unwrap();
        });

        let a = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("S", "a", Vec::new()).await })
        };
        let b = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("S", "b", Vec::new()).await })
        };

        assert_eq!(a.await.unwrap().unwrap(), Some(b"1".to_vec()));
        assert_eq!(b.await.unwrap().unwrap(), Some(b"2".to_vec()));
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_removes_the_pending_entry() {
        let (client, _transport, _peer_sink, mut peer_source) = client_with_raw_peer().await;

        let started = std::time::Instant::now();
        let result = client
            .call_with_timeout("S", "m", Vec::new(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(client.pending_call_count(), 0);

        // the request did reach the peer; its late answer is discarded
        let request = peer_source.recv().await.unwrap().unwrap();
        assert_eq!(request.kind(), "Request");
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_discarded() {
        let (client, _transport, mut peer_sink, mut peer_source) = client_with_raw_peer().await;

        let result = client
            .call_with_timeout("S", "m", Vec::new(), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));

        let request = peer_source.recv().await.unwrap().unwrap();
        peer_sink
            .send(Message::response(request.id(), Some(b"late".to_vec())))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.pending_call_count(), 0);
    }

    #[tokio::test]
    async fn remote_error_surfaces_with_its_kind() {
        let (client, _transport, mut peer_sink, mut peer_source) = client_with_raw_peer().await;

        let echo = tokio::spawn(async move {
            let request = peer_source.recv().await.unwrap().unwrap();
            peer_sink
                .send(Message::error(
                    request.id(),
                    WireError::method_not_found("S", "missing"),
                ))
                .await
                .unwrap();
        });

        let result = client.call("S", "missing", Vec::new()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn stream_yields_values_then_completes() {
        let (client, _transport, mut peer_sink, mut peer_source) = client_with_raw_peer().await;

        let feeder = tokio::spawn(async move {
            let start = peer_source.recv().await.unwrap().unwrap();
            let stream_id = start.stream_id().unwrap();
            for value in [b"1", b"2", b"3"] {
                peer_sink
                    .send(Message::stream_data(
                        next_message_id(),
                        stream_id,
                        value.to_vec(),
                    ))
                    .await
                    .unwrap();
            }
            peer_sink
                .send(Message::stream_end(next_message_id(), stream_id))
                .await
                .unwrap();
        });

        let mut stream = client.stream("FeedService", "tail", Vec::new()).unwrap();
        let mut values = Vec::new();
        while let Some(item) = stream.next().await {
            values.push(item.unwrap());
        }
        assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
        assert!(stream.next().await.is_none());
        assert_eq!(client.pending_stream_count(), 0);
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn stream_failure_is_the_last_item() {
        let (client, _transport, mut peer_sink, mut peer_source) = client_with_raw_peer().await;

        let feeder = tokio::spawn(async move {
            let start = peer_source.recv().await.unwrap().unwrap();
            let stream_id = start.stream_id().unwrap();
            peer_sink
                .send(Message::stream_data(
                    next_message_id(),
                    stream_id,
                    b"only".to_vec(),
                ))
                .await
                .unwrap();
            peer_sink
                .send(Message::stream_error(
                    next_message_id(),
                    stream_id,
                    WireError::new(strand_wire::ErrorCode::StreamError, "source dried up"),
                ))
                .await
                .unwrap();
        });

        let mut stream = client.stream("FeedService", "tail", Vec::new()).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), b"only".to_vec());
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_stream_discards_late_data() {
        let (client, _transport, mut peer_sink, mut peer_source) = client_with_raw_peer().await;

        let mut stream = client.stream("FeedService", "tail", Vec::new()).unwrap();
        let start = peer_source.recv().await.unwrap().unwrap();
        let stream_id = start.stream_id().unwrap();

        stream.cancel();
        assert_eq!(client.pending_stream_count(), 0);

        // data arriving after cancellation has no observable effect
        peer_sink
            .send(Message::stream_data(next_message_id(), stream_id, b"late".to_vec()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.pending_stream_count(), 0);
    }

    #[tokio::test]
    async fn dropping_a_stream_removes_its_entry() {
        let (client, _transport, _peer_sink, mut peer_source) = client_with_raw_peer().await;

        let stream = client.stream("FeedService", "tail", Vec::new()).unwrap();
        assert_eq!(client.pending_stream_count(), 1);
        drop(stream);
        assert_eq!(client.pending_stream_count(), 0);

        let start = peer_source.recv().await.unwrap().unwrap();
        assert_eq!(start.kind(), "StreamStart");
    }

    #[tokio::test]
    async fn disconnect_fails_pending_work_immediately() {
        let (client, _transport, peer_sink, peer_source) = client_with_raw_peer().await;
        let client = Arc::new(client);

        let pending = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .call_with_timeout("S", "m", Vec::new(), Duration::from_secs(30))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.pending_call_count(), 1);

        // sever the channel from the peer side
        drop(peer_sink);
        drop(peer_source);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::Connection(_))));
        assert_eq!(client.pending_call_count(), 0);
    }
}
