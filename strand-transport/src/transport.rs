//! Connection lifecycle management over an abstract channel.

use crate::channel::{ChannelPair, Connector, MessageSink, MessageSource};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use strand_core::{next_message_id, Error, Result};
use strand_wire::Message;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Deadline for a single connect attempt
    pub connect_timeout: Duration,
    /// Idle time before a keep-alive probe is sent
    pub keepalive_interval: Duration,
    /// Deadline for the probe acknowledgement
    pub keepalive_timeout: Duration,
    /// Reconnect attempts before the transport fails permanently
    pub max_reconnect_attempts: u32,
    /// Delay before each reconnect attempt
    pub reconnect_delay: Duration,
    /// Capacity of the inbound broadcast buffer
    pub inbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
            inbound_capacity: 1024,
        }
    }
}

impl TransportConfig {
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.max_reconnect_attempts = attempts;
        self.reconnect_delay = delay;
        self
    }
}

/// Connection lifecycle state, owned by the transport and observed elsewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal: reconnect attempts were exhausted
    Failed,
}

/// Lifecycle notifications for layers holding pending work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    /// The channel was lost; pending work must be failed immediately
    Disconnected,
    /// Reconnect attempts were exhausted; the transport is permanently down
    ReconnectFailed,
}

/// One logical connection to a peer.
///
/// Owns the physical channel through its lifecycle: a single writer task
/// drains the send queue in order, and a supervisor task runs the read loop,
/// answers keep-alive probes, and drives reconnection. Inbound messages fan
/// out through a broadcast channel to every subscriber.
pub struct Transport {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    state: Arc<RwLock<ConnectionState>>,
    outbound: Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
    inbound_tx: broadcast::Sender<Message>,
    event_tx: broadcast::Sender<TransportEvent>,
    shutdown: Arc<RwLock<Option<watch::Sender<bool>>>>,
}

impl Transport {
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (inbound_tx, _) = broadcast::channel(config.inbound_capacity);
        let (event_tx, _) = broadcast::channel(64);
        Self {
            connector,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outbound: Arc::new(RwLock::new(None)),
            inbound_tx,
            event_tx,
            shutdown: Arc::new(RwLock::new(None)),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Live broadcast of inbound messages from the point of subscription.
    /// Keep-alive probes are consumed by the transport and never appear here.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inbound_tx.subscribe()
    }

    /// Lifecycle event notifications
    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    /// Establish the channel. Idempotent when already connected or when
    /// establishment is already in progress.
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected
            | ConnectionState::Connecting
            | ConnectionState::Reconnecting => return Ok(()),
            ConnectionState::Disconnected | ConnectionState::Failed => {}
        }
        *self.state.write() = ConnectionState::Connecting;
        info!("transport connecting");

        let pair = match tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(),
        )
        .await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                *self.state.write() = ConnectionState::Disconnected;
                return Err(e);
            }
            Err(_) => {
                *self.state.write() = ConnectionState::Disconnected;
                return Err(Error::Connection("connect attempt timed out".to_string()));
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.write() = Some(shutdown_tx);

        let (sink, source) = pair;
        let out_tx = install_writer(&self.outbound, sink);
        *self.state.write() = ConnectionState::Connected;
        let _ = self.event_tx.send(TransportEvent::Connected);
        info!("transport connected");

        let supervisor = Supervisor {
            connector: Arc::clone(&self.connector),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            outbound: Arc::clone(&self.outbound),
            inbound_tx: self.inbound_tx.clone(),
            event_tx: self.event_tx.clone(),
            shutdown_rx,
        };
        tokio::spawn(supervisor.run(source, out_tx));
        Ok(())
    }

    /// Enqueue a message for delivery in call order
    pub fn send(&self, message: Message) -> Result<()> {
        let outbound = self.outbound.read();
        match outbound.as_ref() {
            Some(tx) => {
                trace!("queueing {} message {}", message.kind(), message.id());
                tx.send(message)
                    .map_err(|_| Error::Connection("transport writer is gone".to_string()))
            }
            None => Err(Error::Connection("transport is not connected".to_string())),
        }
    }

    /// Tear down the connection and release resources. Safe to call
    /// repeatedly.
    pub async fn disconnect(&self) -> Result<()> {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, ConnectionState::Disconnected)
        };
        if let Some(tx) = self.shutdown.write().take() {
            let _ = tx.send(true);
        }
        *self.outbound.write() = None;
        if matches!(
            previous,
            ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            let _ = self.event_tx.send(TransportEvent::Disconnected);
            info!("transport disconnected");
        }
        Ok(())
    }
}

/// Spawn the writer task for one channel epoch and install its queue
fn install_writer(
    slot: &Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
    mut sink: Box<dyn MessageSink>,
) -> mpsc::UnboundedSender<Message> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *slot.write() = Some(tx.clone());
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = sink.send(message).await {
                warn!("channel send failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });
    tx
}

/// Clear the outbound queue slot, but only if it still belongs to this epoch
fn clear_writer(
    slot: &Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
    tx: &mpsc::UnboundedSender<Message>,
) {
    let mut outbound = slot.write();
    if outbound
        .as_ref()
        .map(|current| current.same_channel(tx))
        .unwrap_or(false)
    {
        *outbound = None;
    }
}

/// Turn a channel source into a cancel-safe queue of inbound messages. The
/// queue closing signals channel loss.
fn spawn_reader(
    mut source: Box<dyn MessageSource>,
) -> (mpsc::UnboundedReceiver<Message>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        loop {
            match source.recv().await {
                Ok(Some(message)) => {
                    if tx.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("channel closed by peer");
                    break;
                }
                Err(e) => {
                    warn!("channel receive failed: {}", e);
                    break;
                }
            }
        }
    });
    (rx, handle)
}

struct Supervisor {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    state: Arc<RwLock<ConnectionState>>,
    outbound: Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
    inbound_tx: broadcast::Sender<Message>,
    event_tx: broadcast::Sender<TransportEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(self, source: Box<dyn MessageSource>, out_tx: mpsc::UnboundedSender<Message>) {
        let (mut inbound_rx, mut reader) = spawn_reader(source);
        let mut out_tx = out_tx;
        loop {
            let lost = self.drive(&mut inbound_rx, &out_tx).await;
            reader.abort();
            clear_writer(&self.outbound, &out_tx);
            drop(out_tx);

            if !lost {
                // shutdown requested through disconnect(); state was already set
                return;
            }

            *self.state.write() = ConnectionState::Reconnecting;
            let _ = self.event_tx.send(TransportEvent::Disconnected);
            warn!("connection lost, attempting to reconnect");

            match self.reconnect().await {
                Some((sink, new_source)) => {
                    let (rx, handle) = spawn_reader(new_source);
                    inbound_rx = rx;
                    reader = handle;
                    out_tx = install_writer(&self.outbound, sink);
                    *self.state.write() = ConnectionState::Connected;
                    let _ = self.event_tx.send(TransportEvent::Connected);
                    info!("transport reconnected");
                }
                None => {
                    if *self.shutdown_rx.borrow() {
                        return;
                    }
                    *self.state.write() = ConnectionState::Failed;
                    let _ = self.event_tx.send(TransportEvent::ReconnectFailed);
                    warn!(
                        "giving up after {} reconnect attempts",
                        self.config.max_reconnect_attempts
                    );
                    return;
                }
            }
        }
    }

    /// Run the read loop for one channel epoch. Returns true when the
    /// channel was lost, false when shutdown was requested.
    async fn drive(
        &self,
        inbound_rx: &mut mpsc::UnboundedReceiver<Message>,
        out_tx: &mpsc::UnboundedSender<Message>,
    ) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let keepalive_interval = self.config.keepalive_interval;
        let keepalive_timeout = self.config.keepalive_timeout;
        let mut last_inbound = Instant::now();
        let mut probe_deadline: Option<Instant> = None;

        loop {
            let wake = probe_deadline.unwrap_or(last_inbound + keepalive_interval);
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return false;
                    }
                }
                received = inbound_rx.recv() => {
                    match received {
                        Some(message) => {
                            last_inbound = Instant::now();
                            probe_deadline = None;
                            match message {
                                Message::Ping { id, .. } => {
                                    trace!("answering keep-alive probe {}", id);
                                    let _ = out_tx.send(Message::pong(id));
                                }
                                Message::Pong { id, .. } => {
                                    trace!("keep-alive probe {} acknowledged", id);
                                }
                                other => {
                                    trace!("inbound {} message {}", other.kind(), other.id());
                                    let _ = self.inbound_tx.send(other);
                                }
                            }
                        }
                        None => return true,
                    }
                }
                _ = tokio::time::sleep_until(wake) => {
                    if probe_deadline.is_some() {
                        warn!("keep-alive probe unacknowledged, forcing disconnect");
                        return true;
                    }
                    trace!("connection idle, sending keep-alive probe");
                    if out_tx.send(Message::ping(next_message_id())).is_err() {
                        return true;
                    }
                    probe_deadline = Some(Instant::now() + keepalive_timeout);
                }
            }
        }
    }

    /// Bounded reconnect loop; `None` on exhaustion or shutdown
    async fn reconnect(&self) -> Option<ChannelPair> {
        for attempt in 1..=self.config.max_reconnect_attempts {
            tokio::time::sleep(self.config.reconnect_delay).await;
            if *self.shutdown_rx.borrow() {
                return None;
            }
            debug!(
                "reconnect attempt {}/{}",
                attempt, self.config.max_reconnect_attempts
            );
            match tokio::time::timeout(self.config.connect_timeout, self.connector.connect()).await
            {
                Ok(Ok(pair)) => return Some(pair),
                Ok(Err(e)) => warn!("reconnect attempt {} failed: {}", attempt, e),
                Err(_) => warn!("reconnect attempt {} timed out", attempt),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MessageSink as _, MessageSource as _};
    use crate::memory;
    use std::time::Duration;

    fn fast_config() -> TransportConfig {
        TransportConfig::default()
            .with_connect_timeout(Duration::from_millis(500))
            .with_keepalive(Duration::from_millis(50), Duration::from_millis(50))
            .with_reconnect(2, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (connector, _listener) = memory::link();
        let transport = Transport::new(Arc::new(connector.clone()), TransportConfig::default());

        transport.connect().await.unwrap();
        transport.connect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn send_before_connect_is_refused() {
        let (connector, _listener) = memory::link();
        let transport = Transport::new(Arc::new(connector), TransportConfig::default());
        let result = transport.send(Message::ping(1));
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn connect_failure_surfaces_as_connection_error() {
        let (connector, _listener) = memory::link();
        connector.set_refusing(true);
        let transport = Transport::new(Arc::new(connector), TransportConfig::default());
        assert!(matches!(
            transport.connect().await,
            Err(Error::Connection(_))
        ));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn messages_flow_both_ways_in_order() {
        let (connector, mut listener) = memory::link();
        let transport = Transport::new(Arc::new(connector), TransportConfig::default());
        let mut inbound = transport.subscribe();

        transport.connect().await.unwrap();
        let (mut peer_sink, mut peer_source) = listener.accept().await.unwrap();

        for id in 1..=3 {
            transport
                .send(Message::request(id, "S", "m", Vec::new(), false))
                .unwrap();
        }
        for id in 1..=3 {
            assert_eq!(peer_source.recv().await.unwrap().unwrap().id(), id);
        }

        peer_sink.send(Message::response(2, None)).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap().id(), 2);
    }

    #[tokio::test]
    async fn pings_are_answered_and_never_broadcast() {
        let (connector, mut listener) = memory::link();
        let transport = Transport::new(Arc::new(connector), TransportConfig::default());
        let mut inbound = transport.subscribe();

        transport.connect().await.unwrap();
        let (mut peer_sink, mut peer_source) = listener.accept().await.unwrap();

        peer_sink.send(Message::ping(77)).await.unwrap();
        let reply = peer_source.recv().await.unwrap().unwrap();
        assert_eq!(reply.kind(), "Pong");
        assert_eq!(reply.id(), 77);

        // a regular message still comes through, and no ping precedes it
        peer_sink.send(Message::response(5, None)).await.unwrap();
        let seen = inbound.recv().await.unwrap();
        assert_eq!(seen.kind(), "Response");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_probed() {
        let (connector, mut listener) = memory::link();
        let transport = Transport::new(
            Arc::new(connector),
            TransportConfig::default()
                .with_keepalive(Duration::from_millis(100), Duration::from_millis(100)),
        );
        transport.connect().await.unwrap();
        let (mut peer_sink, mut peer_source) = listener.accept().await.unwrap();

        let probe = peer_source.recv().await.unwrap().unwrap();
        assert_eq!(probe.kind(), "Ping");

        // answering keeps the connection up
        peer_sink.send(Message::pong(probe.id())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_probe_forces_reconnect() {
        let (connector, mut listener) = memory::link();
        let transport = Transport::new(Arc::new(connector), fast_config());
        let mut events = transport.events();

        transport.connect().await.unwrap();
        // hold the peer half but never answer probes
        let _peer = listener.accept().await.unwrap();

        // probe goes unanswered, the transport drops and reconnects
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Disconnected => break,
                TransportEvent::Connected => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        // the connector accepts again, so reconnection succeeds
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connected);
        let _peer2 = listener.accept().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_attempts_are_bounded() {
        let (connector, mut listener) = memory::link();
        let transport = Transport::new(Arc::new(connector.clone()), fast_config());
        let mut events = transport.events();

        transport.connect().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connected);
        let (peer_sink, peer_source) = listener.accept().await.unwrap();
        connector.set_refusing(true);

        // sever the channel from the peer side
        drop(peer_sink);
        drop(peer_source);

        assert_eq!(events.recv().await.unwrap(), TransportEvent::Disconnected);
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::ReconnectFailed
        );
        assert_eq!(transport.state(), ConnectionState::Failed);
        // initial connect plus the configured number of retries
        assert_eq!(connector.attempts(), 1 + 2);
    }

    #[tokio::test]
    async fn disconnect_is_safe_to_repeat() {
        let (connector, mut listener) = memory::link();
        let transport = Transport::new(Arc::new(connector), TransportConfig::default());

        transport.connect().await.unwrap();
        let _peer = listener.accept().await.unwrap();

        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(transport.send(Message::ping(1)).is_err());
    }
}
