//! In-process memory channel.
//!
//! A duplex pair of unbounded queues, with a listener/connector split so
//! client and server transports can be wired up the same way they would be
//! over a network.

use crate::channel::{ChannelPair, Connector, MessageSink, MessageSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use strand_core::{Error, Result};
use strand_wire::Message;
use tokio::sync::mpsc;

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Message>>,
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&mut self, message: Message) -> Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(message)
                .map_err(|_| Error::Connection("peer endpoint is gone".to_string())),
            None => Err(Error::Connection("channel is closed".to_string())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.tx.take();
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Message>,
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Message>> {
        Ok(self.rx.recv().await)
    }
}

/// Create two connected channel endpoints
pub fn duplex() -> (ChannelPair, ChannelPair) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();

    let left: ChannelPair = (
        Box::new(MemorySink { tx: Some(left_tx) }),
        Box::new(MemorySource { rx: right_rx }),
    );
    let right: ChannelPair = (
        Box::new(MemorySink { tx: Some(right_tx) }),
        Box::new(MemorySource { rx: left_rx }),
    );
    (left, right)
}

/// Accepting side of the memory link
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<ChannelPair>,
}

impl MemoryListener {
    /// Wait for the next connection
    pub async fn accept(&mut self) -> Result<ChannelPair> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::Connection("all connectors are gone".to_string()))
    }
}

/// Connecting side of the memory link. Cloneable so tests can keep a handle
/// for fault injection while the transport owns another.
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<ChannelPair>,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
}

impl MemoryConnector {
    /// Make subsequent connect attempts fail, as an unreachable peer would
    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connect attempts observed so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<ChannelPair> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Connection("connection refused".to_string()));
        }
        let (local, remote) = duplex();
        self.accept_tx
            .send(remote)
            .map_err(|_| Error::Connection("listener is gone".to_string()))?;
        Ok(local)
    }
}

/// Create a connected connector/listener pair
pub fn link() -> (MemoryConnector, MemoryListener) {
    let (accept_tx, rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            accept_tx,
            refuse: Arc::new(AtomicBool::new(false)),
            attempts: Arc::new(AtomicU32::new(0)),
        },
        MemoryListener { rx },
    )
}

/// Connector that hands out one pre-established channel, for the accepting
/// side of a connection where reconnection is not meaningful.
pub struct PairConnector {
    pair: Mutex<Option<ChannelPair>>,
}

impl PairConnector {
    pub fn new(pair: ChannelPair) -> Self {
        Self {
            pair: Mutex::new(Some(pair)),
        }
    }
}

#[async_trait]
impl Connector for PairConnector {
    async fn connect(&self) -> Result<ChannelPair> {
        self.pair
            .lock()
            .take()
            .ok_or_else(|| Error::Connection("channel was already consumed".to_string()))
    }
}

/// Convenience for tests and demos: a connected client/server transport
/// pair over one memory link. The server side cannot reconnect; the client
/// side reconnects through the returned connector's listener.
pub async fn transport_pair(
    client_config: crate::transport::TransportConfig,
    server_config: crate::transport::TransportConfig,
) -> Result<(crate::transport::Transport, crate::transport::Transport)> {
    let (connector, mut listener) = link();
    let client = crate::transport::Transport::new(Arc::new(connector), client_config);
    client.connect().await?;
    let pair = listener.accept().await?;
    let server =
        crate::transport::Transport::new(Arc::new(PairConnector::new(pair)), server_config);
    server.connect().await?;
    Ok((client, server))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplex_delivers_in_send_order() {
        let ((mut left_sink, _left_source), (_right_sink, mut right_source)) = duplex();

        for id in 1..=5 {
            left_sink.send(Message::ping(id)).await.unwrap();
        }
        for id in 1..=5 {
            let received = right_source.recv().await.unwrap().unwrap();
            assert_eq!(received.id(), id);
        }
    }

    #[tokio::test]
    async fn closing_the_sink_ends_the_peer_source() {
        let ((mut left_sink, _left_source), (right_sink, mut right_source)) = duplex();

        left_sink.send(Message::ping(1)).await.unwrap();
        left_sink.close().await.unwrap();
        drop(right_sink);

        assert!(right_source.recv().await.unwrap().is_some());
        assert!(right_source.recv().await.unwrap().is_none());
        assert!(left_sink.send(Message::ping(2)).await.is_err());
    }

    #[tokio::test]
    async fn connector_reaches_the_listener() {
        let (connector, mut listener) = link();

        let (mut client_sink, _client_source) = connector.connect().await.unwrap();
        let (_server_sink, mut server_source) = listener.accept().await.unwrap();

        client_sink.send(Message::ping(7)).await.unwrap();
        assert_eq!(server_source.recv().await.unwrap().unwrap().id(), 7);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn refusing_connector_fails_connects() {
        let (connector, _listener) = link();
        connector.set_refusing(true);
        assert!(connector.connect().await.is_err());
        connector.set_refusing(false);
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn pair_connector_hands_out_its_channel_once() {
        let (pair, _peer) = duplex();
        let connector = PairConnector::new(pair);
        assert!(connector.connect().await.is_ok());
        assert!(connector.connect().await.is_err());
    }
}
