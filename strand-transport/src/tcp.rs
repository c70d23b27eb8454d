//! Framed TCP channel.
//!
//! Messages travel as frames produced by the wire codec:
//! `[len: u32 BE][format: u8][flags: u8][body]`. The frame header makes each
//! message self-describing, so peers need not agree on a format up front.

use crate::channel::{ChannelPair, Connector, MessageSink, MessageSource};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use strand_core::{Error, Result};
use strand_wire::{FrameCodec, Message, FRAME_HEADER_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};

struct TcpSink {
    writer: OwnedWriteHalf,
    codec: FrameCodec,
}

#[async_trait]
impl MessageSink for TcpSink {
    async fn send(&mut self, message: Message) -> Result<()> {
        let frame = self.codec.encode_frame(&message)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

struct TcpSource {
    reader: OwnedReadHalf,
    codec: FrameCodec,
}

#[async_trait]
impl MessageSource for TcpSource {
    async fn recv(&mut self) -> Result<Option<Message>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let parsed = self.codec.parse_header(header)?;

        let mut body = vec![0u8; parsed.body_len];
        self.reader.read_exact(&mut body).await?;
        let message = self.codec.decode_body(&parsed, &body)?;
        debug!("received {} frame of {} bytes", message.kind(), parsed.body_len);
        Ok(Some(message))
    }
}

fn split(stream: TcpStream, codec: &FrameCodec) -> Result<ChannelPair> {
    stream
        .set_nodelay(true)
        .map_err(|e| Error::Connection(format!("socket configuration failed: {}", e)))?;
    let (reader, writer) = stream.into_split();
    Ok((
        Box::new(TcpSink {
            writer,
            codec: codec.clone(),
        }),
        Box::new(TcpSource {
            reader,
            codec: codec.clone(),
        }),
    ))
}

/// Connects framed TCP channels to one remote address
pub struct TcpConnector {
    addr: SocketAddr,
    codec: FrameCodec,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            codec: FrameCodec::new(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<ChannelPair> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::Connection(format!("connect to {} timed out", self.addr)))?
            .map_err(|e| Error::Connection(format!("connect to {} failed: {}", self.addr, e)))?;
        info!("connected to {}", self.addr);
        split(stream, &self.codec)
    }
}

/// Accepts framed TCP channels
pub struct TcpMessageListener {
    inner: TcpListener,
    codec: FrameCodec,
}

impl TcpMessageListener {
    pub async fn bind(addr: SocketAddr, codec: FrameCodec) -> Result<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Connection(format!("bind to {} failed: {}", addr, e)))?;
        info!("listening on {}", inner.local_addr()?);
        Ok(Self { inner, codec })
    }

    pub async fn accept(&self) -> Result<(ChannelPair, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        info!("accepted connection from {}", peer);
        Ok((split(stream, &self.codec)?, peer))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_a_real_socket_in_order() {
        let listener =
            TcpMessageListener::bind("127.0.0.1:0".parse().unwrap(), FrameCodec::new())
                .await
                .unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let ((_sink, mut source), _peer) = listener.accept().await.unwrap();
            let mut ids = Vec::new();
            while let Some(message) = source.recv().await.unwrap() {
                ids.push(message.id());
            }
            ids
        });

        let connector = TcpConnector::new(addr);
        let (mut sink, _source) = connector.connect().await.unwrap();
        for id in 1..=3 {
            sink.send(Message::request(id, "S", "m", vec![b"1".to_vec()], false))
                .await
                .unwrap();
        }
        sink.close().await.unwrap();

        assert_eq!(server.await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn connect_to_unreachable_peer_fails() {
        // port 1 is essentially never listening
        let connector = TcpConnector::new("127.0.0.1:1".parse().unwrap())
            .with_connect_timeout(Duration::from_millis(500));
        let result = connector.connect().await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }
}
