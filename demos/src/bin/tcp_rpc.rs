//! RPC over a real TCP socket: an echo service and a client in one process.

use std::net::SocketAddr;
use std::sync::Arc;
use strand_core::{Error, Result};
use strand_registry::NameRegistry;
use strand_rpc::{Dispatcher, RpcClient};
use strand_transport::memory::PairConnector;
use strand_transport::tcp::{TcpConnector, TcpMessageListener};
use strand_transport::{Transport, TransportConfig};
use strand_wire::FrameCodec;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let bind_addr: SocketAddr = "127.0.0.1:0"
        .parse()
        .map_err(|e| Error::InvalidArgument(format!("invalid address: {}", e)))?;
    let listener = TcpMessageListener::bind(bind_addr, FrameCodec::new()).await?;
    let addr = listener.local_addr()?;
    info!("echo server listening on {}", addr);

    let registry = Arc::new(NameRegistry::new());

    // server: accept one connection and serve it
    let server_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        let (pair, peer) = listener.accept().await?;
        info!("serving {}", peer);
        let transport = Arc::new(Transport::new(
            Arc::new(PairConnector::new(pair)),
            TransportConfig::default(),
        ));

        let dispatcher = Dispatcher::new(server_registry);
        dispatcher.register_closure("EchoService", "echo", |params| {
            Ok(params.into_iter().next())
        })?;
        // subscribe before the channel starts pumping messages
        let serving = dispatcher.serve(Arc::clone(&transport));
        transport.connect().await?;
        serving.await.ok();
        Ok::<(), strand_core::Error>(())
    });

    // client: same process, real socket
    let transport = Arc::new(Transport::new(
        Arc::new(TcpConnector::new(addr)),
        TransportConfig::default(),
    ));
    transport.connect().await?;

    let client = RpcClient::new(Arc::clone(&transport), Arc::clone(&registry));
    client.start();

    let reply = client
        .call("EchoService", "echo", vec![b"over the wire".to_vec()])
        .await?;
    info!(
        "echo -> {}",
        String::from_utf8_lossy(&reply.unwrap_or_default())
    );

    transport.disconnect().await?;
    Ok(())
}
