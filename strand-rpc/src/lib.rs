//! # strand-rpc
//!
//! The two endpoints of the strand RPC substrate: [`RpcClient`], which
//! multiplexes concurrent calls and streams over one transport, and
//! [`Dispatcher`], which resolves incoming wire identifiers to handlers and
//! drives responses and stream emission.

pub mod client;
pub mod server;

pub use client::{CallStream, ClientConfig, RpcClient};
pub use server::{
    ClosureStream, ClosureUnary, Dispatcher, DispatcherConfig, StreamHandler, StreamProducer,
    TypedUnary, UnaryHandler,
};

pub mod prelude {
    //! Common imports for strand applications

    pub use crate::client::{CallStream, RpcClient};
    pub use crate::server::{Dispatcher, StreamProducer, UnaryHandler};
    pub use strand_core::{Error, Result};
    pub use strand_registry::NameRegistry;
    pub use strand_transport::{Transport, TransportConfig};
    pub use strand_wire::{Message, Payload};
}
