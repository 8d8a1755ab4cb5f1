//! Message transports
//!
//! A transport moves framed messages between runtimes. It decodes the wire
//! header of every message it receives and hands header, sender and payload
//! to the runtime's [`Inbound`] handler.

pub mod memory;
pub mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;
use crate::error::Result;
use crate::rpc::WireHeader;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

/// Receives decoded messages from a transport
pub trait Inbound: Send + Sync {
    /// Handle one message. `from` is the sender's address as the transport
    /// observed it.
    fn on_message(&self, header: WireHeader, from: SocketAddr, payload: Vec<u8>);
}

/// Sends and receives framed messages
pub trait Transport: Send + Sync {
    /// Begin delivering received messages to `inbound`
    fn start(&self, inbound: Arc<dyn Inbound>) -> Result<()>;

    /// Stop accepting and sending messages
    fn stop(&self);

    /// Join the transport's thread
    fn wait(&self);

    /// Address peers use to reach this transport
    fn local_addr(&self) -> SocketAddr;

    /// Queue a message for `to`. Failures are logged, never reported.
    fn send(&self, to: SocketAddr, message: Vec<u8>);
}
