//! Transport plugins.
//!
//! A transport plugin turns a target system into a raw connector. The
//! provided [`MuxTransport`] keeps one [`Multiplexer`](crate::mux::Multiplexer)
//! per peer and hands out virtual channels, so many negotiated sessions share
//! one physical link.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              MuxTransport                │
//! │     (peer → Multiplexer cache)          │
//! └──────────────────┬──────────────────────┘
//!                    │ Dialer
//!          ┌────────┴────────┐
//!          ▼                 ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │   TcpDialer     │ │  MemoryDialer   │
//! │  (TCP sockets)  │ │ (duplex pipes)  │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use plexus::transport::{MemoryNetwork, MuxTransport};
//!
//! let network = MemoryNetwork::new();
//! let transport = MuxTransport::new(ability, network.dialer("watch".into()), config);
//! network.register("watch".into(), &transport);
//! ```

mod memory;
mod multiplexed;
mod tcp;

pub use memory::{MemoryDialer, MemoryNetwork};
pub use multiplexed::{GroupHandler, MuxTransport, TRANSPORT_KIND};
pub use tcp::{serve_tcp, TcpDialer};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::protocol::SystemId;

/// Physical duplex byte stream.
pub trait PhysicalStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> PhysicalStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Establishes physical links to peers.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a physical stream to `target`.
    async fn dial(&self, target: &SystemId) -> Result<Box<dyn PhysicalStream>>;

    /// Get the dialer name for logging.
    fn name(&self) -> &'static str;
}
