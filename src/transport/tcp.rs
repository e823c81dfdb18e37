//! TCP physical links.
//!
//! Peers are addressed through a static system id to socket address table.
//! Accepted sockets are adopted as anonymous incoming links, since the
//! caller's identity is only known once its session descriptor arrives.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{Dialer, MuxTransport, PhysicalStream};
use crate::error::{PlexusError, Result};
use crate::protocol::SystemId;

/// Dialer resolving system ids to TCP addresses.
#[derive(Debug, Default)]
pub struct TcpDialer {
    peers: RwLock<HashMap<SystemId, SocketAddr>>,
}

impl TcpDialer {
    /// Create a dialer with no known peers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the address of a peer.
    pub fn add_peer(&self, id: SystemId, addr: SocketAddr) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, addr);
    }

    fn address(&self, id: &SystemId) -> Option<SocketAddr> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, target: &SystemId) -> Result<Box<dyn PhysicalStream>> {
        let addr = self.address(target).ok_or_else(|| {
            PlexusError::Io(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address known for {target}"),
            ))
        })?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!("connected to {} at {}", target, addr);
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// Accept TCP links and adopt them into `transport` until accept fails.
pub async fn serve_tcp(listener: TcpListener, transport: Arc<MuxTransport>) -> Result<()> {
    tracing::info!("TCP transport listening on {}", listener.local_addr()?);
    loop {
        let (stream, remote_addr) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Failed to disable Nagle for {}: {}", remote_addr, e);
        }
        match transport.attach_incoming(None, stream) {
            Ok(mux) => tracing::debug!("New TCP link from {} ({})", remote_addr, mux.id()),
            Err(e) => tracing::warn!("Rejected TCP link from {}: {}", remote_addr, e),
        }
    }
}
