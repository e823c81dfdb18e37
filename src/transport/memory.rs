//! In-process physical links.
//!
//! Each dial creates a tokio duplex pipe and hands the far end to the
//! target's transport as an incoming link.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;

use super::{Dialer, MuxTransport, PhysicalStream};
use crate::error::Result;
use crate::protocol::SystemId;

/// Pipe buffer size per direction
const PIPE_BUFFER: usize = 64 * 1024;

/// Registry of in-process transports by system id.
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: RwLock<HashMap<SystemId, Weak<MuxTransport>>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `transport` reachable as `id`.
    pub fn register(&self, id: SystemId, transport: &Arc<MuxTransport>) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::downgrade(transport));
    }

    /// Make `id` unreachable.
    pub fn unregister(&self, id: &SystemId) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Dialer for the system `local`.
    pub fn dialer(self: &Arc<Self>, local: SystemId) -> Arc<MemoryDialer> {
        Arc::new(MemoryDialer {
            network: self.clone(),
            local,
        })
    }

    fn endpoint(&self, id: &SystemId) -> Option<Arc<MuxTransport>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .and_then(Weak::upgrade)
    }
}

/// Dialer over a [`MemoryNetwork`].
pub struct MemoryDialer {
    network: Arc<MemoryNetwork>,
    local: SystemId,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, target: &SystemId) -> Result<Box<dyn PhysicalStream>> {
        let endpoint = self.network.endpoint(target).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no endpoint registered for {target}"),
            )
        })?;

        let (near, far) = tokio::io::duplex(PIPE_BUFFER);
        endpoint.attach_incoming(Some(self.local.clone()), far)?;
        Ok(Box::new(near))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlexusError;

    #[tokio::test]
    async fn test_dial_unknown_endpoint_refused() {
        let network = MemoryNetwork::new();
        let dialer = network.dialer(SystemId::new("a"));
        let err = match dialer.dial(&SystemId::new("nobody")).await {
            Ok(_) => panic!("dial should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, PlexusError::Io(ref e) if e.kind() == io::ErrorKind::ConnectionRefused));
        assert!(err.is_retryable());
    }
}
