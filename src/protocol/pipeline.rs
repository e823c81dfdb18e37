//! Connector pipeline.
//!
//! Opens a negotiated chain bottom-up: the transport hop produces the raw
//! connector, then each outer hop wraps the connector beneath it.
//!
//! ```text
//!   semantics      open(Some(serializer connector))     ▲
//!   serialization  open(Some(encryption connector))     │ wrap
//!   encryption     open(Some(raw))                      │
//!   transport      open(None) ──> raw ──> descriptor ──> verdict
//! ```
//!
//! Outer hops wrap only after the peer accepted the descriptor, so a
//! rejected call surfaces as one negotiation error.
//!
//! A plugin's `open` owns the inner connector it was given, so a failing
//! wrap drops (and thereby releases) everything opened so far.

use std::sync::Arc;
use std::time::Duration;

use super::capability::ExtensionLayer;
use super::session::{read_verdict, write_descriptor, Session, SessionVerdict};
use crate::config::NegotiationConfig;
use crate::connector::StreamConnector;
use crate::error::{PlexusError, Result};
use crate::plugin::{Plugin, PluginManager};

/// Opens connectors along negotiated session chains.
pub struct ConnectorPipeline {
    manager: Arc<PluginManager>,
    handshake_timeout: Duration,
}

impl ConnectorPipeline {
    /// Create a pipeline over installed plugins.
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self {
            manager,
            handshake_timeout: NegotiationConfig::default().handshake_timeout(),
        }
    }

    /// Bound the wait for the peer's verdict.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Open an outgoing chain.
    ///
    /// Acquires exactly one transport connector, writes the session
    /// descriptor on it and waits for the peer's verdict, then wraps
    /// outward. A rejection releases the transport connector and is
    /// returned as [`PlexusError::Negotiation`].
    pub async fn open(&self, session: &Session) -> Result<StreamConnector> {
        let hops: Vec<&Session> = session.iter().collect();
        let (transport, outer) = split_transport(&hops)?;

        let plugin = self.plugin_for(transport)?;
        let mut raw = plugin.open(transport, None).await?;
        let descriptor = session.descriptor(self.manager.local());
        write_descriptor(&mut raw, &descriptor).await?;

        let verdict = tokio::time::timeout(self.handshake_timeout, read_verdict(&mut raw))
            .await
            .map_err(|_| {
                PlexusError::Protocol("timed out waiting for session verdict".to_string())
            })??;
        match verdict {
            SessionVerdict::Accepted => {},
            SessionVerdict::Rejected { mut failure } => {
                failure.target = session.target().clone();
                tracing::debug!(call = %session.id(), "peer rejected session: {}", failure);
                return Err(PlexusError::Negotiation(failure));
            },
            SessionVerdict::Refused { reason } => {
                return Err(PlexusError::Protocol(format!(
                    "{} refused session: {}",
                    session.target(),
                    reason
                )));
            },
        }
        tracing::debug!(call = %session.id(), target = %session.target(), "transport opened");

        self.wrap(outer, raw).await
    }

    /// Open an incoming chain over the raw connector it arrived on.
    pub async fn open_incoming(
        &self,
        session: &Session,
        raw: StreamConnector,
    ) -> Result<StreamConnector> {
        let hops: Vec<&Session> = session.iter().collect();
        let (_, outer) = split_transport(&hops)?;
        self.wrap(outer, raw).await
    }

    async fn wrap(&self, outer: &[&Session], raw: StreamConnector) -> Result<StreamConnector> {
        let mut connector = raw;
        for hop in outer.iter().rev() {
            let plugin = self.plugin_for(hop)?;
            connector = plugin.open(hop, Some(connector)).await?;
            tracing::trace!(layer = %hop.extension(), plugin = %hop.key(), "wrapped connector");
        }
        Ok(connector)
    }

    fn plugin_for(&self, hop: &Session) -> Result<Arc<dyn Plugin>> {
        self.manager.plugin(hop.key()).ok_or_else(|| {
            PlexusError::Unconfigured(format!("plugin {} is no longer installed", hop.key()))
        })
    }
}

/// Split a chain into its innermost transport hop and the hops above it.
fn split_transport<'a, 'b>(hops: &'a [&'b Session]) -> Result<(&'b Session, &'a [&'b Session])> {
    match hops.split_last() {
        Some((transport, outer)) if transport.extension() == ExtensionLayer::Transport => {
            Ok((*transport, outer))
        },
        _ => Err(PlexusError::Protocol(
            "session chain does not end in a transport hop".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::error::{FailureReason, NegotiationFailure};
    use crate::plugin::{IdentityModifier, Lifecycle, ManagerHandle};
    use crate::protocol::{
        read_descriptor, write_verdict, Ability, Direction, PluginCapability, PluginKey, SystemId,
    };
    use crate::requirement::RequirementSet;

    /// Transport handing out one prepared connector.
    struct Prepared {
        capability: PluginCapability,
        lifecycle: Lifecycle,
        connector: Mutex<Option<StreamConnector>>,
    }

    #[async_trait]
    impl Plugin for Prepared {
        fn capability(&self) -> PluginCapability {
            self.capability.clone()
        }

        fn attach(&self, manager: ManagerHandle) {
            self.lifecycle.attach(manager);
        }

        fn start(&self) -> Result<()> {
            self.lifecycle.start()
        }

        fn stop(&self) -> Result<()> {
            self.lifecycle.stop();
            Ok(())
        }

        async fn prepare(
            &self,
            _remote: &PluginCapability,
            _requirements: &RequirementSet,
            _session: &mut Session,
        ) -> bool {
            true
        }

        async fn open(
            &self,
            _session: &Session,
            _inner: Option<StreamConnector>,
        ) -> Result<StreamConnector> {
            self.connector
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| PlexusError::Unconfigured("already opened".to_string()))
        }
    }

    #[tokio::test]
    async fn test_rejected_verdict_releases_transport() {
        let key = PluginKey {
            extension: ExtensionLayer::Transport,
            ability: Ability::new(0x10, 1),
        };
        let released = Arc::new(AtomicBool::new(false));
        let (ours, mut theirs) = tokio::io::duplex(4096);
        let flag = released.clone();
        let connector =
            StreamConnector::from_stream(key, ours).on_release(move || flag.store(true, Ordering::SeqCst));

        let (manager, _rx) = PluginManager::new(SystemId::new("caller"));
        manager
            .install(Arc::new(Prepared {
                capability: PluginCapability::new(key.extension, key.ability),
                lifecycle: Lifecycle::new(),
                connector: Mutex::new(Some(connector)),
            }))
            .unwrap();
        let pipeline = ConnectorPipeline::new(Arc::new(manager));

        let peer = tokio::spawn(async move {
            let descriptor = read_descriptor(&mut theirs, 1024).await.unwrap();
            let verdict = SessionVerdict::Rejected {
                failure: NegotiationFailure {
                    layer: ExtensionLayer::Encryption,
                    target: descriptor.source,
                    attempted: Vec::new(),
                    reason: FailureReason::NoAcceptingPlugin,
                },
            };
            write_verdict(&mut theirs, &verdict).await.unwrap();
            theirs
        });

        let session = Session::new(Uuid::new_v4(), SystemId::new("callee"), key, Direction::Outgoing);
        let err = pipeline.open(&session).await.unwrap_err();
        let PlexusError::Negotiation(failure) = err else {
            panic!("expected negotiation failure");
        };
        assert_eq!(failure.layer, ExtensionLayer::Encryption);
        assert_eq!(failure.target.as_str(), "callee");
        assert!(released.load(Ordering::SeqCst));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_chain_without_transport_is_rejected() {
        let (manager, _rx) = PluginManager::new(SystemId::new("local"));
        let plugin = Arc::new(IdentityModifier::new(ExtensionLayer::Compression, Ability::new(1, 0)));
        let key = plugin.capability().key();
        manager.install(plugin).unwrap();
        let pipeline = ConnectorPipeline::new(Arc::new(manager));

        let session = Session::new(Uuid::new_v4(), SystemId::new("peer"), key, Direction::Outgoing);
        assert!(matches!(
            pipeline.open(&session).await,
            Err(PlexusError::Protocol(_))
        ));
    }
}
