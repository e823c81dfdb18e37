//! Multiplexing transport plugin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use uuid::Uuid;

use super::{Dialer, PhysicalStream};
use crate::config::MultiplexerConfig;
use crate::connector::{Connector, PacketConnector, StreamConnector};
use crate::error::{PlexusError, Result};
use crate::mux::{Multiplexer, MultiplexerOwner};
use crate::plugin::{Lifecycle, ManagerHandle, Plugin};
use crate::protocol::{Ability, ExtensionLayer, PluginCapability, PluginKey, Session, SystemId};
use crate::requirement::{ids, DimensionValue, RequirementSet};

/// Value of the transport `type` property.
pub const TRANSPORT_KIND: &str = "mux";

/// Receives packet connectors for groups first opened by a peer.
pub type GroupHandler = Arc<dyn Fn(PacketConnector) + Send + Sync>;

#[derive(Default)]
struct Links {
    by_peer: HashMap<SystemId, Multiplexer>,
    anonymous: HashMap<Uuid, Multiplexer>,
}

/// Transport plugin caching one multiplexer per peer.
///
/// Outgoing calls reuse the cached multiplexer for the target, dialing a new
/// physical link only when none is open. Incoming physical links are
/// adopted with [`attach_incoming`](Self::attach_incoming); channels the
/// peer opens on any link are delivered to the manager for negotiation.
pub struct MuxTransport {
    me: Weak<MuxTransport>,
    capability: PluginCapability,
    lifecycle: Lifecycle,
    config: MultiplexerConfig,
    dialer: Arc<dyn Dialer>,
    links: Mutex<Links>,
    dialing: tokio::sync::Mutex<()>,
    group_handler: RwLock<Option<GroupHandler>>,
}

impl MuxTransport {
    /// Create a transport plugin.
    pub fn new(ability: Ability, dialer: Arc<dyn Dialer>, config: MultiplexerConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            capability: PluginCapability::new(ExtensionLayer::Transport, ability)
                .with_property(ids::TYPE, TRANSPORT_KIND)
                .with_property("max_packet_length", config.max_packet_length)
                .with_local_property("dialer", dialer.name()),
            lifecycle: Lifecycle::new(),
            config,
            dialer,
            links: Mutex::new(Links::default()),
            dialing: tokio::sync::Mutex::new(()),
            group_handler: RwLock::new(None),
        })
    }

    /// Handle packet groups first opened by a peer. Without a handler such
    /// connectors are released immediately.
    pub fn set_group_handler(&self, handler: impl Fn(PacketConnector) + Send + Sync + 'static) {
        *self
            .group_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Adopt a physical link opened by a peer.
    ///
    /// When the peer is known the link is also reused for outgoing calls to
    /// it.
    pub fn attach_incoming<S>(&self, peer: Option<SystemId>, stream: S) -> Result<Multiplexer>
    where
        S: PhysicalStream + 'static,
    {
        self.lifecycle.manager()?;
        let mux = Multiplexer::spawn(stream, true, &self.owner()?, self.config.clone());
        if let Some(peer) = &peer {
            tracing::debug!("adopted link from {}", peer);
        }
        self.track(peer, &mux);
        Ok(mux)
    }

    /// Join a datagram group on the link to `target`, dialing if needed.
    pub async fn open_group(&self, target: &SystemId, group: u32) -> Result<PacketConnector> {
        self.lifecycle.manager()?;
        self.multiplexer(target).await?.open_packet_connector(group)
    }

    /// Open multiplexer to `target`, if cached
    pub fn cached(&self, target: &SystemId) -> Option<Multiplexer> {
        self.links()
            .by_peer
            .get(target)
            .filter(|mux| !mux.is_closed())
            .cloned()
    }

    /// Number of open physical links
    pub fn link_count(&self) -> usize {
        let links = self.links();
        links.by_peer.len() + links.anonymous.len()
    }

    /// Record a new link. An open link already cached for the peer stays
    /// the one outgoing calls use; the newcomer is tracked anonymously so
    /// `stop` still closes it.
    fn track(&self, peer: Option<SystemId>, mux: &Multiplexer) {
        let mut links = self.links();
        let cached = peer
            .as_ref()
            .and_then(|peer| links.by_peer.get(peer))
            .is_some_and(|cached| !cached.is_closed());
        match peer {
            Some(peer) if !cached => {
                links.by_peer.insert(peer, mux.clone());
            },
            _ => {
                links.anonymous.insert(mux.id(), mux.clone());
            },
        }
        // The reader may already have closed it and run the eviction.
        if mux.is_closed() {
            links.anonymous.remove(&mux.id());
            links.by_peer.retain(|_, cached| cached != mux);
        }
    }

    fn links(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owner(&self) -> Result<Arc<dyn MultiplexerOwner>> {
        let me: Arc<dyn MultiplexerOwner> = self
            .me
            .upgrade()
            .ok_or_else(|| PlexusError::Unconfigured("transport is shutting down".to_string()))?;
        Ok(me)
    }

    async fn multiplexer(&self, target: &SystemId) -> Result<Multiplexer> {
        if let Some(mux) = self.cached(target) {
            return Ok(mux);
        }

        // One dial at a time so concurrent calls share the new link.
        let _dialing = self.dialing.lock().await;
        if let Some(mux) = self.cached(target) {
            return Ok(mux);
        }

        tracing::debug!("dialing {} via {}", target, self.dialer.name());
        let stream = self.dialer.dial(target).await?;
        let mux = Multiplexer::spawn(stream, false, &self.owner()?, self.config.clone());
        self.track(Some(target.clone()), &mux);
        Ok(mux)
    }
}

#[async_trait]
impl Plugin for MuxTransport {
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
        let links = std::mem::take(&mut *self.links());
        for mux in links.by_peer.into_values().chain(links.anonymous.into_values()) {
            mux.close();
        }
        Ok(())
    }

    async fn prepare(
        &self,
        _remote: &PluginCapability,
        requirements: &RequirementSet,
        _session: &mut Session,
    ) -> bool {
        requirements
            .dimension(ExtensionLayer::Transport, ids::TYPE)
            .map_or(true, |kind| kind.accepts(&DimensionValue::from(TRANSPORT_KIND)))
    }

    async fn open(
        &self,
        session: &Session,
        inner: Option<StreamConnector>,
    ) -> Result<StreamConnector> {
        self.lifecycle.manager()?;
        if inner.is_some() {
            return Err(PlexusError::Protocol(
                "transport hop must be innermost".to_string(),
            ));
        }
        let mux = self.multiplexer(session.target()).await?;
        mux.open_connector().await
    }
}

impl MultiplexerOwner for MuxTransport {
    fn plugin_key(&self) -> PluginKey {
        self.capability.key()
    }

    fn accept_connector(&self, multiplexer: &Multiplexer, connector: Connector) {
        match connector {
            Connector::Stream(stream) => match self.lifecycle.manager() {
                Ok(manager) => {
                    if let Err(e) = manager.deliver(stream) {
                        tracing::warn!("dropping channel from {:?}: {}", multiplexer, e);
                    }
                },
                Err(e) => tracing::debug!("dropping channel: {}", e),
            },
            Connector::Packet(packet) => {
                let handler = self
                    .group_handler
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match handler {
                    Some(handler) => handler(packet),
                    None => tracing::debug!("no handler for packet group {}", packet.group()),
                }
            },
        }
    }

    fn close_multiplexer(&self, multiplexer: &Multiplexer) {
        let mut links = self.links();
        links.anonymous.remove(&multiplexer.id());
        links.by_peer.retain(|_, mux| mux != multiplexer);
        tracing::debug!("evicted multiplexer {}", multiplexer.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginManager;
    use crate::transport::MemoryNetwork;

    #[tokio::test]
    async fn test_open_requires_start() {
        let network = MemoryNetwork::new();
        let transport = MuxTransport::new(
            Ability::new(0x10, 1),
            network.dialer(SystemId::new("a")),
            MultiplexerConfig::default(),
        );
        let session = Session::new(
            Uuid::new_v4(),
            SystemId::new("b"),
            transport.capability().key(),
            crate::protocol::Direction::Outgoing,
        );
        assert!(matches!(
            transport.open(&session, None).await,
            Err(PlexusError::Unconfigured(_))
        ));

        let (manager, _rx) = PluginManager::new(SystemId::new("a"));
        manager.install(transport.clone()).unwrap();
        assert!(matches!(
            transport.open(&session, None).await,
            Err(PlexusError::Unconfigured(_))
        ));
    }

    fn started(local: &str) -> (Arc<MuxTransport>, PluginManager) {
        let network = MemoryNetwork::new();
        let transport = MuxTransport::new(
            Ability::new(0x10, 1),
            network.dialer(SystemId::new(local)),
            MultiplexerConfig::default(),
        );
        let (manager, _rx) = PluginManager::new(SystemId::new(local));
        manager.install(transport.clone()).unwrap();
        manager.start_all().unwrap();
        (transport, manager)
    }

    #[tokio::test]
    async fn test_second_link_to_peer_is_tracked() {
        let (transport, _manager) = started("a");
        let peer = SystemId::new("b");
        let (first_link, _first_remote) = tokio::io::duplex(4096);
        let (second_link, _second_remote) = tokio::io::duplex(4096);

        let first = transport
            .attach_incoming(Some(peer.clone()), first_link)
            .unwrap();
        let second = transport
            .attach_incoming(Some(peer.clone()), second_link)
            .unwrap();
        assert_eq!(transport.link_count(), 2);
        assert_eq!(transport.cached(&peer), Some(first.clone()));

        transport.stop().unwrap();
        assert!(first.is_closed());
        assert!(second.is_closed());
        assert_eq!(transport.link_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dead_link_is_not_left_cached() {
        let (transport, _manager) = started("a");
        let (link, remote) = tokio::io::duplex(4096);
        drop(remote);

        let mux = transport
            .attach_incoming(Some(SystemId::new("b")), link)
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !mux.is_closed() || transport.link_count() != 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(transport.cached(&SystemId::new("b")).is_none());
    }

    #[tokio::test]
    async fn test_prepare_checks_transport_type() {
        let network = MemoryNetwork::new();
        let transport = MuxTransport::new(
            Ability::new(0x10, 1),
            network.dialer(SystemId::new("a")),
            MultiplexerConfig::default(),
        );
        let remote = transport.capability().remote_view();
        assert!(remote.property("dialer").is_none());
        assert_eq!(remote.property(ids::TYPE), Some(&serde_json::json!("mux")));

        let mut session = Session::new(
            Uuid::new_v4(),
            SystemId::new("b"),
            transport.capability().key(),
            crate::protocol::Direction::Outgoing,
        );
        let bluetooth = RequirementSet::new().with(
            ExtensionLayer::Transport,
            crate::requirement::Dimension::unordered(ids::TYPE, "bluetooth"),
        );
        assert!(!transport.prepare(&remote, &bluetooth, &mut session).await);
        assert!(transport.prepare(&remote, &RequirementSet::new(), &mut session).await);
    }
}
