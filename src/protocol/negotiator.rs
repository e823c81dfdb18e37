//! Requirement-driven stack negotiation.
//!
//! Layers are processed outermost first ([`ExtensionLayer::NEGOTIATION_ORDER`]).
//! For each layer the local plugins are offered the hop in installation
//! order and the first whose `prepare` returns true is selected. Selection
//! is first-fit: a later layer failing never revisits an earlier choice.
//!
//! | Layer state                          | Mandatory            | Optional |
//! |--------------------------------------|----------------------|----------|
//! | target advertises nothing            | fail `NotAdvertised` | skip     |
//! | no local plugin accepts              | fail `NoAcceptingPlugin` | skip |
//! | a plugin accepts                     | hop added            | hop added |
//!
//! A layer is mandatory when it carries `required = true`. The chain must end
//! in a transport hop.

use std::sync::Arc;

use uuid::Uuid;

use super::capability::{Ability, CapabilitySource, ExtensionLayer, PluginCapability, SystemId};
use super::session::{Direction, Session, SessionDescriptor};
use crate::error::{FailureReason, NegotiationFailure, PlexusError, Result};
use crate::plugin::PluginManager;
use crate::requirement::RequirementSet;

/// Builds session chains for outgoing and incoming calls.
pub struct StackNegotiator {
    manager: Arc<PluginManager>,
    capabilities: Arc<dyn CapabilitySource>,
}

impl StackNegotiator {
    /// Create a negotiator over installed plugins and a capability registry.
    pub fn new(manager: Arc<PluginManager>, capabilities: Arc<dyn CapabilitySource>) -> Self {
        Self {
            manager,
            capabilities,
        }
    }

    /// Negotiate an outgoing session chain for `target`.
    ///
    /// Either returns a complete chain or a single
    /// [`PlexusError::Negotiation`]; nothing is opened either way.
    pub async fn negotiate(
        &self,
        target: &SystemId,
        requirements: &RequirementSet,
    ) -> Result<Session> {
        let call = Uuid::new_v4();
        let advertised = self.capabilities.capabilities(target);
        let mut nodes = Vec::new();

        for layer in ExtensionLayer::NEGOTIATION_ORDER {
            if let Some(node) = self
                .negotiate_layer(call, target, layer, &advertised, requirements)
                .await?
            {
                nodes.push(node);
            }
        }

        let chain = finish(nodes, target)?;
        tracing::debug!(
            call = %call,
            %target,
            hops = chain.len(),
            "negotiated session chain"
        );
        Ok(chain)
    }

    async fn negotiate_layer(
        &self,
        call: Uuid,
        target: &SystemId,
        layer: ExtensionLayer,
        advertised: &[PluginCapability],
        requirements: &RequirementSet,
    ) -> Result<Option<Session>> {
        let mandatory = requirements.is_required(layer);
        let remote: Vec<&PluginCapability> = advertised
            .iter()
            .filter(|cap| cap.extension() == layer)
            .collect();

        if remote.is_empty() {
            if mandatory {
                return Err(failure(layer, target, Vec::new(), FailureReason::NotAdvertised));
            }
            tracing::trace!(%layer, %target, "layer not advertised, skipping");
            return Ok(None);
        }

        let wanted = requirements.required_ability(layer);
        let mut attempted = Vec::new();
        for plugin in self.manager.plugins(layer) {
            let key = plugin.key();
            if wanted.is_some_and(|ability| ability != key.ability) {
                continue;
            }
            let Some(remote_cap) = remote.iter().find(|cap| cap.ability() == key.ability) else {
                continue;
            };

            attempted.push(key.ability);
            let mut node = Session::new(call, target.clone(), key, Direction::Outgoing);
            if plugin.prepare(remote_cap, requirements, &mut node).await {
                tracing::debug!(%layer, plugin = %key, "plugin accepted hop");
                return Ok(Some(node));
            }
            tracing::debug!(%layer, plugin = %key, "plugin declined hop");
        }

        if mandatory {
            return Err(failure(layer, target, attempted, FailureReason::NoAcceptingPlugin));
        }
        Ok(None)
    }

    /// Rebuild the incoming session chain described by a peer.
    ///
    /// Every hop must name an installed plugin whose `prepare` accepts it,
    /// and every layer `requirements` marks mandatory must be present. A
    /// layer restricted to one ability rejects hops offering another.
    pub async fn accept(
        &self,
        descriptor: &SessionDescriptor,
        requirements: &RequirementSet,
    ) -> Result<Session> {
        let source = &descriptor.source;
        check_hop_order(descriptor)?;

        for layer in ExtensionLayer::NEGOTIATION_ORDER {
            let offered = descriptor.hops.iter().any(|hop| hop.extension == layer);
            if requirements.is_required(layer) && !offered {
                return Err(failure(layer, source, Vec::new(), FailureReason::NoAcceptingPlugin));
            }
        }

        let advertised = self.capabilities.capabilities(source);
        let mut nodes = Vec::with_capacity(descriptor.hops.len());
        for hop in &descriptor.hops {
            let key = hop.key();
            if requirements
                .required_ability(hop.extension)
                .is_some_and(|ability| ability != hop.ability)
            {
                return Err(failure(
                    hop.extension,
                    source,
                    vec![hop.ability],
                    FailureReason::NoAcceptingPlugin,
                ));
            }
            let Some(plugin) = self.manager.plugin(key) else {
                return Err(failure(
                    hop.extension,
                    source,
                    Vec::new(),
                    FailureReason::UnknownPlugin,
                ));
            };

            let remote_cap = advertised
                .iter()
                .find(|cap| cap.key() == key)
                .cloned()
                .unwrap_or_else(|| PluginCapability::new(key.extension, key.ability));

            let mut node = Session::new(descriptor.id, source.clone(), key, Direction::Incoming);
            if let Some(remote) = &hop.remote {
                node.set_remote(remote.clone());
            }
            if !plugin.prepare(&remote_cap, requirements, &mut node).await {
                return Err(failure(
                    hop.extension,
                    source,
                    vec![key.ability],
                    FailureReason::NoAcceptingPlugin,
                ));
            }
            nodes.push(node);
        }

        let chain = finish(nodes, source)?;
        tracing::debug!(call = %descriptor.id, %source, hops = chain.len(), "accepted session chain");
        Ok(chain)
    }
}

fn failure(
    layer: ExtensionLayer,
    target: &SystemId,
    attempted: Vec<Ability>,
    reason: FailureReason,
) -> PlexusError {
    tracing::debug!(%layer, %target, %reason, "negotiation failed");
    PlexusError::Negotiation(NegotiationFailure {
        layer,
        target: target.clone(),
        attempted,
        reason,
    })
}

fn finish(nodes: Vec<Session>, target: &SystemId) -> Result<Session> {
    let has_transport = nodes
        .last()
        .is_some_and(|node| node.extension() == ExtensionLayer::Transport);
    if !has_transport {
        return Err(failure(
            ExtensionLayer::Transport,
            target,
            Vec::new(),
            FailureReason::NoTransport,
        ));
    }
    Session::link(nodes).ok_or_else(|| PlexusError::Protocol("empty session chain".to_string()))
}

fn layer_rank(layer: ExtensionLayer) -> usize {
    ExtensionLayer::NEGOTIATION_ORDER
        .iter()
        .position(|l| *l == layer)
        .unwrap_or(usize::MAX)
}

/// Hops must be strictly outermost-first, one per layer.
fn check_hop_order(descriptor: &SessionDescriptor) -> Result<()> {
    let ordered = descriptor
        .hops
        .windows(2)
        .all(|pair| layer_rank(pair[0].extension) < layer_rank(pair[1].extension));
    if ordered {
        Ok(())
    } else {
        Err(PlexusError::Protocol(format!(
            "session descriptor {} lists hops out of order",
            descriptor.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::connector::StreamConnector;
    use crate::plugin::{IdentityModifier, Lifecycle, ManagerHandle, Plugin};
    use crate::protocol::{HopDescriptor, StaticCapabilities};
    use crate::requirement::Dimension;

    /// Declining plugin used to check that refusals leave no trace.
    struct Refuser {
        capability: PluginCapability,
        lifecycle: Lifecycle,
    }

    #[async_trait]
    impl Plugin for Refuser {
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
            false
        }

        async fn open(
            &self,
            _session: &Session,
            _inner: Option<StreamConnector>,
        ) -> Result<StreamConnector> {
            Err(PlexusError::Unconfigured("refuser never opens".to_string()))
        }
    }

    const TRANSPORT: Ability = Ability::new(0x10, 1);

    fn setup(
        plugins: Vec<Arc<dyn Plugin>>,
        remote: &[PluginCapability],
    ) -> (StackNegotiator, SystemId) {
        let (manager, _rx) = PluginManager::new(SystemId::new("local"));
        for plugin in plugins {
            manager.install(plugin).unwrap();
        }
        let registry = StaticCapabilities::new();
        let target = SystemId::new("remote");
        registry.advertise(target.clone(), remote);
        (
            StackNegotiator::new(Arc::new(manager), Arc::new(registry)),
            target,
        )
    }

    fn identity(layer: ExtensionLayer, ability: Ability) -> Arc<dyn Plugin> {
        Arc::new(IdentityModifier::new(layer, ability))
    }

    #[tokio::test]
    async fn test_optional_layers_skipped() {
        let (negotiator, target) = setup(
            vec![
                identity(ExtensionLayer::Transport, TRANSPORT),
                identity(ExtensionLayer::Compression, Ability::new(1, 0)),
            ],
            &[PluginCapability::new(ExtensionLayer::Transport, TRANSPORT)],
        );

        let chain = negotiator
            .negotiate(&target, &RequirementSet::new())
            .await
            .unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.extension(), ExtensionLayer::Transport);
        assert_eq!(chain.target(), &target);
    }

    #[tokio::test]
    async fn test_mandatory_layer_not_advertised() {
        let (negotiator, target) = setup(
            vec![
                identity(ExtensionLayer::Transport, TRANSPORT),
                identity(ExtensionLayer::Encryption, Ability::new(1, 0)),
            ],
            &[PluginCapability::new(ExtensionLayer::Transport, TRANSPORT)],
        );
        let requirements =
            RequirementSet::new().with(ExtensionLayer::Encryption, Dimension::required());

        let err = negotiator.negotiate(&target, &requirements).await.unwrap_err();
        let PlexusError::Negotiation(failure) = err else {
            panic!("expected negotiation failure");
        };
        assert_eq!(failure.layer, ExtensionLayer::Encryption);
        assert_eq!(failure.reason, FailureReason::NotAdvertised);
    }

    #[tokio::test]
    async fn test_declining_plugins_are_reported() {
        let refuser: Arc<dyn Plugin> = Arc::new(Refuser {
            capability: PluginCapability::new(ExtensionLayer::Encryption, Ability::new(2, 0)),
            lifecycle: Lifecycle::new(),
        });
        let (negotiator, target) = setup(
            vec![identity(ExtensionLayer::Transport, TRANSPORT), refuser],
            &[
                PluginCapability::new(ExtensionLayer::Transport, TRANSPORT),
                PluginCapability::new(ExtensionLayer::Encryption, Ability::new(2, 0)),
            ],
        );
        let requirements =
            RequirementSet::new().with(ExtensionLayer::Encryption, Dimension::required());

        let err = negotiator.negotiate(&target, &requirements).await.unwrap_err();
        let PlexusError::Negotiation(failure) = err else {
            panic!("expected negotiation failure");
        };
        assert_eq!(failure.reason, FailureReason::NoAcceptingPlugin);
        assert_eq!(failure.attempted, vec![Ability::new(2, 0)]);
    }

    #[tokio::test]
    async fn test_ability_dimension_restricts_candidates() {
        let (negotiator, target) = setup(
            vec![
                identity(ExtensionLayer::Transport, TRANSPORT),
                identity(ExtensionLayer::Compression, Ability::new(1, 0)),
                identity(ExtensionLayer::Compression, Ability::new(2, 0)),
            ],
            &[
                PluginCapability::new(ExtensionLayer::Transport, TRANSPORT),
                PluginCapability::new(ExtensionLayer::Compression, Ability::new(1, 0)),
                PluginCapability::new(ExtensionLayer::Compression, Ability::new(2, 0)),
            ],
        );
        let requirements = RequirementSet::new()
            .with(ExtensionLayer::Compression, Dimension::required())
            .with(ExtensionLayer::Compression, Dimension::ability(Ability::new(2, 0)));

        let chain = negotiator.negotiate(&target, &requirements).await.unwrap();
        let hop = chain.hop(ExtensionLayer::Compression).unwrap();
        assert_eq!(hop.ability(), Ability::new(2, 0));
    }

    #[tokio::test]
    async fn test_missing_transport() {
        let (negotiator, target) = setup(
            vec![identity(ExtensionLayer::Compression, Ability::new(1, 0))],
            &[PluginCapability::new(ExtensionLayer::Compression, Ability::new(1, 0))],
        );
        let err = negotiator
            .negotiate(&target, &RequirementSet::new())
            .await
            .unwrap_err();
        let PlexusError::Negotiation(failure) = err else {
            panic!("expected negotiation failure");
        };
        assert_eq!(failure.reason, FailureReason::NoTransport);
    }

    #[tokio::test]
    async fn test_accept_rebuilds_incoming_chain() {
        let (negotiator, _) = setup(
            vec![
                identity(ExtensionLayer::Transport, TRANSPORT),
                identity(ExtensionLayer::Compression, Ability::new(1, 0)),
            ],
            &[],
        );
        let descriptor = SessionDescriptor {
            id: Uuid::new_v4(),
            source: SystemId::new("caller"),
            hops: vec![
                HopDescriptor {
                    extension: ExtensionLayer::Compression,
                    ability: Ability::new(1, 0),
                    remote: Some(serde_json::json!({"dictionary": 3})),
                },
                HopDescriptor {
                    extension: ExtensionLayer::Transport,
                    ability: TRANSPORT,
                    remote: None,
                },
            ],
        };

        let chain = negotiator
            .accept(&descriptor, &RequirementSet::new())
            .await
            .unwrap();
        assert!(chain.is_incoming());
        assert_eq!(chain.id(), descriptor.id);
        assert_eq!(chain.target().as_str(), "caller");
        assert_eq!(chain.remote(), Some(&serde_json::json!({"dictionary": 3})));

        let mut unknown = descriptor.clone();
        unknown.hops[0].ability = Ability::new(9, 9);
        let err = negotiator
            .accept(&unknown, &RequirementSet::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PlexusError::Negotiation(NegotiationFailure {
                reason: FailureReason::UnknownPlugin,
                ..
            })
        ));

        let mut reversed = descriptor;
        reversed.hops.reverse();
        assert!(matches!(
            negotiator.accept(&reversed, &RequirementSet::new()).await,
            Err(PlexusError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_enforces_required_ability() {
        let (negotiator, _) = setup(
            vec![
                identity(ExtensionLayer::Transport, TRANSPORT),
                identity(ExtensionLayer::Encryption, Ability::new(1, 0)),
                identity(ExtensionLayer::Encryption, Ability::new(2, 0)),
            ],
            &[],
        );
        let offering = |ability| SessionDescriptor {
            id: Uuid::new_v4(),
            source: SystemId::new("caller"),
            hops: vec![
                HopDescriptor {
                    extension: ExtensionLayer::Encryption,
                    ability,
                    remote: None,
                },
                HopDescriptor {
                    extension: ExtensionLayer::Transport,
                    ability: TRANSPORT,
                    remote: None,
                },
            ],
        };
        let requirements = RequirementSet::new()
            .with(ExtensionLayer::Encryption, Dimension::required())
            .with(ExtensionLayer::Encryption, Dimension::ability(Ability::new(2, 0)));

        let err = negotiator
            .accept(&offering(Ability::new(1, 0)), &requirements)
            .await
            .unwrap_err();
        let PlexusError::Negotiation(failure) = err else {
            panic!("expected negotiation failure");
        };
        assert_eq!(failure.layer, ExtensionLayer::Encryption);
        assert_eq!(failure.reason, FailureReason::NoAcceptingPlugin);
        assert_eq!(failure.attempted, vec![Ability::new(1, 0)]);

        let chain = negotiator
            .accept(&offering(Ability::new(2, 0)), &requirements)
            .await
            .unwrap();
        assert_eq!(
            chain.hop(ExtensionLayer::Encryption).unwrap().ability(),
            Ability::new(2, 0)
        );
    }
}
