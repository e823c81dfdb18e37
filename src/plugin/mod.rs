//! Plugin SPI and plugin manager.
//!
//! Every layer plugin (transport, routing, modifiers, serialization,
//! invocation semantics) implements the single [`Plugin`] trait. Layer
//! specific behavior lives behind `prepare` and `open`.
//!
//! # Lifecycle
//!
//! ```text
//!   install ──> attach(handle) ──> start() ──> prepare/open ... ──> stop()
//! ```
//!
//! `open` must fail fast with [`PlexusError::Unconfigured`] while a plugin is
//! stopped or before a manager handle was attached. [`Lifecycle`] is the
//! state guard plugins embed for this.

mod identity;

pub use identity::IdentityModifier;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connector::StreamConnector;
use crate::error::{PlexusError, Result};
use crate::protocol::{ExtensionLayer, PluginCapability, PluginKey, Session, SystemId};
use crate::requirement::RequirementSet;

/// A layer plugin.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Capability advertised by this instance. Stable for its lifetime.
    fn capability(&self) -> PluginCapability;

    /// Attach the manager handle. Called once, at installation.
    fn attach(&self, manager: ManagerHandle);

    /// Start the plugin.
    fn start(&self) -> Result<()>;

    /// Stop the plugin.
    fn stop(&self) -> Result<()>;

    /// Negotiation hook.
    ///
    /// Returns true iff the plugin can and will participate in this hop. On
    /// true it has written any negotiated state into `session`; on false it
    /// must leave `session` untouched. For incoming sessions `session.remote()`
    /// holds the state the initiator produced for this hop.
    async fn prepare(
        &self,
        remote: &PluginCapability,
        requirements: &RequirementSet,
        session: &mut Session,
    ) -> bool;

    /// Open this hop.
    ///
    /// Transport plugins receive `None` and produce the raw connector; every
    /// other layer wraps `inner`.
    async fn open(
        &self,
        session: &Session,
        inner: Option<StreamConnector>,
    ) -> Result<StreamConnector>;

    /// Matching key
    fn key(&self) -> PluginKey {
        self.capability().key()
    }
}

/// Handle given to plugins at installation.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    local: SystemId,
    incoming: mpsc::UnboundedSender<StreamConnector>,
}

impl ManagerHandle {
    /// Local system id
    pub fn local(&self) -> &SystemId {
        &self.local
    }

    /// Hand a raw connector opened by a peer to the stack for negotiation.
    pub fn deliver(&self, connector: StreamConnector) -> Result<()> {
        self.incoming.send(connector).map_err(|_| {
            PlexusError::Unconfigured("stack is not accepting incoming sessions".to_string())
        })
    }
}

/// Started/attached state guard for plugin implementations.
#[derive(Debug, Default)]
pub struct Lifecycle {
    started: AtomicBool,
    manager: OnceLock<ManagerHandle>,
}

impl Lifecycle {
    /// Create a stopped, unattached lifecycle
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the manager handle. Later attachments are ignored.
    pub fn attach(&self, manager: ManagerHandle) {
        if self.manager.set(manager).is_err() {
            tracing::debug!("plugin already attached to a manager");
        }
    }

    /// Mark started. Fails if no manager has been attached.
    pub fn start(&self) -> Result<()> {
        if self.manager.get().is_none() {
            return Err(PlexusError::Unconfigured(
                "cannot start a plugin without a manager".to_string(),
            ));
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Mark stopped.
    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    /// Whether the plugin is started
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Manager handle, if the plugin is started and attached.
    pub fn manager(&self) -> Result<&ManagerHandle> {
        let manager = self.manager.get().ok_or_else(|| {
            PlexusError::Unconfigured("plugin has no manager attached".to_string())
        })?;
        if !self.is_started() {
            return Err(PlexusError::Unconfigured("plugin is stopped".to_string()));
        }
        Ok(manager)
    }
}

/// Installed plugins, per layer, in installation order.
pub struct PluginManager {
    handle: ManagerHandle,
    plugins: RwLock<HashMap<ExtensionLayer, Vec<Arc<dyn Plugin>>>>,
}

impl PluginManager {
    /// Create a manager and the receiver of connectors delivered by plugins.
    pub fn new(local: SystemId) -> (Self, mpsc::UnboundedReceiver<StreamConnector>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            handle: ManagerHandle {
                local,
                incoming: tx,
            },
            plugins: RwLock::new(HashMap::new()),
        };
        (manager, rx)
    }

    /// Local system id
    pub fn local(&self) -> &SystemId {
        &self.handle.local
    }

    /// Handle given to installed plugins
    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    /// Install a plugin after those already installed for its layer.
    ///
    /// Two plugins with the same layer and ability cannot be installed.
    pub fn install(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let key = plugin.key();
        {
            let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
            let layer = plugins.entry(key.extension).or_default();
            if layer.iter().any(|p| p.key() == key) {
                return Err(PlexusError::Config(format!(
                    "plugin {key} is already installed"
                )));
            }
            layer.push(plugin.clone());
        }
        plugin.attach(self.handle());
        tracing::debug!("installed plugin {}", key);
        Ok(())
    }

    /// Plugins for a layer, in installation order
    pub fn plugins(&self, layer: ExtensionLayer) -> Vec<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&layer)
            .cloned()
            .unwrap_or_default()
    }

    /// Plugin with an exact key
    pub fn plugin(&self, key: PluginKey) -> Option<Arc<dyn Plugin>> {
        self.plugins(key.extension)
            .into_iter()
            .find(|p| p.key() == key)
    }

    /// Every installed plugin, outermost layer first
    pub fn all(&self) -> Vec<Arc<dyn Plugin>> {
        ExtensionLayer::NEGOTIATION_ORDER
            .iter()
            .flat_map(|layer| self.plugins(*layer))
            .collect()
    }

    /// Start every plugin; stops on the first failure.
    pub fn start_all(&self) -> Result<()> {
        for plugin in self.all() {
            plugin.start()?;
        }
        Ok(())
    }

    /// Stop every plugin, innermost layer first. Returns the first failure.
    pub fn stop_all(&self) -> Result<()> {
        let mut first_error = None;
        for plugin in self.all().into_iter().rev() {
            if let Err(e) = plugin.stop() {
                tracing::warn!("failed to stop plugin {}: {}", plugin.key(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Capabilities of every installed plugin
    pub fn capabilities(&self) -> Vec<PluginCapability> {
        self.all().iter().map(|p| p.capability()).collect()
    }
}
