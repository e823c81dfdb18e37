//! Middleware stack facade.
//!
//! A [`Stack`] owns the installed plugins, the negotiator and the connector
//! pipeline for one local system. Outgoing calls go through
//! [`Stack::connect`]; incoming raw connectors delivered by transport
//! plugins are negotiated on a bounded set of tasks and handed to an
//! [`InvocationHandler`].

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::config::{Config, NegotiationConfig};
use crate::connector::StreamConnector;
use crate::error::{PlexusError, Result};
use crate::plugin::{Plugin, PluginManager};
use crate::protocol::{
    read_descriptor, write_verdict, CapabilitySource, ConnectorPipeline, PluginCapability,
    Session, SessionVerdict, StackNegotiator, SystemId,
};
use crate::requirement::RequirementSet;

/// Receives finished incoming connectors.
///
/// This is where invocation dispatch (RPC semantics over the connector)
/// plugs in.
#[async_trait]
pub trait InvocationHandler: Send + Sync {
    /// Serve one incoming call. The connector is released when dropped.
    async fn handle(&self, session: Session, connector: StreamConnector);
}

/// One local system's middleware stack.
pub struct Stack {
    manager: Arc<PluginManager>,
    negotiator: Arc<StackNegotiator>,
    pipeline: Arc<ConnectorPipeline>,
    incoming_requirements: Arc<RequirementSet>,
    config: Config,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<StreamConnector>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Stack {
    /// Create a stack for `local`.
    ///
    /// Fails with [`PlexusError::Config`] when `config` does not validate.
    pub fn new(
        local: SystemId,
        capabilities: Arc<dyn CapabilitySource>,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        let (manager, incoming) = PluginManager::new(local);
        let manager = Arc::new(manager);
        let pipeline = ConnectorPipeline::new(manager.clone())
            .with_handshake_timeout(config.negotiation.handshake_timeout());
        Ok(Self {
            negotiator: Arc::new(StackNegotiator::new(manager.clone(), capabilities)),
            pipeline: Arc::new(pipeline),
            manager,
            incoming_requirements: Arc::new(RequirementSet::new()),
            config,
            incoming: Mutex::new(Some(incoming)),
            accept_task: Mutex::new(None),
        })
    }

    /// Local system id
    pub fn local(&self) -> &SystemId {
        self.manager.local()
    }

    /// Installed plugins
    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    /// Effective configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Requirements applied to incoming sessions. Mutable in place.
    pub fn incoming_requirements(&self) -> &RequirementSet {
        &self.incoming_requirements
    }

    /// Install a plugin.
    pub fn install(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        self.manager.install(plugin)
    }

    /// Start every plugin and begin accepting incoming sessions.
    ///
    /// Must be called from within a tokio runtime, at most once.
    pub fn start(&self, handler: Arc<dyn InvocationHandler>) -> Result<()> {
        let incoming = self
            .incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| PlexusError::Config("stack was already started".to_string()))?;

        self.manager.start_all()?;

        let acceptor = Acceptor {
            negotiator: self.negotiator.clone(),
            pipeline: self.pipeline.clone(),
            requirements: self.incoming_requirements.clone(),
            config: self.config.negotiation.clone(),
            handler,
        };
        let task = tokio::spawn(acceptor.run(incoming));
        *self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        tracing::info!("stack {} started", self.local());
        Ok(())
    }

    /// Stop accepting and stop every plugin.
    pub fn stop(&self) -> Result<()> {
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.manager.stop_all()?;
        tracing::info!("stack {} stopped", self.local());
        Ok(())
    }

    /// Negotiate and open a connector to `target`.
    ///
    /// Returns a usable connector or a single terminal error; on error
    /// nothing remains open.
    pub async fn connect(
        &self,
        target: &SystemId,
        requirements: &RequirementSet,
    ) -> Result<StreamConnector> {
        let session = self.negotiator.negotiate(target, requirements).await?;
        self.pipeline.open(&session).await
    }

    /// Capabilities to publish for this system, without local-only
    /// properties.
    pub fn advertised_capabilities(&self) -> Vec<PluginCapability> {
        self.manager
            .capabilities()
            .iter()
            .map(PluginCapability::remote_view)
            .collect()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Some(task) = self
            .accept_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

struct Acceptor {
    negotiator: Arc<StackNegotiator>,
    pipeline: Arc<ConnectorPipeline>,
    requirements: Arc<RequirementSet>,
    config: NegotiationConfig,
    handler: Arc<dyn InvocationHandler>,
}

impl Acceptor {
    async fn run(self, mut incoming: mpsc::UnboundedReceiver<StreamConnector>) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_accepts));
        let this = Arc::new(self);
        while let Some(raw) = incoming.recv().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let this = this.clone();
            tokio::spawn(async move {
                if let Err(e) = this.accept(raw, permit).await {
                    tracing::warn!("incoming session rejected: {}", e);
                }
            });
        }
    }

    /// Negotiate one incoming call, answer the initiator, then dispatch.
    ///
    /// The permit bounds negotiation only and is returned before the
    /// handler runs.
    async fn accept(&self, mut raw: StreamConnector, permit: OwnedSemaphorePermit) -> Result<()> {
        let negotiated = self.negotiate(&mut raw).await;
        let verdict = match &negotiated {
            Ok(_) => SessionVerdict::Accepted,
            Err(PlexusError::Negotiation(failure)) => SessionVerdict::Rejected {
                failure: failure.clone(),
            },
            Err(e) => SessionVerdict::Refused {
                reason: e.to_string(),
            },
        };
        let answered = write_verdict(&mut raw, &verdict).await;
        let session = negotiated?;
        answered?;

        let connector = self.pipeline.open_incoming(&session, raw).await?;
        drop(permit);
        tracing::debug!(call = %session.id(), source = %session.target(), "dispatching incoming call");
        self.handler.handle(session, connector).await;
        Ok(())
    }

    async fn negotiate(&self, raw: &mut StreamConnector) -> Result<Session> {
        let descriptor = tokio::time::timeout(
            self.config.handshake_timeout(),
            read_descriptor(raw, self.config.max_descriptor_len),
        )
        .await
        .map_err(|_| {
            PlexusError::Protocol("timed out waiting for session descriptor".to_string())
        })??;
        self.negotiator.accept(&descriptor, &self.requirements).await
    }
}
