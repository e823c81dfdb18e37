//! Pass-through layer plugin.

use async_trait::async_trait;

use super::{Lifecycle, ManagerHandle, Plugin};
use crate::connector::StreamConnector;
use crate::error::{PlexusError, Result};
use crate::protocol::{Ability, ExtensionLayer, PluginCapability, Session};
use crate::requirement::{ids, DimensionValue, RequirementSet};

/// Level offered by the identity transform.
const IDENTITY_LEVEL: i64 = 0;

/// Plugin that joins a layer without transforming the stream.
///
/// Offers `level` 0 and accepts a hop iff the layer's `level` dimension, if
/// present, accepts 0. Useful when both peers agree on "no compression" or
/// "no encryption" for a layer the requirements mark mandatory.
pub struct IdentityModifier {
    capability: PluginCapability,
    lifecycle: Lifecycle,
}

impl IdentityModifier {
    /// Create an identity plugin for `layer`.
    pub fn new(layer: ExtensionLayer, ability: Ability) -> Self {
        Self {
            capability: PluginCapability::new(layer, ability)
                .with_property(ids::LEVEL, IDENTITY_LEVEL),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Whether the plugin is started
    pub fn is_started(&self) -> bool {
        self.lifecycle.is_started()
    }
}

#[async_trait]
impl Plugin for IdentityModifier {
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
        requirements: &RequirementSet,
        _session: &mut Session,
    ) -> bool {
        requirements
            .dimension(self.capability.extension(), ids::LEVEL)
            .map_or(true, |level| level.accepts(&DimensionValue::Int(IDENTITY_LEVEL)))
    }

    async fn open(
        &self,
        session: &Session,
        inner: Option<StreamConnector>,
    ) -> Result<StreamConnector> {
        self.lifecycle.manager()?;
        let inner = inner.ok_or_else(|| {
            PlexusError::Protocol(format!(
                "{} hop has no inner connector",
                session.extension()
            ))
        })?;
        inner.wrap(self.capability.key(), |reader, writer| Ok((reader, writer)))
    }
}
