//! Plugin capabilities exchanged with remote peers.
//!
//! Every running plugin advertises one [`PluginCapability`]: the extension
//! layer it implements, its numeric ability, and a set of named properties.
//! Peers only ever see the remote-advertised properties.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// A pluggable role in the communication stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionLayer {
    /// Invocation semantics (synchronous, one-way, ...)
    Semantics,
    /// Object serialization
    Serialization,
    /// Compression modifier
    Compression,
    /// Encryption modifier
    Encryption,
    /// Routing (direct, gateway)
    Routing,
    /// Physical or virtual transport
    Transport,
}

impl ExtensionLayer {
    /// Negotiation order: outermost (application-facing) first.
    pub const NEGOTIATION_ORDER: [ExtensionLayer; 6] = [
        Self::Semantics,
        Self::Serialization,
        Self::Compression,
        Self::Encryption,
        Self::Routing,
        Self::Transport,
    ];

    /// Get the lowercase layer name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Semantics => "semantics",
            Self::Serialization => "serialization",
            Self::Compression => "compression",
            Self::Encryption => "encryption",
            Self::Routing => "routing",
            Self::Transport => "transport",
        }
    }

    /// Whether the layer transforms the byte stream of an inner connector.
    pub fn is_modifier(&self) -> bool {
        matches!(self, Self::Compression | Self::Encryption)
    }
}

impl fmt::Display for ExtensionLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ExtensionLayer {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::NEGOTIATION_ORDER
            .iter()
            .copied()
            .find(|layer| layer.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown extension layer: {s}"))
    }
}

/// 16-bit capability code: vendor in the high byte, version in the low byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ability(u16);

impl Ability {
    /// Create from vendor and version bytes
    pub const fn new(vendor: u8, version: u8) -> Self {
        Self(((vendor as u16) << 8) | version as u16)
    }

    /// Create from the raw 16-bit code
    pub const fn from_code(code: u16) -> Self {
        Self(code)
    }

    /// Raw 16-bit code
    pub const fn code(&self) -> u16 {
        self.0
    }

    /// Vendor byte
    pub const fn vendor(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Version byte
    pub const fn version(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

impl fmt::Display for Ability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Identity of a local or remote system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemId(String);

impl SystemId {
    /// Create a system id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SystemId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Matching key of a plugin: its layer and ability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PluginKey {
    /// Extension layer
    pub extension: ExtensionLayer,
    /// Ability code
    pub ability: Ability,
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.extension, self.ability)
    }
}

/// A named capability property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Property value
    pub value: serde_json::Value,
    /// Whether the property is advertised to remote peers
    #[serde(skip, default = "advertised_default")]
    pub advertised: bool,
}

fn advertised_default() -> bool {
    true
}

/// What a plugin instance implements.
///
/// Identity is by `(extension, ability)`; properties are descriptive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginCapability {
    ability: Ability,
    extension: ExtensionLayer,
    #[serde(default)]
    properties: BTreeMap<String, Property>,
}

impl PluginCapability {
    /// Create a capability with no properties
    pub fn new(extension: ExtensionLayer, ability: Ability) -> Self {
        Self {
            ability,
            extension,
            properties: BTreeMap::new(),
        }
    }

    /// Add a remote-advertised property
    pub fn with_property(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(
            name.to_string(),
            Property {
                value: value.into(),
                advertised: true,
            },
        );
        self
    }

    /// Add a local-only property
    pub fn with_local_property(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(
            name.to_string(),
            Property {
                value: value.into(),
                advertised: false,
            },
        );
        self
    }

    /// Ability code
    pub fn ability(&self) -> Ability {
        self.ability
    }

    /// Extension layer
    pub fn extension(&self) -> ExtensionLayer {
        self.extension
    }

    /// Matching key
    pub fn key(&self) -> PluginKey {
        PluginKey {
            extension: self.extension,
            ability: self.ability,
        }
    }

    /// Look up a property value
    pub fn property(&self, name: &str) -> Option<&serde_json::Value> {
        self.properties.get(name).map(|p| &p.value)
    }

    /// Iterate over all properties
    pub fn properties(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy carrying only remote-advertised properties.
    pub fn remote_view(&self) -> Self {
        Self {
            ability: self.ability,
            extension: self.extension,
            properties: self
                .properties
                .iter()
                .filter(|(_, p)| p.advertised)
                .map(|(k, p)| (k.clone(), p.clone()))
                .collect(),
        }
    }
}

impl PartialEq for PluginCapability {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for PluginCapability {}

impl Hash for PluginCapability {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// Supplies the capabilities a target system advertises.
///
/// Backed by a device/service registry in a full deployment.
pub trait CapabilitySource: Send + Sync {
    /// Advertised capabilities of `target`; empty if unknown.
    fn capabilities(&self, target: &SystemId) -> Vec<PluginCapability>;
}

/// In-memory capability registry.
#[derive(Debug, Default)]
pub struct StaticCapabilities {
    systems: RwLock<HashMap<SystemId, Vec<PluginCapability>>>,
}

impl StaticCapabilities {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record what `target` advertises, replacing earlier entries.
    ///
    /// Only remote-advertised properties are stored.
    pub fn advertise(&self, target: SystemId, capabilities: &[PluginCapability]) {
        let caps = capabilities.iter().map(PluginCapability::remote_view).collect();
        self.systems
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target, caps);
    }

    /// Forget a target
    pub fn withdraw(&self, target: &SystemId) {
        self.systems
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(target);
    }
}

impl CapabilitySource for StaticCapabilities {
    fn capabilities(&self, target: &SystemId) -> Vec<PluginCapability> {
        self.systems
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .cloned()
            .unwrap_or_default()
    }
}
