//! # Plexus - Requirement-Driven Pluggable Middleware
//!
//! Runtime for distributed invocation between heterogeneous, often
//! resource-constrained devices. Callers state non-functional requirements
//! (reliability, encryption, compression, synchrony, gateway use) and the
//! runtime assembles, per target and per call, a chain of plugins that
//! jointly satisfies them.
//!
//! ## Features
//!
//! - **Requirement model**: typed, ordered or unordered dimensions with hard
//!   and soft values, grouped by extension layer
//! - **Stack negotiation**: first-fit plugin selection per layer, outermost
//!   layer first, with structured failures
//! - **Connector pipeline**: bottom-up opening with a release cascade
//! - **Multiplexing**: many virtual stream and datagram channels over one
//!   physical link, with per-channel flow control
//!
//! ### Architecture
//!
//! ```text
//!  RequirementSet ──> StackNegotiator ──> Session chain ──> ConnectorPipeline
//!                          │                                      │
//!                   PluginCapability[]                   transport open()
//!                   (CapabilitySource)                            │
//!                                                         MuxTransport cache
//!                                                                 │
//!                                                           Multiplexer
//!                                                                 │
//!                                                        physical stream
//! ```
//!
//! ### Extension Layers
//!
//! | Layer           | Typical plugins                    |
//! |-----------------|------------------------------------|
//! | `semantics`     | synchronous call, one-way message  |
//! | `serialization` | object codec                       |
//! | `compression`   | stream compressor                  |
//! | `encryption`    | stream cipher                      |
//! | `routing`       | direct, gateway                    |
//! | `transport`     | multiplexed TCP, Bluetooth, serial |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use plexus::{Config, Dimension, ExtensionLayer, RequirementSet, Stack, StaticCapabilities};
//!
//! let registry = Arc::new(StaticCapabilities::new());
//! let stack = Stack::new("phone".into(), registry.clone(), Config::default())?;
//! stack.install(transport)?;
//! stack.start(handler)?;
//!
//! let requirements = RequirementSet::new()
//!     .with(ExtensionLayer::Encryption, Dimension::required());
//! let connector = stack.connect(&"watch".into(), &requirements).await?;
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod mux;
pub mod plugin;
pub mod protocol;
pub mod requirement;
pub mod stack;
pub mod transport;

// Re-exports for convenience
pub use config::Config;
pub use connector::{Connector, StreamConnector};
pub use error::{FailureReason, NegotiationFailure, PlexusError, Result};
pub use mux::{Multiplexer, MultiplexerOwner, Packet, PacketConnector, PacketListener};
pub use plugin::{IdentityModifier, Lifecycle, ManagerHandle, Plugin, PluginManager};
pub use protocol::{
    Ability, CapabilitySource, ConnectorPipeline, Direction, ExtensionLayer, PluginCapability,
    PluginKey, Session, StackNegotiator, StaticCapabilities, SystemId,
};
pub use requirement::{Dimension, DimensionValue, Orientation, RequirementSet};
pub use stack::{InvocationHandler, Stack};
pub use transport::{Dialer, MemoryNetwork, MuxTransport, TcpDialer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
