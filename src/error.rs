//! Plexus error types.
//!
//! Errors fall into four families that callers treat differently:
//!
//! - **Configuration**: a plugin was used before `start()` or before a
//!   manager was attached. Fatal and never retryable.
//! - **Negotiation**: no stack satisfies the requirements. Reported once, as
//!   a structured [`NegotiationFailure`], with nothing opened.
//! - **Connector open**: I/O or protocol errors while opening or wrapping a
//!   connector. Everything already opened has been released.
//! - **Multiplexer**: the shared physical link failed or was closed. Callers
//!   may retry on a fresh physical connection.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{Ability, ExtensionLayer, SystemId};

/// Plexus errors.
#[derive(Error, Debug)]
pub enum PlexusError {
    /// Plugin used while stopped or before manager attachment.
    #[error("Plugin not configured: {0}")]
    Unconfigured(String),

    /// A `Dimension` was constructed in violation of its invariants.
    #[error("Invalid dimension: {0}")]
    InvalidDimension(String),

    /// Stack negotiation failed.
    #[error("Negotiation failed: {0}")]
    Negotiation(NegotiationFailure),

    /// Protocol-level error (malformed frame, descriptor, or handshake).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The multiplexer is closed or its physical stream failed.
    #[error("Multiplexer closed: {0}")]
    MultiplexerClosed(String),

    /// The peer refused to open a virtual channel.
    #[error("Channel {0} rejected by peer")]
    OpenRejected(u32),

    /// No acknowledgement arrived for a channel open in time.
    #[error("Channel open timed out after {0:?}")]
    OpenTimeout(Duration),

    /// Packet payload exceeds the connector's maximum packet length.
    #[error("Packet of {len} bytes exceeds maximum of {max}")]
    PacketTooLarge {
        /// Payload length.
        len: usize,
        /// Maximum allowed payload length.
        max: usize,
    },

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlexusError {
    /// Whether the operation may succeed if retried on a fresh connection.
    ///
    /// Configuration and negotiation failures are deterministic for a given
    /// set of installed plugins and are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MultiplexerClosed(_) | Self::OpenTimeout(_) | Self::Io(_)
        )
    }
}

/// Result type alias for Plexus operations
pub type Result<T> = std::result::Result<T, PlexusError>;

impl From<NegotiationFailure> for PlexusError {
    fn from(failure: NegotiationFailure) -> Self {
        PlexusError::Negotiation(failure)
    }
}

impl From<toml::de::Error> for PlexusError {
    fn from(err: toml::de::Error) -> Self {
        PlexusError::Config(err.to_string())
    }
}

impl From<PlexusError> for std::io::Error {
    fn from(err: PlexusError) -> Self {
        match err {
            PlexusError::Io(e) => e,
            PlexusError::MultiplexerClosed(msg) => {
                std::io::Error::new(std::io::ErrorKind::ConnectionAborted, msg)
            },
            other => std::io::Error::other(other.to_string()),
        }
    }
}

/// Why a layer could not be negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The target advertises no capability for a mandatory layer.
    NotAdvertised,
    /// No local plugin accepted a mandatory layer.
    NoAcceptingPlugin,
    /// An incoming descriptor names a plugin that is not installed locally.
    UnknownPlugin,
    /// The finished chain has no transport hop.
    NoTransport,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotAdvertised => "target advertises no capability",
            Self::NoAcceptingPlugin => "no plugin accepted",
            Self::UnknownPlugin => "plugin not installed",
            Self::NoTransport => "no transport selected",
        };
        f.write_str(text)
    }
}

/// Structured negotiation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationFailure {
    /// Layer that could not be satisfied.
    pub layer: ExtensionLayer,
    /// Target (outgoing) or source (incoming) system.
    pub target: SystemId,
    /// Abilities of the plugins whose `prepare` was invoked, in order.
    pub attempted: Vec<Ability>,
    /// Failure cause.
    pub reason: FailureReason,
}

impl fmt::Display for NegotiationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} layer for {}: {}",
            self.layer, self.target, self.reason
        )?;
        if !self.attempted.is_empty() {
            let tried: Vec<String> = self.attempted.iter().map(ToString::to_string).collect();
            write!(f, " (tried {})", tried.join(", "))?;
        }
        Ok(())
    }
}
