//! Per-hop negotiated session state.
//!
//! A session chain has one node per negotiated layer, linked from the
//! outermost (application-facing) hop to the innermost transport hop. The
//! chain is created fresh for every negotiation attempt, owned by the call
//! that created it, and dropped once the connector pipeline has consumed it.

use std::any::Any;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use super::capability::{Ability, ExtensionLayer, PluginKey, SystemId};
use crate::error::{NegotiationFailure, PlexusError, Result};

/// Which side created the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Built by the initiating side's negotiator
    Outgoing,
    /// Rebuilt from a peer's session descriptor
    Incoming,
}

/// One hop of a negotiated session chain.
pub struct Session {
    id: Uuid,
    target: SystemId,
    extension: ExtensionLayer,
    ability: Ability,
    direction: Direction,
    local: Option<Box<dyn Any + Send + Sync>>,
    remote: Option<serde_json::Value>,
    child: Option<Box<Session>>,
}

impl Session {
    /// Create an unlinked session node.
    pub fn new(
        id: Uuid,
        target: SystemId,
        key: PluginKey,
        direction: Direction,
    ) -> Self {
        Self {
            id,
            target,
            extension: key.extension,
            ability: key.ability,
            direction,
            local: None,
            remote: None,
            child: None,
        }
    }

    /// Call id shared by every node of the chain
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remote system (target when outgoing, source when incoming)
    pub fn target(&self) -> &SystemId {
        &self.target
    }

    /// Layer of this hop
    pub fn extension(&self) -> ExtensionLayer {
        self.extension
    }

    /// Ability of the plugin chosen for this hop
    pub fn ability(&self) -> Ability {
        self.ability
    }

    /// Key of the plugin chosen for this hop
    pub fn key(&self) -> PluginKey {
        PluginKey {
            extension: self.extension,
            ability: self.ability,
        }
    }

    /// Direction flag
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether this chain was rebuilt from a peer's descriptor
    pub fn is_incoming(&self) -> bool {
        self.direction == Direction::Incoming
    }

    /// Store state for the same side's `open`.
    pub fn set_local<T: Any + Send + Sync>(&mut self, value: T) {
        self.local = Some(Box::new(value));
    }

    /// Local state, if present and of type `T`.
    pub fn local<T: Any>(&self) -> Option<&T> {
        self.local.as_ref()?.downcast_ref::<T>()
    }

    /// Store state for the peer's corresponding hop.
    pub fn set_remote(&mut self, value: serde_json::Value) {
        self.remote = Some(value);
    }

    /// State exchanged with the peer's corresponding hop.
    pub fn remote(&self) -> Option<&serde_json::Value> {
        self.remote.as_ref()
    }

    /// Next inward hop
    pub fn child(&self) -> Option<&Session> {
        self.child.as_deref()
    }

    /// Iterate from this hop inward.
    pub fn iter(&self) -> Hops<'_> {
        Hops { next: Some(self) }
    }

    /// Number of hops from this node inward
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Always false; a chain has at least one hop.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Find the hop for a layer.
    pub fn hop(&self, layer: ExtensionLayer) -> Option<&Session> {
        self.iter().find(|hop| hop.extension == layer)
    }

    /// Link nodes given outermost-first into a chain.
    pub(crate) fn link(nodes: Vec<Session>) -> Option<Session> {
        nodes.into_iter().rev().fold(None, |child, mut node| {
            node.child = child.map(Box::new);
            Some(node)
        })
    }

    /// Describe the chain for the peer.
    pub fn descriptor(&self, source: &SystemId) -> SessionDescriptor {
        SessionDescriptor {
            id: self.id,
            source: source.clone(),
            hops: self
                .iter()
                .map(|hop| HopDescriptor {
                    extension: hop.extension,
                    ability: hop.ability,
                    remote: hop.remote.clone(),
                })
                .collect(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("extension", &self.extension)
            .field("ability", &self.ability)
            .field("direction", &self.direction)
            .field("has_local", &self.local.is_some())
            .field("remote", &self.remote)
            .field("child", &self.child)
            .finish()
    }
}

/// Iterator over a session chain, outermost hop first.
pub struct Hops<'a> {
    next: Option<&'a Session>,
}

impl<'a> Iterator for Hops<'a> {
    type Item = &'a Session;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.child();
        Some(current)
    }
}

/// One hop as sent to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopDescriptor {
    /// Layer
    pub extension: ExtensionLayer,
    /// Ability of the initiator's plugin
    pub ability: Ability,
    /// Initiator's `remote` state for this hop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<serde_json::Value>,
}

impl HopDescriptor {
    /// Matching key
    pub fn key(&self) -> PluginKey {
        PluginKey {
            extension: self.extension,
            ability: self.ability,
        }
    }
}

/// Session chain description written on the raw transport connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Call id
    pub id: Uuid,
    /// Initiating system
    pub source: SystemId,
    /// Hops, outermost first
    pub hops: Vec<HopDescriptor>,
}

/// Acceptor's answer to a session descriptor, written back on the raw
/// connector before any layer wraps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum SessionVerdict {
    /// The incoming chain was rebuilt; layers may wrap the connector.
    Accepted,
    /// Negotiation failed on the accepting side.
    Rejected {
        /// Failure as seen by the acceptor
        failure: NegotiationFailure,
    },
    /// The descriptor could not be read or was malformed.
    Refused {
        /// Acceptor's error text
        reason: String,
    },
}

/// Largest verdict a reader accepts.
pub const MAX_VERDICT_LEN: usize = 4096;

/// Write a length-prefixed descriptor.
pub async fn write_descriptor<W>(writer: &mut W, descriptor: &SessionDescriptor) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_message(writer, descriptor, "session descriptor").await
}

/// Read a length-prefixed descriptor of at most `max_len` bytes.
pub async fn read_descriptor<R>(reader: &mut R, max_len: usize) -> Result<SessionDescriptor>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let descriptor: SessionDescriptor = read_message(reader, max_len, "session descriptor").await?;
    if descriptor.hops.is_empty() {
        return Err(PlexusError::Protocol(
            "session descriptor has no hops".to_string(),
        ));
    }
    Ok(descriptor)
}

/// Write a length-prefixed verdict.
pub async fn write_verdict<W>(writer: &mut W, verdict: &SessionVerdict) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_message(writer, verdict, "session verdict").await
}

/// Read a length-prefixed verdict.
pub async fn read_verdict<R>(reader: &mut R) -> Result<SessionVerdict>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_message(reader, MAX_VERDICT_LEN, "session verdict").await
}

async fn write_message<W, T>(writer: &mut W, message: &T, what: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len())
        .map_err(|_| PlexusError::Protocol(format!("{what} too large")))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_message<R, T>(reader: &mut R, max_len: usize, what: &str) -> Result<T>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > max_len {
        return Err(PlexusError::Protocol(format!(
            "{what} of {len} bytes exceeds limit of {max_len}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: Uuid, layer: ExtensionLayer, ability: Ability) -> Session {
        Session::new(
            id,
            SystemId::new("target"),
            PluginKey {
                extension: layer,
                ability,
            },
            Direction::Outgoing,
        )
    }

    #[test]
    fn test_link_preserves_order() {
        let id = Uuid::new_v4();
        let chain = Session::link(vec![
            node(id, ExtensionLayer::Serialization, Ability::new(1, 0)),
            node(id, ExtensionLayer::Encryption, Ability::new(2, 0)),
            node(id, ExtensionLayer::Transport, Ability::new(3, 0)),
        ])
        .unwrap();

        let layers: Vec<ExtensionLayer> = chain.iter().map(Session::extension).collect();
        assert_eq!(
            layers,
            vec![
                ExtensionLayer::Serialization,
                ExtensionLayer::Encryption,
                ExtensionLayer::Transport
            ]
        );
        assert_eq!(chain.len(), 3);
        assert!(chain.hop(ExtensionLayer::Transport).unwrap().child().is_none());
        assert!(Session::link(Vec::new()).is_none());
    }

    #[test]
    fn test_local_state_downcast() {
        let mut session = node(Uuid::new_v4(), ExtensionLayer::Encryption, Ability::new(2, 0));
        assert!(session.local::<u32>().is_none());

        session.set_local(256u32);
        assert_eq!(session.local::<u32>(), Some(&256));
        assert!(session.local::<String>().is_none());
    }

    #[test]
    fn test_descriptor_carries_remote_state() {
        let id = Uuid::new_v4();
        let mut outer = node(id, ExtensionLayer::Encryption, Ability::new(2, 0));
        outer.set_remote(serde_json::json!({"nonce": 7}));
        let chain = Session::link(vec![
            outer,
            node(id, ExtensionLayer::Transport, Ability::new(3, 0)),
        ])
        .unwrap();

        let descriptor = chain.descriptor(&SystemId::new("me"));
        assert_eq!(descriptor.id, id);
        assert_eq!(descriptor.hops.len(), 2);
        assert_eq!(descriptor.hops[0].remote, Some(serde_json::json!({"nonce": 7})));
        assert!(descriptor.hops[1].remote.is_none());
    }

    #[tokio::test]
    async fn test_descriptor_wire_roundtrip() {
        let descriptor = SessionDescriptor {
            id: Uuid::new_v4(),
            source: SystemId::new("watch"),
            hops: vec![HopDescriptor {
                extension: ExtensionLayer::Transport,
                ability: Ability::new(1, 1),
                remote: None,
            }],
        };

        let mut buf = Vec::new();
        write_descriptor(&mut buf, &descriptor).await.unwrap();
        let decoded = read_descriptor(&mut buf.as_slice(), 1024).await.unwrap();
        assert_eq!(decoded, descriptor);

        let err = read_descriptor(&mut buf.as_slice(), 4).await.unwrap_err();
        assert!(matches!(err, PlexusError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_verdict_carries_failure() {
        let verdict = SessionVerdict::Rejected {
            failure: NegotiationFailure {
                layer: ExtensionLayer::Encryption,
                target: SystemId::new("watch"),
                attempted: vec![Ability::new(2, 0)],
                reason: crate::error::FailureReason::NoAcceptingPlugin,
            },
        };

        let mut buf = Vec::new();
        write_verdict(&mut buf, &SessionVerdict::Accepted).await.unwrap();
        write_verdict(&mut buf, &verdict).await.unwrap();
        let mut wire = buf.as_slice();
        assert_eq!(read_verdict(&mut wire).await.unwrap(), SessionVerdict::Accepted);
        assert_eq!(read_verdict(&mut wire).await.unwrap(), verdict);
        assert!(matches!(
            read_verdict(&mut wire).await,
            Err(PlexusError::Io(_))
        ));
    }
}
