//! Datagram groups.
//!
//! A group is a shared numeric channel for fire-and-forget payloads. Each
//! local [`PacketConnector`] is one member of its group; a received packet is
//! handed to the listeners of every local member.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use super::Shared;
use crate::error::{PlexusError, Result};
use crate::protocol::PluginKey;

/// One datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Group the packet belongs to
    pub group: u32,
    /// Payload bytes
    pub payload: Bytes,
}

/// Callback for received packets.
pub trait PacketListener: Send + Sync {
    /// Called on the multiplexer's reader task; must not block.
    fn on_packet(&self, packet: &Packet);
}

impl<F> PacketListener for F
where
    F: Fn(&Packet) + Send + Sync,
{
    fn on_packet(&self, packet: &Packet) {
        self(packet);
    }
}

/// Packet-oriented connector: one member of a datagram group.
pub struct PacketConnector {
    shared: Arc<Shared>,
    group: u32,
    member: u64,
    owner: PluginKey,
}

impl PacketConnector {
    pub(crate) fn new(shared: Arc<Shared>, group: u32, member: u64, owner: PluginKey) -> Self {
        Self {
            shared,
            group,
            member,
            owner,
        }
    }

    /// Group id
    pub fn group(&self) -> u32 {
        self.group
    }

    /// Largest payload accepted by [`create_packet`](Self::create_packet)
    pub fn max_packet_length(&self) -> usize {
        self.shared.config.max_packet_length as usize
    }

    /// Plugin that owns the connector
    pub fn owner(&self) -> PluginKey {
        self.owner
    }

    /// Build a packet for this group.
    pub fn create_packet(&self, payload: impl Into<Bytes>) -> Result<Packet> {
        let payload = payload.into();
        let max = self.max_packet_length();
        if payload.len() > max {
            return Err(PlexusError::PacketTooLarge {
                len: payload.len(),
                max,
            });
        }
        Ok(Packet {
            group: self.group,
            payload,
        })
    }

    /// Send a packet without waiting for delivery.
    pub fn send_packet(&self, packet: &Packet) -> Result<()> {
        if packet.group != self.group {
            return Err(PlexusError::Protocol(format!(
                "packet for group {} sent on group {}",
                packet.group, self.group
            )));
        }
        let max = self.max_packet_length();
        if packet.payload.len() > max {
            return Err(PlexusError::PacketTooLarge {
                len: packet.payload.len(),
                max,
            });
        }
        self.shared.send_packet(packet)
    }

    /// Register a listener for packets received on this group.
    pub fn add_packet_listener(&self, listener: impl PacketListener + 'static) {
        self.shared
            .add_listener(self.group, self.member, Arc::new(listener));
    }

    /// Leave the group.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for PacketConnector {
    fn drop(&mut self) {
        self.shared.leave_group(self.group, self.member);
    }
}

impl fmt::Debug for PacketConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketConnector")
            .field("group", &self.group)
            .field("member", &self.member)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
