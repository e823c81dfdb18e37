//! Multiplexer frame encoding and decoding.
//!
//! # Wire Format
//!
//! ```text
//! +--------+------------+------------+-----------------+----------+
//! | type:1 | channel:4  | length:4   | payload:length  | crc32:4  |
//! +--------+------------+------------+-----------------+----------+
//! ```
//!
//! All integers are little-endian. The CRC-32 covers header and payload.
//! For `Packet` frames the channel field carries the datagram group.
//!
//! | Type        | Payload                          |
//! |-------------|----------------------------------|
//! | `Open`      | opener's receive window (u32)    |
//! | `OpenAck`   | acceptor's receive window (u32)  |
//! | `OpenReject`| empty                            |
//! | `Data`      | stream bytes                     |
//! | `Window`    | credit grant in bytes (u32)      |
//! | `Close`     | empty                            |
//! | `Packet`    | datagram bytes                   |

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{PlexusError, Result};

/// Header size: type + channel + length
pub const FRAME_HEADER_SIZE: usize = 9;

/// Trailer size: CRC-32
pub const FRAME_TRAILER_SIZE: usize = 4;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Request to open a stream channel
    Open = 0x01,
    /// Stream channel accepted
    OpenAck = 0x02,
    /// Stream channel refused
    OpenReject = 0x03,
    /// Stream bytes
    Data = 0x04,
    /// Flow-control credit
    Window = 0x05,
    /// Stream channel closed
    Close = 0x06,
    /// Datagram for a group
    Packet = 0x07,
}

impl FrameType {
    /// Parse a type tag
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Open),
            0x02 => Some(Self::OpenAck),
            0x03 => Some(Self::OpenReject),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::Window),
            0x06 => Some(Self::Close),
            0x07 => Some(Self::Packet),
            _ => None,
        }
    }
}

/// One multiplexer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub kind: FrameType,
    /// Channel id, or group for packets
    pub channel: u32,
    /// Payload bytes
    pub payload: Bytes,
}

impl Frame {
    fn with_u32(kind: FrameType, channel: u32, value: u32) -> Self {
        Self {
            kind,
            channel,
            payload: Bytes::copy_from_slice(&value.to_le_bytes()),
        }
    }

    fn empty(kind: FrameType, channel: u32) -> Self {
        Self {
            kind,
            channel,
            payload: Bytes::new(),
        }
    }

    /// Open request announcing the opener's receive window
    pub fn open(channel: u32, window: u32) -> Self {
        Self::with_u32(FrameType::Open, channel, window)
    }

    /// Open acknowledgement announcing the acceptor's receive window
    pub fn open_ack(channel: u32, window: u32) -> Self {
        Self::with_u32(FrameType::OpenAck, channel, window)
    }

    /// Open refusal
    pub fn open_reject(channel: u32) -> Self {
        Self::empty(FrameType::OpenReject, channel)
    }

    /// Stream data
    pub fn data(channel: u32, payload: Bytes) -> Self {
        Self {
            kind: FrameType::Data,
            channel,
            payload,
        }
    }

    /// Credit grant
    pub fn window(channel: u32, credit: u32) -> Self {
        Self::with_u32(FrameType::Window, channel, credit)
    }

    /// Channel close
    pub fn close(channel: u32) -> Self {
        Self::empty(FrameType::Close, channel)
    }

    /// Group datagram
    pub fn packet(group: u32, payload: Bytes) -> Self {
        Self {
            kind: FrameType::Packet,
            channel: group,
            payload,
        }
    }

    /// Decode a u32 payload (window sizes and credit grants).
    pub fn u32_payload(&self) -> Result<u32> {
        let bytes: [u8; 4] = self.payload.as_ref().try_into().map_err(|_| {
            PlexusError::Protocol(format!(
                "{:?} frame on channel {} carries {} bytes, expected 4",
                self.kind,
                self.channel,
                self.payload.len()
            ))
        })?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len() + FRAME_TRAILER_SIZE);
        buf.put_u8(self.kind as u8);
        buf.put_u32_le(self.channel);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf.freeze()
    }
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_u8().await {
        Ok(byte) => header[0] = byte,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    reader.read_exact(&mut header[1..]).await?;

    let kind = FrameType::from_byte(header[0]).ok_or_else(|| {
        PlexusError::Protocol(format!("unknown frame type {:#04x}", header[0]))
    })?;
    let channel = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    let len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if len > max_payload {
        return Err(PlexusError::Protocol(format!(
            "frame payload of {len} bytes exceeds limit of {max_payload}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let expected = reader.read_u32_le().await?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(&payload);
    let actual = hasher.finalize();
    if actual != expected {
        return Err(PlexusError::Protocol(format!(
            "frame checksum mismatch on channel {channel}: {actual:#010x} != {expected:#010x}"
        )));
    }

    Ok(Some(Frame {
        kind,
        channel,
        payload: Bytes::from(payload),
    }))
}
