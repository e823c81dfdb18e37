//! Stream multiplexer.
//!
//! Virtualizes many logical connectors over one physical duplex byte stream
//! so a transport plugin can keep one physical link per peer.
//!
//! # Architecture
//!
//! ```text
//!  open_connector() ──┐                         ┌── accept_connector()
//!  ChannelWriter ─────┤  outbound queue          │
//!  PacketConnector ───┘      │                   │
//!                            ▼                   │
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │ write task  │     │ read task   │── ChannelReader
//!                     └──────┬──────┘     └──────▲──────┘
//!                            │  physical stream  │
//!                            └───────────────────┘
//! ```
//!
//! Exactly one task writes the physical stream, so frames never interleave.
//! Exactly one task reads it and dispatches frames to channels.
//!
//! Channel ids come from disjoint ranges: the side constructed with
//! `incoming = false` allocates odd ids, the other side even ids.

mod channel;
mod frame;
mod group;

pub use channel::ChannelState;
pub use frame::{read_frame, Frame, FrameType, FRAME_HEADER_SIZE, FRAME_TRAILER_SIZE};
pub use group::{Packet, PacketConnector, PacketListener};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use uuid::Uuid;

use self::channel::{ChannelParts, ChannelReader, ChannelWriter, Inbound};
use crate::config::MultiplexerConfig;
use crate::connector::{Connector, StreamConnector};
use crate::error::{PlexusError, Result};
use crate::protocol::PluginKey;

/// Plugin that owns a multiplexer.
///
/// Callbacks run on the multiplexer's reader task (or the task that closed
/// it) and must not block.
pub trait MultiplexerOwner: Send + Sync {
    /// Key stamped on connectors produced by the multiplexer
    fn plugin_key(&self) -> PluginKey;

    /// The peer opened a stream channel or sent the first packet of a group.
    fn accept_connector(&self, multiplexer: &Multiplexer, connector: Connector);

    /// The multiplexer closed. Called exactly once.
    fn close_multiplexer(&self, multiplexer: &Multiplexer);
}

/// Handle to a running multiplexer.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    /// Start a multiplexer over `stream`.
    ///
    /// Must be called from within a tokio runtime. `incoming` selects the
    /// channel id range and must differ between the two ends of the link.
    pub fn spawn<S>(
        stream: S,
        incoming: bool,
        owner: &Arc<dyn MultiplexerOwner>,
        config: MultiplexerConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            incoming,
            config,
            owner_key: owner.plugin_key(),
            owner: Arc::downgrade(owner),
            state: Mutex::new(MuxState {
                closed: None,
                next_channel: if incoming { 2 } else { 1 },
                next_member: 0,
                channels: HashMap::new(),
                groups: HashMap::new(),
            }),
            outbound,
            shutdown,
        });

        tracing::info!(
            multiplexer = %shared.id,
            incoming,
            owner = %shared.owner_key,
            "multiplexer started"
        );

        tokio::spawn(write_loop(
            shared.clone(),
            writer,
            outbound_rx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(read_loop(shared.clone(), reader, shutdown_rx));

        Self { shared }
    }

    /// Instance id
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Whether this end was constructed as the incoming side
    pub fn is_incoming(&self) -> bool {
        self.shared.incoming
    }

    /// Whether the multiplexer has closed
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed.is_some()
    }

    /// Open a stream channel and wait for the peer's acknowledgement.
    ///
    /// Fails with [`PlexusError::MultiplexerClosed`] if the multiplexer
    /// closes first, [`PlexusError::OpenRejected`] if the peer refuses the
    /// channel, and [`PlexusError::OpenTimeout`] if the configured open
    /// timeout elapses.
    pub async fn open_connector(&self) -> Result<StreamConnector> {
        let shared = &self.shared;
        let (id, parts, ack) = {
            let mut state = shared.lock();
            if let Some(reason) = &state.closed {
                return Err(PlexusError::MultiplexerClosed(reason.clone()));
            }
            let id = state.allocate_channel()?;
            let (tx, rx) = oneshot::channel();
            let (mut entry, parts) =
                ChannelEntry::new(ChannelState::Opening, 0, shared.config.window_size);
            entry.pending_open = Some(tx);
            state.channels.insert(id, entry);
            shared.send(Frame::open(id, shared.config.window_size))?;
            (id, parts, rx)
        };
        tracing::debug!(multiplexer = %shared.id, channel = id, "opening channel");

        let outcome = match shared.config.open_timeout() {
            Some(limit) => match tokio::time::timeout(limit, ack).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    shared.release_channel(id);
                    return Err(PlexusError::OpenTimeout(limit));
                },
            },
            None => ack.await,
        };

        let peer_window = match outcome {
            Ok(result) => result?,
            Err(_) => {
                return Err(PlexusError::MultiplexerClosed(
                    "open abandoned by reader".to_string(),
                ))
            },
        };
        Ok(shared.stream_connector(id, parts, peer_window))
    }

    /// Join (or create) a datagram group. Does not wait for the peer.
    pub fn open_packet_connector(&self, group: u32) -> Result<PacketConnector> {
        self.shared.join_group(group)
    }

    /// Close the multiplexer.
    ///
    /// Pending opens fail, open channels observe end of stream, the physical
    /// stream is shut down and the owner is notified once.
    pub fn close(&self) {
        self.shared.close_with("closed locally".to_string(), false);
    }

    /// Ids of channels currently in the channel table, ascending
    pub fn channel_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.shared.lock().channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// State of a channel; `Closed` once it has left the table.
    pub fn channel_state(&self, id: u32) -> ChannelState {
        self.shared
            .lock()
            .channels
            .get(&id)
            .map_or(ChannelState::Closed, |entry| entry.state)
    }
}

impl PartialEq for Multiplexer {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Multiplexer {}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("id", &self.shared.id)
            .field("incoming", &self.shared.incoming)
            .field("owner", &self.shared.owner_key)
            .finish_non_exhaustive()
    }
}

struct ChannelEntry {
    state: ChannelState,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    credit: Arc<Semaphore>,
    receive_window: Arc<AtomicU32>,
    pending_open: Option<oneshot::Sender<Result<u32>>>,
}

impl ChannelEntry {
    fn new(state: ChannelState, credit: usize, window: u32) -> (Self, ChannelParts) {
        let (tx, rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(credit));
        let receive_window = Arc::new(AtomicU32::new(window));
        let entry = Self {
            state,
            inbound: Some(tx),
            credit: credit.clone(),
            receive_window: receive_window.clone(),
            pending_open: None,
        };
        let parts = ChannelParts {
            inbound: rx,
            credit,
            receive_window,
        };
        (entry, parts)
    }

    /// Stop local traffic: reader drains then sees end of stream, writer fails.
    fn shut(&mut self) {
        self.inbound = None;
        self.credit.close();
    }

    fn fail(&mut self, reason: &str) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Inbound::Failed(reason.to_string()));
        }
        self.shut();
    }
}

#[derive(Default)]
struct GroupEntry {
    members: HashMap<u64, Vec<Arc<dyn PacketListener>>>,
}

struct MuxState {
    closed: Option<String>,
    next_channel: u32,
    next_member: u64,
    channels: HashMap<u32, ChannelEntry>,
    groups: HashMap<u32, GroupEntry>,
}

impl MuxState {
    fn allocate_channel(&mut self) -> Result<u32> {
        let id = self.next_channel;
        if id == 0 {
            return Err(PlexusError::Protocol("channel ids exhausted".to_string()));
        }
        self.next_channel = id.checked_add(2).unwrap_or(0);
        Ok(id)
    }
}

pub(crate) struct Shared {
    id: Uuid,
    incoming: bool,
    pub(crate) config: MultiplexerConfig,
    owner_key: PluginKey,
    owner: Weak<dyn MultiplexerOwner>,
    state: Mutex<MuxState>,
    outbound: mpsc::UnboundedSender<Frame>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(self: &Arc<Self>) -> Multiplexer {
        Multiplexer {
            shared: self.clone(),
        }
    }

    /// Queue a frame for the write task.
    pub(crate) fn send(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| PlexusError::MultiplexerClosed("write task stopped".to_string()))
    }

    fn is_local_id(&self, id: u32) -> bool {
        (id % 2 == 1) != self.incoming
    }

    fn stream_connector(
        self: &Arc<Self>,
        id: u32,
        parts: ChannelParts,
        peer_window: u32,
    ) -> StreamConnector {
        let reader = ChannelReader::new(id, self.clone(), parts.inbound, parts.receive_window);
        let writer = ChannelWriter::new(id, self.clone(), parts.credit, peer_window);
        let shared = self.clone();
        StreamConnector::new(self.owner_key, reader, writer)
            .on_release(move || shared.release_channel(id))
    }

    /// Close a channel from the local side. Best-effort and non-blocking.
    pub(crate) fn release_channel(&self, id: u32) {
        let mut state = self.lock();
        if state.closed.is_some() {
            return;
        }
        let Some(entry) = state.channels.get_mut(&id) else {
            return;
        };
        if entry.state == ChannelState::Closing {
            return;
        }
        entry.state = ChannelState::Closing;
        entry.pending_open = None;
        entry.shut();
        tracing::debug!(multiplexer = %self.id, channel = id, "releasing channel");
        let _ = self.send(Frame::close(id));
    }

    fn join_group(self: &Arc<Self>, group: u32) -> Result<PacketConnector> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(PlexusError::MultiplexerClosed(reason.clone()));
        }
        let member = state.next_member;
        state.next_member += 1;
        state
            .groups
            .entry(group)
            .or_default()
            .members
            .insert(member, Vec::new());
        Ok(PacketConnector::new(self.clone(), group, member, self.owner_key))
    }

    pub(crate) fn leave_group(&self, group: u32, member: u64) {
        let mut state = self.lock();
        if let Some(entry) = state.groups.get_mut(&group) {
            entry.members.remove(&member);
            if entry.members.is_empty() {
                state.groups.remove(&group);
            }
        }
    }

    pub(crate) fn add_listener(&self, group: u32, member: u64, listener: Arc<dyn PacketListener>) {
        let mut state = self.lock();
        if let Some(listeners) = state
            .groups
            .get_mut(&group)
            .and_then(|entry| entry.members.get_mut(&member))
        {
            listeners.push(listener);
        }
    }

    pub(crate) fn send_packet(&self, packet: &Packet) -> Result<()> {
        let state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(PlexusError::MultiplexerClosed(reason.clone()));
        }
        self.send(Frame::packet(packet.group, packet.payload.clone()))
    }

    fn group_listeners(&self, group: u32) -> Option<Vec<Arc<dyn PacketListener>>> {
        self.lock()
            .groups
            .get(&group)
            .map(|entry| entry.members.values().flatten().cloned().collect())
    }

    /// Transition to closed. Only the first call has any effect.
    fn close_with(self: &Arc<Self>, reason: String, failed: bool) {
        let channels = {
            let mut state = self.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(reason.clone());
            state.groups.clear();
            std::mem::take(&mut state.channels)
        };

        let count = channels.len();
        for (_, mut entry) in channels {
            if let Some(pending) = entry.pending_open.take() {
                let _ = pending.send(Err(PlexusError::MultiplexerClosed(reason.clone())));
            }
            if failed {
                entry.fail(&reason);
            } else {
                entry.shut();
            }
        }
        self.shutdown.send_replace(true);

        if failed {
            tracing::warn!(multiplexer = %self.id, channels = count, "multiplexer failed: {}", reason);
        } else {
            tracing::info!(multiplexer = %self.id, channels = count, "multiplexer closed: {}", reason);
        }

        if let Some(owner) = self.owner.upgrade() {
            owner.close_multiplexer(&self.handle());
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) -> Result<()> {
        let id = frame.channel;
        match frame.kind {
            FrameType::Open => self.on_open(id, frame.u32_payload()?),
            FrameType::OpenAck => self.on_open_ack(id, frame.u32_payload()?),
            FrameType::OpenReject => {
                let mut state = self.lock();
                let opening = state
                    .channels
                    .get(&id)
                    .is_some_and(|entry| entry.state != ChannelState::Open);
                if opening {
                    if let Some(mut entry) = state.channels.remove(&id) {
                        if let Some(pending) = entry.pending_open.take() {
                            let _ = pending.send(Err(PlexusError::OpenRejected(id)));
                        }
                    }
                }
                Ok(())
            },
            FrameType::Data => {
                let mut state = self.lock();
                let Some(entry) = state.channels.get_mut(&id) else {
                    return Ok(());
                };
                if entry.state != ChannelState::Open {
                    return Ok(());
                }
                let len = frame.payload.len() as u32;
                let available = entry.receive_window.load(Ordering::Acquire);
                if len > available {
                    tracing::warn!(
                        multiplexer = %self.id,
                        channel = id,
                        "peer sent {} bytes with {} bytes of credit",
                        len,
                        available
                    );
                    entry.state = ChannelState::Closing;
                    entry.fail("peer exceeded the flow-control window");
                    return self.send(Frame::close(id));
                }
                entry.receive_window.fetch_sub(len, Ordering::AcqRel);
                if let Some(inbound) = &entry.inbound {
                    let _ = inbound.send(Inbound::Data(frame.payload));
                }
                Ok(())
            },
            FrameType::Window => {
                let credit = frame.u32_payload()?;
                let state = self.lock();
                if let Some(entry) = state.channels.get(&id) {
                    if entry.state == ChannelState::Open {
                        entry.credit.add_permits(credit as usize);
                    }
                }
                Ok(())
            },
            FrameType::Close => {
                let mut state = self.lock();
                if let Some(mut entry) = state.channels.remove(&id) {
                    let echo = entry.state != ChannelState::Closing;
                    if let Some(pending) = entry.pending_open.take() {
                        let _ = pending.send(Err(PlexusError::OpenRejected(id)));
                    }
                    entry.shut();
                    if echo {
                        self.send(Frame::close(id))?;
                    }
                    tracing::debug!(multiplexer = %self.id, channel = id, "channel closed by peer");
                }
                Ok(())
            },
            FrameType::Packet => {
                self.on_packet(Packet {
                    group: id,
                    payload: frame.payload,
                });
                Ok(())
            },
        }
    }

    fn on_open(self: &Arc<Self>, id: u32, peer_window: u32) -> Result<()> {
        let owner = self.owner.upgrade();
        let connector = {
            let mut state = self.lock();
            if state.closed.is_some() {
                return Ok(());
            }
            let acceptable = id != 0
                && !self.is_local_id(id)
                && !state.channels.contains_key(&id)
                && peer_window > 0
                && owner.is_some();
            if !acceptable {
                tracing::debug!(multiplexer = %self.id, channel = id, "rejecting channel");
                return self.send(Frame::open_reject(id));
            }

            let (entry, parts) =
                ChannelEntry::new(ChannelState::Open, peer_window as usize, self.config.window_size);
            state.channels.insert(id, entry);
            self.send(Frame::open_ack(id, self.config.window_size))?;
            self.stream_connector(id, parts, peer_window)
        };

        tracing::debug!(multiplexer = %self.id, channel = id, "accepted channel");
        if let Some(owner) = owner {
            owner.accept_connector(&self.handle(), Connector::Stream(connector));
        }
        Ok(())
    }

    fn on_open_ack(&self, id: u32, peer_window: u32) -> Result<()> {
        if peer_window == 0 {
            return Err(PlexusError::Protocol(format!(
                "channel {id} acknowledged with an empty window"
            )));
        }
        let abandoned = {
            let mut state = self.lock();
            let Some(entry) = state.channels.get_mut(&id) else {
                return Ok(());
            };
            if entry.state != ChannelState::Opening {
                return Ok(());
            }
            let Some(pending) = entry.pending_open.take() else {
                return Ok(());
            };
            entry.state = ChannelState::Open;
            entry.credit.add_permits(peer_window as usize);
            pending.send(Ok(peer_window)).is_err()
        };
        if abandoned {
            self.release_channel(id);
        }
        Ok(())
    }

    fn on_packet(self: &Arc<Self>, packet: Packet) {
        if packet.payload.len() > self.config.max_packet_length as usize {
            tracing::debug!(
                multiplexer = %self.id,
                group = packet.group,
                "dropping oversize packet of {} bytes",
                packet.payload.len()
            );
            return;
        }

        let listeners = match self.group_listeners(packet.group) {
            Some(listeners) => listeners,
            None => {
                let Some(owner) = self.owner.upgrade() else {
                    return;
                };
                let Ok(connector) = self.join_group(packet.group) else {
                    return;
                };
                owner.accept_connector(&self.handle(), Connector::Packet(connector));
                self.group_listeners(packet.group).unwrap_or_default()
            },
        };
        for listener in listeners {
            listener.on_packet(&packet);
        }
    }
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.write_all(&frame.encode()).await {
                    shared.close_with(format!("write failed: {e}"), true);
                    break;
                }
                if outbound.is_empty() {
                    if let Err(e) = writer.flush().await {
                        shared.close_with(format!("flush failed: {e}"), true);
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                while let Ok(frame) = outbound.try_recv() {
                    if writer.write_all(&frame.encode()).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    tracing::trace!(multiplexer = %shared.id, "write task finished");
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R, mut shutdown: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let max_payload = shared.config.max_payload();
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, max_payload) => frame,
            _ = shutdown.changed() => break,
        };
        match frame {
            Ok(Some(frame)) => {
                if let Err(e) = shared.dispatch(frame) {
                    shared.close_with(e.to_string(), true);
                    break;
                }
            },
            Ok(None) => {
                shared.close_with("peer closed the link".to_string(), false);
                break;
            },
            Err(e) => {
                shared.close_with(e.to_string(), true);
                break;
            },
        }
    }
    tracing::trace!(multiplexer = %shared.id, "read task finished");
}
