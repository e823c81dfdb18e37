//! Virtual stream channel halves.
//!
//! The reader task is the producer for a channel's inbound queue and the
//! caller's task is the consumer; writes go the other way through the
//! multiplexer's single outbound queue. Credit-based flow control bounds the
//! bytes in flight: a writer holds at most the peer's announced window, and
//! a reader grants credit back once it has consumed half of its own window.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, AcquireError, OwnedSemaphorePermit, Semaphore};

use super::frame::Frame;
use super::Shared;

/// Per-channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Open request sent, awaiting acknowledgement
    Opening,
    /// Bidirectional transfer permitted
    Open,
    /// Close sent, awaiting the peer's close
    Closing,
    /// Removed from the channel table
    Closed,
}

/// Item delivered to a channel's reader.
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    Failed(String),
}

/// Receive-side handles created when a channel is registered.
pub(crate) struct ChannelParts {
    pub(crate) inbound: mpsc::UnboundedReceiver<Inbound>,
    pub(crate) credit: Arc<Semaphore>,
    pub(crate) receive_window: Arc<AtomicU32>,
}

type Acquire =
    Pin<Box<dyn Future<Output = Result<OwnedSemaphorePermit, AcquireError>> + Send>>;

/// Read half of a stream channel.
pub(crate) struct ChannelReader {
    id: u32,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    pending: Bytes,
    consumed: u32,
    grant_threshold: u32,
    receive_window: Arc<AtomicU32>,
}

impl ChannelReader {
    pub(crate) fn new(
        id: u32,
        shared: Arc<Shared>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        receive_window: Arc<AtomicU32>,
    ) -> Self {
        let grant_threshold = (shared.config.window_size / 2).max(1);
        Self {
            id,
            shared,
            inbound,
            pending: Bytes::new(),
            consumed: 0,
            grant_threshold,
            receive_window,
        }
    }

    fn maybe_grant(&mut self) {
        if self.consumed < self.grant_threshold {
            return;
        }
        let credit = std::mem::take(&mut self.consumed);
        self.receive_window.fetch_add(credit, Ordering::AcqRel);
        // The channel may already be closing; a lost grant is harmless then.
        let _ = self.shared.send(Frame::window(self.id, credit));
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                this.consumed += n as u32;
                this.maybe_grant();
                return Poll::Ready(Ok(()));
            }

            match ready!(this.inbound.poll_recv(cx)) {
                Some(Inbound::Data(bytes)) => this.pending = bytes,
                Some(Inbound::Failed(reason)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        reason,
                    )));
                },
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// Write half of a stream channel.
pub(crate) struct ChannelWriter {
    id: u32,
    shared: Arc<Shared>,
    credit: Arc<Semaphore>,
    acquiring: Option<Acquire>,
    held: usize,
    max_chunk: usize,
}

impl ChannelWriter {
    pub(crate) fn new(
        id: u32,
        shared: Arc<Shared>,
        credit: Arc<Semaphore>,
        peer_window: u32,
    ) -> Self {
        // Never wait for more than half the peer's window; the peer grants
        // credit in half-window steps.
        let max_chunk = shared
            .config
            .max_frame_payload
            .min((peer_window / 2).max(1)) as usize;
        Self {
            id,
            shared,
            credit,
            acquiring: None,
            held: 0,
            max_chunk,
        }
    }
}

fn closed_channel(id: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("channel {id} is closed"),
    )
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        loop {
            if let Some(acquire) = this.acquiring.as_mut() {
                let permit = ready!(acquire.as_mut().poll(cx));
                this.acquiring = None;
                match permit {
                    Ok(permit) => {
                        this.held += permit.num_permits();
                        permit.forget();
                    },
                    Err(_) => return Poll::Ready(Err(closed_channel(this.id))),
                }
            }

            if this.held > 0 {
                let n = buf.len().min(this.held).min(this.max_chunk);
                let frame = Frame::data(this.id, Bytes::copy_from_slice(&buf[..n]));
                if this.shared.send(frame).is_err() {
                    return Poll::Ready(Err(closed_channel(this.id)));
                }
                this.held -= n;
                return Poll::Ready(Ok(n));
            }

            if this.credit.is_closed() {
                return Poll::Ready(Err(closed_channel(this.id)));
            }
            let want = buf.len().min(this.max_chunk) as u32;
            this.acquiring = Some(Box::pin(this.credit.clone().acquire_many_owned(want)));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are queued for the writer task as soon as they are accepted.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // No half-close; releasing the connector closes the channel.
        Poll::Ready(Ok(()))
    }
}
