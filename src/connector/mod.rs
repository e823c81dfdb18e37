//! Connector facades handed to plugins and callers.
//!
//! A [`StreamConnector`] is a duplex byte stream plus a release cascade.
//! Each plugin that wraps a connector takes over the release obligations of
//! the connector it wraps, so releasing (or dropping) the outermost connector
//! releases every layer beneath it exactly once.
//!
//! ```text
//!   serializer    ──wrap──┐
//!   encryption    ──wrap──┤  release hooks run innermost-first:
//!   transport     ──open──┘  transport, encryption, serializer
//! ```

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::Result;
use crate::protocol::PluginKey;

pub use crate::mux::{Packet, PacketConnector, PacketListener};

/// Boxed read half of a connector.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a connector.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Release hooks in registration (innermost-first) order.
///
/// Hooks are drained as they run, so each runs at most once whether the
/// chain is released explicitly or dropped.
#[derive(Default)]
struct ReleaseChain {
    hooks: Vec<(PluginKey, ReleaseHook)>,
}

impl ReleaseChain {
    fn run(&mut self) {
        for (owner, hook) in self.hooks.drain(..) {
            tracing::trace!(%owner, "releasing connector layer");
            hook();
        }
    }
}

impl Drop for ReleaseChain {
    fn drop(&mut self) {
        self.run();
    }
}

/// Stream-oriented connector.
pub struct StreamConnector {
    owner: PluginKey,
    reader: BoxedReader,
    writer: BoxedWriter,
    releases: ReleaseChain,
}

impl StreamConnector {
    /// Create a connector from separate read and write halves.
    pub fn new<R, W>(owner: PluginKey, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            owner,
            reader: Box::new(reader),
            writer: Box::new(writer),
            releases: ReleaseChain::default(),
        }
    }

    /// Create a connector over a duplex stream.
    pub fn from_stream<S>(owner: PluginKey, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(owner, reader, writer)
    }

    /// Register a hook run when this layer is released.
    pub fn on_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.releases.hooks.push((self.owner, Box::new(hook)));
        self
    }

    /// Plugin that produced the outermost layer
    pub fn owner(&self) -> PluginKey {
        self.owner
    }

    /// Number of registered release hooks
    pub fn pending_releases(&self) -> usize {
        self.releases.hooks.len()
    }

    /// Wrap this connector's streams in a new layer owned by `owner`.
    ///
    /// The new connector inherits every release hook. If `transform` fails,
    /// this connector is released before the error is returned.
    pub fn wrap<F>(self, owner: PluginKey, transform: F) -> Result<StreamConnector>
    where
        F: FnOnce(BoxedReader, BoxedWriter) -> Result<(BoxedReader, BoxedWriter)>,
    {
        let StreamConnector {
            reader,
            writer,
            releases,
            ..
        } = self;

        let (reader, writer) = transform(reader, writer)?;
        Ok(StreamConnector {
            owner,
            reader,
            writer,
            releases,
        })
    }

    /// Release this connector and every layer beneath it.
    pub fn release(mut self) {
        self.releases.run();
    }
}

impl fmt::Debug for StreamConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnector")
            .field("owner", &self.owner)
            .field("pending_releases", &self.releases.hooks.len())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for StreamConnector {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for StreamConnector {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

/// Connector handed to a multiplexer owner for a peer-opened channel.
#[derive(Debug)]
pub enum Connector {
    /// Virtual stream channel
    Stream(StreamConnector),
    /// Datagram group membership
    Packet(PacketConnector),
}

impl Connector {
    /// Plugin that owns the connector
    pub fn owner(&self) -> PluginKey {
        match self {
            Self::Stream(c) => c.owner(),
            Self::Packet(c) => c.owner(),
        }
    }

    /// Release the connector
    pub fn release(self) {
        match self {
            Self::Stream(c) => c.release(),
            Self::Packet(c) => c.release(),
        }
    }
}
