//! Byte-stream handles for locally-initiated tunnels
//!
//! A [`TunnelStream`] is the caller-facing end of a tunnel opened with
//! [`PeerRegistry::open_socket`](crate::registry::PeerRegistry::open_socket):
//! reads drain the inbound Write payloads the registry routes to this
//! socket, writes become outbound Write messages, and shutdown sends the
//! Close through the socket's idempotent destroy.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use burrow_core::{BurrowResult, SocketId};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::socket::VirtualSocket;

// ----------------------------------------------------------------------------
// Tunnel Stream
// ----------------------------------------------------------------------------

/// A duplex byte stream over one locally-initiated virtual socket
pub struct TunnelStream {
    socket: Arc<VirtualSocket>,
    rx: mpsc::Receiver<Vec<u8>>,

    read_buf: Vec<u8>,
    read_pos: usize,

    pending_send: Option<Pin<Box<dyn Future<Output = BurrowResult<()>> + Send + 'static>>>,
    /// Length of the chunk the pending send carries; reported as written
    /// when that send completes, so a retried `poll_write` never re-queues
    /// the same bytes
    in_flight_len: usize,
    write_closed: bool,
}

impl TunnelStream {
    pub(crate) fn new(socket: Arc<VirtualSocket>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            socket,
            rx,
            read_buf: Vec::new(),
            read_pos: 0,
            pending_send: None,
            in_flight_len: 0,
            write_closed: false,
        }
    }

    /// Local identifier of the underlying virtual socket
    pub fn id(&self) -> SocketId {
        self.socket.id()
    }

    fn poll_pending_send(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if let Some(send) = self.pending_send.as_mut() {
            match send.as_mut().poll(cx) {
                Poll::Ready(Ok(())) => {
                    self.pending_send = None;
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(Err(err)) => {
                    self.pending_send = None;
                    Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        format!("send failed: {err}"),
                    )))
                }
                Poll::Pending => Poll::Pending,
            }
        } else {
            Poll::Ready(Ok(()))
        }
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        // Best-effort close if the caller never shut the stream down, so the
        // registry entry and the remote half don't leak.
        if !self.write_closed {
            let socket = self.socket.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { socket.destroy().await });
            }
        }
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            // Drain buffered bytes first.
            if self.read_pos < self.read_buf.len() {
                let available = self.read_buf.len() - self.read_pos;
                let to_copy = std::cmp::min(available, buf.remaining());
                let start = self.read_pos;
                buf.put_slice(&self.read_buf[start..start + to_copy]);
                self.read_pos += to_copy;
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.rx).poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                // Queue sender dropped: the socket was destroyed, EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.read_buf = chunk;
                    self.read_pos = 0;
                }
            }
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tunnel write side closed",
            )));
        }

        loop {
            // An in-flight send holds the same bytes the caller is retrying
            // with; completing it completes this write.
            if self.pending_send.is_some() {
                return match self.poll_pending_send(cx) {
                    Poll::Ready(Ok(())) => Poll::Ready(Ok(self.in_flight_len)),
                    Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
                    Poll::Pending => Poll::Pending,
                };
            }

            if data.is_empty() {
                return Poll::Ready(Ok(0));
            }

            let socket = self.socket.clone();
            let bytes = data.to_vec();
            self.in_flight_len = bytes.len();
            self.pending_send = Some(Box::pin(async move { socket.send_data(bytes).await }));
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.poll_pending_send(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.write_closed {
            return Poll::Ready(Ok(()));
        }

        match self.poll_pending_send(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Pending => return Poll::Pending,
        }

        self.write_closed = true;
        let socket = self.socket.clone();
        tokio::spawn(async move { socket.destroy().await });
        Poll::Ready(Ok(()))
    }
}

impl core::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("socket", &self.socket.id())
            .field("write_closed", &self.write_closed)
            .finish_non_exhaustive()
    }
}
