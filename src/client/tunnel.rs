use bytes::{Buf as _, Bytes};
use std::future::poll_fn;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use crate::error::Result;
use super::channel::{
    AcceptChannel, Channel, ChannelConfig, ChannelEvent, ChannelKind, ChannelReceiver, DATA_STANDARD,
};

/// Handle to an SSH tunnel (TCP/IP forwarding channel).
///
/// TCP/IP forwarding channels (RFC 4254, section 7), commonly called "tunnels", allow you to
/// transmit ordinary TCP/IP sockets over SSH. There are two ways how to obtain a tunnel:
///
/// - You can ask the server to connect to an address using
/// [`Client::connect_tunnel()`][super::Client::connect_tunnel]. This is sometimes called "local
/// forwarding".
/// - You can ask the server to bind to an address and listen for incoming connections using
/// [`Client::bind_tunnel()`][super::Client::bind_tunnel]. The server then opens a
/// `"forwarded-tcpip"` channel for each connection; register a
/// [`ChannelOpener`][super::ChannelOpener] for this channel type and turn the channels into
/// tunnels with [`Tunnel::accept()`]. This is sometimes called "remote forwarding".
#[derive(Clone)]
pub struct Tunnel {
    channel: Channel,
}

impl Tunnel {
    pub(super) fn new(channel: Channel, channel_rx: ChannelReceiver) -> (Tunnel, TunnelReceiver) {
        (Tunnel { channel }, TunnelReceiver { channel_rx, pending: Bytes::new(), eof: false })
    }

    /// Accept a `"forwarded-tcpip"` channel opened by the server.
    ///
    /// Returns the tunnel together with the address that was connected on the server and the
    /// address of the peer that made the connection.
    pub fn accept(
        accept: AcceptChannel,
        config: ChannelConfig,
    ) -> Result<(Tunnel, TunnelReceiver, ChannelKind)> {
        let kind = accept.kind().clone();
        let (channel, channel_rx) = accept.accept(config)?;
        let (tunnel, tunnel_rx) = Tunnel::new(channel, channel_rx);
        Ok((tunnel, tunnel_rx, kind))
    }

    /// Send data to the tunnel.
    ///
    /// This method returns after all bytes have been accepted by the flow control mechanism and
    /// written to the internal send buffer, but before we send them to the socket (or other I/O
    /// stream that backs this SSH connection).
    pub async fn send_data(&self, data: Bytes) -> Result<()> {
        self.channel.send_data(data, DATA_STANDARD).await
    }

    /// Signals that no more data will be sent to this tunnel.
    ///
    /// If the tunnel is closed before you call this method, we quietly ignore this error and
    /// return `Ok`.
    pub fn send_eof(&self) -> Result<()> {
        self.channel.send_eof()
    }

    /// Close the tunnel.
    pub fn close(&self) -> Result<()> {
        self.channel.close()
    }
}

/// Receiving half of a [`Tunnel`].
///
/// [`TunnelReceiver`] produces [`TunnelEvent`]s, which correspond to the data sent by the server
/// on the tunnel. It also implements [`AsyncRead`], so you can plug it into
/// [`tokio::io::copy()`] and similar functions; don't mix the two styles on one receiver.
pub struct TunnelReceiver {
    channel_rx: ChannelReceiver,
    pending: Bytes,
    eof: bool,
}

/// An event returned from [`TunnelReceiver`].
///
/// This enum is marked as `#[non_exhaustive]`, so that we can add new variants without breaking
/// backwards compatibility. It should always be safe to ignore any events that you don't intend to
/// handle.
#[derive(Debug)]
#[non_exhaustive]
pub enum TunnelEvent {
    /// Data received from the tunnel.
    ///
    /// You should handle this data as a byte stream, the boundaries between consecutive `Data`
    /// events might be arbitrary.
    Data(Bytes),

    /// End of file received from the tunnel.
    ///
    /// After this, we should not receive more data from the tunnel, but the tunnel is not yet
    /// closed.
    Eof,
}

impl TunnelReceiver {
    /// Receive data from the tunnel.
    ///
    /// Returns `None` if the tunnel was closed.
    pub async fn recv(&mut self) -> Option<TunnelEvent> {
        poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Poll-friendly variant of [`.recv()`][Self::recv()].
    pub fn poll_recv(&mut self, cx: &mut Context) -> Poll<Option<TunnelEvent>> {
        loop {
            match ready!(self.channel_rx.poll_recv(cx)) {
                Some(ChannelEvent::Data(data, DATA_STANDARD)) =>
                    return Poll::Ready(Some(TunnelEvent::Data(data))),
                Some(ChannelEvent::Eof) =>
                    return Poll::Ready(Some(TunnelEvent::Eof)),
                Some(_) => continue,
                None => return Poll::Ready(None),
            }
        }
    }
}

impl AsyncRead for TunnelReceiver {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context, buf: &mut ReadBuf) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        while this.pending.is_empty() && !this.eof {
            match ready!(this.poll_recv(cx)) {
                Some(TunnelEvent::Data(data)) => this.pending = data,
                Some(TunnelEvent::Eof) | None => this.eof = true,
            }
        }

        let len = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending[..len]);
        this.pending.advance(len);
        Poll::Ready(Ok(()))
    }
}
