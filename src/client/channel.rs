use bytes::Bytes;
use std::future::poll_fn;
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use crate::codec::Buffer;
use crate::codes::open;
use crate::error::{ChannelOpenError, Error, Result};
use super::client_state::{self, Shared};
use super::pending::PendingReply;

/// Handle to an SSH channel (low level API).
///
/// Use this object to send requests and data to the server over an SSH channel. To receive events
/// and data from the server, use the matching [`ChannelReceiver`]. To obtain an instance of
/// [`Channel`] and [`ChannelReceiver`], use the method
/// [`Client::open_channel()`][super::Client::open_channel()], or accept a channel opened by the
/// server with [`AcceptChannel::accept()`].
///
/// This is part of a **low level API** that gives you direct access to an SSH channel, as
/// described in RFC 4254, section 5. If you want to execute programs, consider using a
/// [`Session`][super::Session], which provides an API that hides the details of the SSH protocol.
///
/// You can cheaply clone this object and safely share the clones between tasks.
#[derive(Clone)]
pub struct Channel {
    pub(super) shared: Arc<Shared>,
    pub(super) our_id: u32,
    pub(super) send_timeout: Option<Duration>,
    pub(super) request_timeout: Option<Duration>,
}

impl Channel {
    /// Send channel data to the server.
    ///
    /// This sends a series of `SSH_MSG_CHANNEL_DATA` or `SSH_MSG_CHANNEL_EXTENDED_DATA` (depending
    /// on `data_type`) to the channel (RFC 4254, section 5.2). We split `data` into multiple
    /// packets, each no larger than the window and the maximum packet size announced by the
    /// server. When the window is exhausted, we wait until the server adjusts it.
    ///
    /// This method returns after all bytes have been accepted by the flow control mechanism and
    /// written to the internal send buffer, but before we send them to the socket (or other I/O
    /// stream that backs this SSH connection).
    ///
    /// Each wait for the window is bounded by [`ChannelConfig::send_timeout`]; on timeout, the
    /// bytes that were sent so far stay sent.
    pub async fn send_data(&self, mut data: Bytes, data_type: DataType) -> Result<()> {
        let our_id = self.our_id;
        while !data.is_empty() {
            client_state::wait_until(&self.shared, self.send_timeout, |st| {
                if !st.tr.can_write() {
                    return Ok(None)
                }
                let channel = st.conn.ready_channel(our_id)?;
                match channel.send_data(&mut st.tr, &mut data, data_type)? {
                    0 => Ok(None),
                    len => Ok(Some(len)),
                }
            }).await?;
        }
        Ok(())
    }

    /// Send end-of-file marker to the server.
    ///
    /// This sends `SSH_MSG_CHANNEL_EOF` to the channel (RFC 4254, section 5.3) to signify that you
    /// will not send any more data to this channel. You may still receive data from the server.
    ///
    /// If the channel is closed before you call this method, we quietly ignore this error and
    /// return `Ok`.
    pub fn send_eof(&self) -> Result<()> {
        let res = client_state::with_state(&self.shared, |st| {
            st.conn.ready_channel(self.our_id)?.send_eof(&mut st.tr)
        });
        match res {
            // it is common that the peer closes the channel before we have a chance to send EOF
            Err(Error::ChannelClosed) => Ok(()),
            res => res,
        }
    }

    /// Close the channel.
    ///
    /// This sends `SSH_MSG_CHANNEL_CLOSE` to the channel (RFC 4254, section 5.3) and the channel
    /// will become closed after we receive the same message from the server. We won't send any
    /// further requests or data to the server.
    ///
    /// This method is idempotent: if the channel is already closed or closing, we do nothing.
    pub fn close(&self) -> Result<()> {
        let res = client_state::with_state(&self.shared, |st| {
            st.conn.ready_channel(self.our_id)?.close(&mut st.tr)
        });
        match res {
            Err(Error::ChannelClosed) => Ok(()),
            res => res,
        }
    }

    /// Send a request to the server and ask for a reply.
    ///
    /// This sends a `SSH_MSG_CHANNEL_REQUEST` with the `want reply` field set (RFC 4254, section
    /// 5.4). `payload` is the raw type-specific data that follows the header of the request; use
    /// [`Buffer`][crate::Buffer] to encode it. The request is enqueued immediately, use the
    /// returned [`ChannelReply`] to wait for the reply.
    ///
    /// Replies are matched with requests in the order in which the requests were sent. Requests
    /// are not subject to the flow control mechanism.
    pub fn send_request(&self, request_type: &str, payload: &[u8]) -> Result<ChannelReply> {
        let reply = client_state::with_state(&self.shared, |st| {
            st.conn.ready_channel(self.our_id)?.send_request(&mut st.tr, request_type, payload, true)
        })?;
        Ok(ChannelReply { reply, timeout: self.request_timeout })
    }

    /// Send a request to the server without asking for a reply.
    pub fn send_request_no_reply(&self, request_type: &str, payload: &[u8]) -> Result<()> {
        client_state::with_state(&self.shared, |st| {
            st.conn.ready_channel(self.our_id)?.send_request(&mut st.tr, request_type, payload, false)
        })?;
        Ok(())
    }

    /// Current state of the channel.
    pub fn phase(&self) -> ChannelPhase {
        self.shared.st.lock().conn.channel_phase(self.our_id)
    }

    /// Our identifier of the channel ("sender channel" in RFC 4254).
    pub fn id(&self) -> u32 {
        self.our_id
    }
}


/// Future reply to a request sent by [`Channel::send_request()`] (low level API).
///
/// You may either wait for the reply using [`.want_reply()`][Self::want_reply], or ignore the
/// reply using [`.no_reply()`][Self::no_reply].
#[derive(Debug)]
#[must_use = "please use .want_reply() to await the reply, or .no_reply() to ignore it"]
pub struct ChannelReply {
    reply: Option<PendingReply<()>>,
    timeout: Option<Duration>,
}

impl ChannelReply {
    /// Wait for the reply from the server.
    ///
    /// If the server replied with `SSH_MSG_CHANNEL_FAILURE`, this returns [`Error::ChannelReq`].
    /// If the channel was closed before the reply arrived, this returns [`Error::ChannelClosed`].
    pub async fn want_reply(self) -> Result<()> {
        match self.reply {
            Some(reply) => reply.wait(self.timeout).await,
            None => Ok(()),
        }
    }

    /// Ignore the reply.
    ///
    /// This just drops the [`ChannelReply`], but it is a good practice to do this explicitly with
    /// this method.
    pub fn no_reply(self) {}
}


/// Receiving half of a [`Channel`] (low level API).
///
/// [`ChannelReceiver`] produces [`ChannelEvent`]s, which correspond to the requests and data sent
/// by the server on the channel.
///
/// Received data counts against the flow control window until you take it from this receiver.
/// If you stop receiving, the server will eventually stop sending data to this channel. If you
/// drop the receiver, all further data is discarded.
///
/// This is part of a **low level [`Channel`] API** that gives you direct access to an SSH channel.
pub struct ChannelReceiver {
    pub(super) shared: Arc<Shared>,
    pub(super) our_id: u32,
    pub(super) event_rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelReceiver {
    /// Wait for the next event.
    ///
    /// Returns `None` if the channel was closed.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Poll-friendly variant of [`.recv()`][Self::recv()].
    pub fn poll_recv(&mut self, cx: &mut Context) -> Poll<Option<ChannelEvent>> {
        let event = ready!(self.event_rx.poll_recv(cx));
        if let Some(ChannelEvent::Data(data, _)) = event.as_ref() {
            self.consume(data.len());
        }
        Poll::Ready(event)
    }

    fn consume(&self, len: usize) {
        let mut st = self.shared.st.lock();
        let st = &mut *st;
        if let Err(err) = st.conn.consume(&mut st.tr, self.our_id, len) {
            log::debug!("could not adjust window of our channel {}: {}", self.our_id, err);
        }
    }
}

impl Drop for ChannelReceiver {
    fn drop(&mut self) {
        // data that nobody will read must not keep the window closed
        self.event_rx.close();
        let mut len = 0;
        while let Ok(event) = self.event_rx.try_recv() {
            if let ChannelEvent::Data(data, _) = event {
                len += data.len();
            }
        }
        if len > 0 {
            self.consume(len);
        }
    }
}


/// An event returned from [`ChannelReceiver`] (low level API).
///
/// These are events related to a particular SSH channel, they correspond to the requests and data
/// sent by the server.
///
/// This enum is marked as `#[non_exhaustive]`, so that we can add new variants without breaking
/// backwards compatibility. It should always be safe to ignore any events that you don't intend to
/// handle.
///
/// This is part of a **low level [`Channel`] API** that gives you direct access to an SSH channel.
#[derive(Debug)]
#[non_exhaustive]
pub enum ChannelEvent {
    /// Data received from the server.
    ///
    /// These events correspond to received `SSH_MSG_CHANNEL_DATA` or
    /// `SSH_MSG_CHANNEL_EXTENDED_DATA` (RFC 4254, section 5.2). You should handle this data as a
    /// byte stream, the boundaries between consecutive `Data` events might be arbitrary.
    Data(Bytes, DataType),

    /// End-of-file marker received from the server.
    ///
    /// This corresponds to a received `SSH_MSG_CHANNEL_EOF` (RFC 4254, section 5.3), the server
    /// tells us that it won't send any more data to this channel.
    Eof,

    /// The remote process terminated with given exit status ("exit-status" request).
    ExitStatus(u32),

    /// The remote process terminated violently due to a signal ("exit-signal" request).
    ExitSignal(ExitSignal),
}

/// Information about a process that terminated due to a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    /// Name of the signal that terminated the process.
    ///
    /// Signal names are described in RFC 4254, section 6.10.
    /// [`codes::signal`][crate::codes::signal] lists the signal names defined by SSH.
    pub signal_name: String,

    /// True if the process produced a core dump.
    pub core_dumped: bool,

    /// Error message.
    pub message: String,

    /// Language tag of `message` (per RFC 3066).
    pub message_lang: String,
}


/// State of a channel.
///
/// A channel goes from [`Opening`][Self::Opening] to [`Open`][Self::Open]; then each side sends
/// its end-of-file marker and finally its close message. The channel is
/// [`Closed`][Self::Closed] once both sides sent `SSH_MSG_CHANNEL_CLOSE`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelPhase {
    /// The open request has been sent, but not answered yet.
    Opening,
    /// Data may flow in both directions.
    Open,
    /// We have sent EOF, the server may still send data.
    EofSent,
    /// The server has sent EOF, we may still send data.
    EofReceived,
    /// Both sides have sent EOF.
    HalfClosed,
    /// One side has sent `SSH_MSG_CHANNEL_CLOSE`.
    Closing,
    /// Both sides have closed the channel.
    Closed,
}


/// Type of data sent over an SSH channel (low level API).
///
/// Channel data transfer is described in RFC 4254, section 5.2. In practice, the only two data
/// types used are `DataType::Standard` ([`DATA_STANDARD`]) and `DataType::Extended(1)`
/// ([`DATA_STDERR`]).
///
/// This is part of a **low level [`Channel`] API** that gives you direct access to an SSH channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Standard channel data sent using `SSH_MSG_CHANNEL_DATA`.
    Standard,
    /// Extended channel data sent using `SSH_MSG_CHANNEL_EXTENDED_DATA`.
    Extended(u32),
}

/// Shorthand for `DataType::Standard` (low level API).
pub const DATA_STANDARD: DataType = DataType::Standard;

/// Shorthand for `DataType::Extended(1)`, the standard error stream (low level API).
pub const DATA_STDERR: DataType = DataType::Extended(1);


/// Type of a channel together with the type-specific fields of the open request.
///
/// This corresponds to the channel type and the type-specific data in `SSH_MSG_CHANNEL_OPEN` (RFC
/// 4254, sections 6.1, 6.3.2 and 7.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// An interactive session (`"session"`), see [`Session`][super::Session].
    Session,

    /// Connection to `host:port` that the server makes on our behalf (`"direct-tcpip"`).
    DirectTcpip {
        /// Host that the server should connect to.
        host: String,
        /// Port that the server should connect to.
        port: u32,
        /// Address of the client that made the connection on our side.
        originator_host: String,
        /// Port of the client that made the connection on our side.
        originator_port: u32,
    },

    /// Connection to a port that was bound on the server with
    /// [`Client::bind_tunnel()`][super::Client::bind_tunnel] (`"forwarded-tcpip"`).
    ForwardedTcpip {
        /// Address that was connected on the server.
        connected_host: String,
        /// Port that was connected on the server.
        connected_port: u32,
        /// Address of the client that made the connection.
        originator_host: String,
        /// Port of the client that made the connection.
        originator_port: u32,
    },

    /// X11 forwarding channel (`"x11"`).
    X11 {
        /// Address of the X11 client.
        originator_host: String,
        /// Port of the X11 client.
        originator_port: u32,
    },

    /// Any other channel type, with raw type-specific data.
    Other {
        /// The channel type.
        channel_type: String,
        /// Raw type-specific data from `SSH_MSG_CHANNEL_OPEN`.
        payload: Bytes,
    },
}

impl ChannelKind {
    /// The channel type string, such as `"session"`.
    pub fn channel_type(&self) -> &str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpip { .. } => "direct-tcpip",
            ChannelKind::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelKind::X11 { .. } => "x11",
            ChannelKind::Other { channel_type, .. } => channel_type,
        }
    }

    pub(super) fn encode_payload(&self, buf: &mut Buffer) {
        match self {
            ChannelKind::Session => {},
            ChannelKind::DirectTcpip { host, port, originator_host, originator_port } => {
                buf.put_str(host);
                buf.put_u32(*port);
                buf.put_str(originator_host);
                buf.put_u32(*originator_port);
            },
            ChannelKind::ForwardedTcpip {
                connected_host, connected_port, originator_host, originator_port,
            } => {
                buf.put_str(connected_host);
                buf.put_u32(*connected_port);
                buf.put_str(originator_host);
                buf.put_u32(*originator_port);
            },
            ChannelKind::X11 { originator_host, originator_port } => {
                buf.put_str(originator_host);
                buf.put_u32(*originator_port);
            },
            ChannelKind::Other { payload, .. } => buf.put_raw(payload),
        }
    }

    pub(super) fn decode(channel_type: String, payload: &mut Buffer) -> Result<ChannelKind> {
        Ok(match channel_type.as_str() {
            "session" => ChannelKind::Session,
            "direct-tcpip" => ChannelKind::DirectTcpip {
                host: payload.get_string()?,
                port: payload.get_u32()?,
                originator_host: payload.get_string()?,
                originator_port: payload.get_u32()?,
            },
            "forwarded-tcpip" => ChannelKind::ForwardedTcpip {
                connected_host: payload.get_string()?,
                connected_port: payload.get_u32()?,
                originator_host: payload.get_string()?,
                originator_port: payload.get_u32()?,
            },
            "x11" => ChannelKind::X11 {
                originator_host: payload.get_string()?,
                originator_port: payload.get_u32()?,
            },
            _ => ChannelKind::Other { channel_type, payload: payload.take_unread() },
        })
    }
}


/// Configuration of a channel.
///
/// The defaults should work for most purposes; use [`ChannelConfig::with()`] to change the
/// fields that you need.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ChannelConfig {
    /// Maximum size of the window of data that the server may send to us.
    ///
    /// This bounds the amount of data that we buffer for the channel, when you don't receive it
    /// from the [`ChannelReceiver`].
    pub recv_window_max: u32,

    /// Maximum size of a data packet that the server may send to us.
    pub recv_packet_len_max: u32,

    /// Number of received bytes that we take before we adjust the window.
    ///
    /// Defaults to one eighth of [`recv_window_max`][Self::recv_window_max]. Lower values keep
    /// the window fuller, at the price of more `SSH_MSG_CHANNEL_WINDOW_ADJUST` messages.
    pub window_adjust_threshold: Option<u32>,

    /// Timeout for opening the channel.
    pub open_timeout: Option<Duration>,

    /// Timeout for each wait for window space in [`Channel::send_data()`].
    pub send_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            recv_window_max: 2 * 1024 * 1024,
            recv_packet_len_max: 32 * 1024,
            window_adjust_threshold: None,
            open_timeout: None,
            send_timeout: None,
        }
    }
}

impl ChannelConfig {
    /// Update the configuration in pseudo-builder pattern style.
    pub fn with<F: FnOnce(&mut Self)>(mut self, f: F) -> Self {
        f(&mut self);
        self
    }

    pub(super) fn adjust_threshold(&self) -> u32 {
        self.window_adjust_threshold.unwrap_or(self.recv_window_max / 8)
    }
}


/// Receives channels that the server opens to us.
///
/// Register an opener for a channel type with
/// [`Client::register_opener()`][super::Client::register_opener]. When the server opens a channel
/// of that type, we call [`open()`][Self::open] with an [`AcceptChannel`], which you should
/// accept or reject. Channel types without an opener are rejected with "unknown channel type".
///
/// The opener is called while the client state is locked, so it must return quickly and it must
/// not call [`AcceptChannel::accept()`] directly. Typically, you will use the implementation for
/// [`mpsc::UnboundedSender`] or [`mpsc::Sender`] and handle the channels in another task.
pub trait ChannelOpener: Send {
    /// Handle a channel opened by the server.
    fn open(&mut self, accept: AcceptChannel);
}

impl ChannelOpener for mpsc::UnboundedSender<AcceptChannel> {
    fn open(&mut self, accept: AcceptChannel) {
        // if the receiver is gone, dropping the `AcceptChannel` rejects the channel
        let _ = self.send(accept);
    }
}

impl ChannelOpener for mpsc::Sender<AcceptChannel> {
    fn open(&mut self, accept: AcceptChannel) {
        if let Err(err) = self.try_send(accept) {
            log::debug!("could not pass incoming channel to the opener: {}", err);
        }
    }
}

/// Channel opened by the server that waits for our decision.
///
/// You must call [`accept()`][Self::accept] or [`reject()`][Self::reject]. If you drop this object,
/// we reject the channel as "administratively prohibited".
pub struct AcceptChannel {
    pub(super) shared: Weak<Shared>,
    pub(super) reject_tx: mpsc::UnboundedSender<(u32, ChannelOpenError)>,
    pub(super) our_id: u32,
    pub(super) kind: ChannelKind,
    pub(super) answered: bool,
}

impl AcceptChannel {
    /// The type of the channel with the type-specific fields.
    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    /// Accept the channel.
    ///
    /// This sends `SSH_MSG_CHANNEL_OPEN_CONFIRMATION` (RFC 4254, section 5.1) and returns the
    /// channel.
    pub fn accept(mut self, config: ChannelConfig) -> Result<(Channel, ChannelReceiver)> {
        self.answered = true;
        let shared = self.shared.upgrade().ok_or(Error::SessionClosed)?;
        let our_id = self.our_id;
        let (event_rx, request_timeout) = client_state::with_state(&shared, |st| {
            let event_rx = st.conn.accept_channel(&mut st.tr, our_id, &config)?;
            Ok((event_rx, st.tr.config.request_timeout))
        })?;

        let channel = Channel {
            shared: shared.clone(),
            our_id,
            send_timeout: config.send_timeout,
            request_timeout,
        };
        let channel_rx = ChannelReceiver { shared, our_id, event_rx };
        Ok((channel, channel_rx))
    }

    /// Reject the channel.
    ///
    /// This sends `SSH_MSG_CHANNEL_OPEN_FAILURE` with the given reason code (see
    /// [`codes::open`][crate::codes::open]) and description.
    pub fn reject(mut self, reason_code: u32, description: &str) {
        self.answered = true;
        let error = ChannelOpenError::new(reason_code, description);
        let _ = self.reject_tx.send((self.our_id, error));
    }
}

impl Drop for AcceptChannel {
    fn drop(&mut self) {
        if !self.answered {
            let error = ChannelOpenError::new(open::ADMINISTRATIVELY_PROHIBITED, "administratively prohibited");
            let _ = self.reject_tx.send((self.our_id, error));
        }
    }
}

impl std::fmt::Debug for AcceptChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AcceptChannel")
            .field("our_id", &self.our_id)
            .field("kind", &self.kind)
            .finish()
    }
}
