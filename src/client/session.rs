use bytes::Bytes;
use std::future::poll_fn;
use std::task::{ready, Context, Poll};
use crate::codec::Buffer;
use crate::error::Result;
use super::channel::{
    Channel, ChannelEvent, ChannelReceiver, ChannelReply, ExitSignal, DATA_STANDARD, DATA_STDERR,
};

/// Handle to an SSH session.
///
/// SSH session (RFC 4254, section 6) corresponds to the execution of a single process. The
/// [`Session`] is used to send requests and data to the server, and [`SessionReceiver`] will
/// receive the data and events from the server. To open the session, use
/// [`Client::open_session()`][super::Client::open_session].
///
/// Once the session is open, you will typically go through three stages:
/// - prepare the execution environment: [`env()`][Self::env()],
/// [`request_pty()`][Self::request_pty()],
/// - start the execution: [`shell()`][Self::shell()], [`exec()`][Self::exec()],
/// [`subsystem()`][Self::subsystem()],
/// - interact with the process: [`send_stdin()`][Self::send_stdin()],
/// [`send_eof()`][Self::send_eof()], [`signal()`][Self::signal()],
/// [`window_change()`][Self::window_change()].
///
/// In parallel, you will handle the events produced by [`SessionReceiver`].
///
/// An SSH session is a particular type of an SSH channel. However, this object provides higher
/// level API than a raw [`Channel`].
///
/// You can cheaply clone this object and safely share the clones between tasks.
#[derive(Clone)]
pub struct Session {
    channel: Channel,
}

impl Session {
    pub(super) fn new(channel: Channel, channel_rx: ChannelReceiver) -> (Session, SessionReceiver) {
        (Session { channel }, SessionReceiver { channel_rx })
    }

    /// Close the session.
    ///
    /// We won't send any further requests or data to the server and the session will be closed
    /// once the server acknowledges our request.
    ///
    /// This method is idempotent: if the session is already closed or closing, we do nothing.
    pub fn close(&self) -> Result<()> {
        self.channel.close()
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    fn request(&self, request_type: &str, payload: Buffer) -> Result<SessionReply> {
        let reply = self.channel.send_request(request_type, &payload.finish())?;
        Ok(SessionReply { reply })
    }
}

/// # Preparing the execution environment
///
/// Use these methods to configure the session before starting the process.
impl Session {
    /// Pass an environment variable to the future process.
    ///
    /// This will set an environment variable for the process that will be started later. Note
    /// that servers usually accept only a few variables, such as `LANG`.
    ///
    /// This method returns immediately without any blocking, but you may use the returned
    /// [`SessionReply`] to wait for the server response.
    pub fn env(&self, name: &[u8], value: &[u8]) -> Result<SessionReply> {
        let mut payload = Buffer::new();
        payload.put_bytes(name);
        payload.put_bytes(value);
        self.request("env", payload)
    }

    /// Request a pseudo-terminal for the future process.
    ///
    /// This sends the "pty-req" request (RFC 4254, section 6.2). We only forward the request,
    /// terminal emulation is up to you.
    ///
    /// This method returns immediately without any blocking, but you may use the returned
    /// [`SessionReply`] to wait for the server response.
    pub fn request_pty(&self, request: &PtyRequest) -> Result<SessionReply> {
        let mut payload = Buffer::new();
        payload.put_str(&request.term);
        payload.put_u32(request.width);
        payload.put_u32(request.height);
        payload.put_u32(request.width_px);
        payload.put_u32(request.height_px);
        payload.put_bytes(&encode_modes(&request.modes));
        self.request("pty-req", payload)
    }
}

/// # Starting the process
///
/// Use one of these methods to start the remote process. Only one of them can succeed, you cannot
/// start multiple processes with a single session (but you may open multiple sessions).
impl Session {
    /// Start the user's default shell on the server.
    ///
    /// This method returns immediately without any blocking, but you may use the returned
    /// [`SessionReply`] to wait for the server response.
    pub fn shell(&self) -> Result<SessionReply> {
        self.request("shell", Buffer::new())
    }

    /// Start a command on the server.
    ///
    /// This method returns immediately without any blocking, but you may use the returned
    /// [`SessionReply`] to wait for the server response.
    pub fn exec(&self, command: &[u8]) -> Result<SessionReply> {
        let mut payload = Buffer::new();
        payload.put_bytes(command);
        self.request("exec", payload)
    }

    /// Start an SSH subsystem on the server.
    ///
    /// Subsystems are described in RFC 4254, section 6.5.
    ///
    /// This method returns immediately without any blocking, but you may use the returned
    /// [`SessionReply`] to wait for the server response.
    pub fn subsystem(&self, subsystem_name: &str) -> Result<SessionReply> {
        let mut payload = Buffer::new();
        payload.put_str(subsystem_name);
        self.request("subsystem", payload)
    }
}

/// # Interacting with a running process
impl Session {
    /// Send data to the standard input of the running process.
    ///
    /// This method returns after all bytes have been accepted by the flow control mechanism and
    /// written to the internal send buffer, but before we send them to the socket (or other I/O
    /// stream that backs this SSH connection).
    pub async fn send_stdin(&self, data: Bytes) -> Result<()> {
        self.channel.send_data(data, DATA_STANDARD).await
    }

    /// Close the standard input of the running process.
    ///
    /// If the session is closed before you call this method, we quietly ignore this error and
    /// return `Ok`.
    pub fn send_eof(&self) -> Result<()> {
        self.channel.send_eof()
    }

    /// Deliver a signal to the running process.
    ///
    /// Signal names are described in RFC 4254, section 6.10.
    /// [`codes::signal`][crate::codes::signal] lists the signal names defined by SSH.
    ///
    /// This method returns immediately without any blocking, it is not possible to get a reply
    /// from the server.
    pub fn signal(&self, signal_name: &str) -> Result<()> {
        let mut payload = Buffer::new();
        payload.put_str(signal_name);
        self.channel.send_request_no_reply("signal", &payload.finish())
    }

    /// Notify the process that the size of the terminal has changed.
    ///
    /// This sends the "window-change" request (RFC 4254, section 6.7), which has no reply.
    pub fn window_change(&self, change: &WindowChange) -> Result<()> {
        let mut payload = Buffer::new();
        payload.put_u32(change.width);
        payload.put_u32(change.height);
        payload.put_u32(change.width_px);
        payload.put_u32(change.height_px);
        self.channel.send_request_no_reply("window-change", &payload.finish())
    }
}


/// Future server response to a [`Session`] request.
///
/// You may either wait for the reply using [`.want_reply()`][Self::want_reply], or ignore the
/// reply using [`.no_reply()`][Self::no_reply].
#[derive(Debug)]
#[must_use = "please use .want_reply() to await the reply, or .no_reply() to ignore it"]
pub struct SessionReply {
    reply: ChannelReply,
}

impl SessionReply {
    /// Wait for the reply from the server.
    ///
    /// If the request failed, this returns an error ([`Error::ChannelReq`][crate::Error::ChannelReq]).
    pub async fn want_reply(self) -> Result<()> {
        self.reply.want_reply().await
    }

    /// Ignore the reply.
    ///
    /// This just drops the [`SessionReply`], but it is a good practice to do this explicitly with
    /// this method.
    pub fn no_reply(self) {}
}


/// Pseudo-terminal request for [`Session::request_pty()`].
///
/// The dimensions in characters override the dimensions in pixels when they are nonzero (RFC
/// 4254, section 6.2).
#[derive(Debug, Clone, Default)]
pub struct PtyRequest {
    /// Value of the `TERM` environment variable, such as `"xterm-256color"`.
    pub term: String,
    /// Terminal width in characters.
    pub width: u32,
    /// Terminal height in rows.
    pub height: u32,
    /// Terminal width in pixels.
    pub width_px: u32,
    /// Terminal height in pixels.
    pub height_px: u32,
    /// Terminal modes as pairs of opcode and argument (RFC 4254, section 8).
    pub modes: Vec<(u8, u32)>,
}

/// Change of the terminal size for [`Session::window_change()`].
#[derive(Debug, Copy, Clone, Default)]
pub struct WindowChange {
    /// Terminal width in characters.
    pub width: u32,
    /// Terminal height in rows.
    pub height: u32,
    /// Terminal width in pixels.
    pub width_px: u32,
    /// Terminal height in pixels.
    pub height_px: u32,
}

fn encode_modes(modes: &[(u8, u32)]) -> Bytes {
    let mut buf = Buffer::new();
    for &(opcode, arg) in modes {
        // opcodes from 160 up have an undefined argument, we cannot encode them
        if (1..160).contains(&opcode) {
            buf.put_u8(opcode);
            buf.put_u32(arg);
        }
    }
    // TTY_OP_END
    buf.put_u8(0);
    buf.finish()
}


/// An event returned from [`SessionReceiver`].
///
/// These are events related to a particular SSH session, they correspond to the requests and data
/// sent by the server.
///
/// This enum is marked as `#[non_exhaustive]`, so that we can add new variants without breaking
/// backwards compatibility. It should always be safe to ignore any events that you don't intend to
/// handle.
#[derive(Debug)]
#[non_exhaustive]
pub enum SessionEvent {
    /// Data from the standard output of the running process.
    ///
    /// You should handle this data as a byte stream, the boundaries between consecutive
    /// `StdoutData` events might be arbitrary.
    StdoutData(Bytes),

    /// Data from the standard error of the running process.
    ///
    /// You should handle this data as a byte stream, the boundaries between consecutive
    /// `StderrData` events might be arbitrary.
    StderrData(Bytes),

    /// End-of-file marker from the running process.
    ///
    /// After this, the server should not send more data (both stdout and stderr).
    Eof,

    /// The process terminated with given exit status.
    ExitStatus(u32),

    /// The process terminated violently due to a signal.
    ExitSignal(ExitSignal),
}

/// Receiving half of a [`Session`].
///
/// [`SessionReceiver`] produces [`SessionEvent`]s, which correspond to the requests and data sent
/// by the server on the channel. If you stop receiving, the server will stop sending output once
/// the flow control window fills up.
pub struct SessionReceiver {
    channel_rx: ChannelReceiver,
}

impl SessionReceiver {
    /// Wait for the next event.
    ///
    /// Returns `None` if the session was closed.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Poll-friendly variant of [`.recv()`][Self::recv()].
    pub fn poll_recv(&mut self, cx: &mut Context) -> Poll<Option<SessionEvent>> {
        loop {
            match ready!(self.channel_rx.poll_recv(cx)) {
                Some(channel_event) => match translate_event(channel_event) {
                    Some(event) => return Poll::Ready(Some(event)),
                    None => continue,
                },
                None => return Poll::Ready(None),
            }
        }
    }
}

fn translate_event(event: ChannelEvent) -> Option<SessionEvent> {
    match event {
        ChannelEvent::Data(data, DATA_STANDARD) => Some(SessionEvent::StdoutData(data)),
        ChannelEvent::Data(data, DATA_STDERR) => Some(SessionEvent::StderrData(data)),
        ChannelEvent::Data(_, data_type) => {
            log::debug!("ignoring session data of type {:?}", data_type);
            None
        },
        ChannelEvent::Eof => Some(SessionEvent::Eof),
        ChannelEvent::ExitStatus(status) => Some(SessionEvent::ExitStatus(status)),
        ChannelEvent::ExitSignal(signal) => Some(SessionEvent::ExitSignal(signal)),
    }
}
