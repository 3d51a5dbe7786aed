use std::fmt;
use std::sync::Arc;
use crate::codes::{disconnect, open};

/// Result type for our [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error that occured while handling SSH connection.
///
/// Errors fall into three groups, which callers usually want to handle differently:
///
/// - errors that killed the whole session (see [`is_session_fatal()`][Self::is_session_fatal]),
/// - errors that only reject one operation, such as [`ChannelOpen`][Self::ChannelOpen] or
/// [`ChannelReq`][Self::ChannelReq], after which the session and other channels keep working,
/// - [`Timeout`][Self::Timeout], after which the operation may be retried.
///
/// This enum is `#[non_exhaustive]`, so we reserve the right to add more variants and don't
/// consider this to break backwards compatibility.
#[derive(thiserror::Error, Debug)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum Error {
    #[error("cryptography error: {0}")]
    Crypto(&'static str),
    #[error("mac verification failed")]
    Mac,
    #[error("signature verification failed")]
    Signature,
    #[error("server host key was not accepted by the verifier")]
    HostKeyNotVerifiable,
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("buffer underflow: {0}")]
    Underflow(&'static str),
    #[error("could not negotiate algorithm: {0}")]
    AlgoNegotiate(AlgoNegotiateError),
    #[error("key exchange failed: {0}")]
    Kex(&'static str),
    #[error("packet {0} not implemented")]
    PacketNotImplemented(u8),
    #[error("compression error")]
    Compress(#[from] flate2::CompressError),
    #[error("decompression error")]
    Decompress(#[from] flate2::DecompressError),
    #[error("timed out")]
    Timeout,
    #[error("service {0:?} is not supported")]
    ServiceNotSupported(String),
    #[error("authentication failed")]
    AuthFailed,
    #[error("another authentication request is pending")]
    AuthPending,
    #[error("user is not authenticated")]
    NotAuthenticated,
    #[error("channel is closed")]
    ChannelClosed,
    #[error("end of file was already sent on the channel")]
    ChannelEofSent,
    #[error("could not open channel: {0}")]
    ChannelOpen(ChannelOpenError),
    #[error("channel request failed")]
    ChannelReq,
    #[error("global request failed")]
    GlobalReq,
    #[error("IO error when reading")]
    ReadIo(#[source] std::io::Error),
    #[error("IO error when writing")]
    WriteIo(#[source] std::io::Error),
    #[error("connection unexpectedly closed by peer")]
    PeerClosed,
    #[error("peer disconnected: {0}")]
    PeerDisconnected(DisconnectError),
    #[error("session failed")]
    SessionFailed(#[source] Arc<Error>),
    #[error("session was closed")]
    SessionClosed,
}

impl Error {
    /// True if this error means that the session is dead.
    ///
    /// All further operations on the session will fail, so there is no point in retrying.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self,
            Error::Timeout | Error::ChannelOpen(_) | Error::ChannelReq | Error::GlobalReq |
            Error::ChannelClosed | Error::ChannelEofSent | Error::AuthFailed | Error::AuthPending |
            Error::NotAuthenticated | Error::ServiceNotSupported(_))
    }

    /// True if this error is a local timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// The reason code that we send in `SSH_MSG_DISCONNECT` when this error kills the session.
    ///
    /// Returns `None` if we should not send a disconnect message at all: when the peer has
    /// disconnected or closed the connection, or when the connection is broken.
    pub(crate) fn disconnect_reason(&self) -> Option<u32> {
        Some(match self {
            Error::Mac => disconnect::MAC_ERROR,
            Error::AlgoNegotiate(_) | Error::Kex(_) | Error::Signature | Error::Crypto(_) =>
                disconnect::KEY_EXCHANGE_FAILED,
            Error::HostKeyNotVerifiable => disconnect::HOST_KEY_NOT_VERIFIABLE,
            Error::Compress(_) | Error::Decompress(_) => disconnect::COMPRESSION_ERROR,
            Error::Protocol(_) | Error::Underflow(_) | Error::PacketNotImplemented(_) =>
                disconnect::PROTOCOL_ERROR,
            Error::PeerDisconnected(_) | Error::PeerClosed |
            Error::ReadIo(_) | Error::WriteIo(_) => return None,
            _ => disconnect::BY_APPLICATION,
        })
    }
}

/// Error that occured because we could not negotiate an algorithm.
///
/// During the SSH key exchange, the client and the server must negotiate which cryptographic
/// algorithms (such as ciphers or MACs) to use, as described in RFC 4253, section 7.1. This error
/// occurs when there is no intersection between our list and the server's list.
#[derive(Debug, Clone, thiserror::Error)]
#[error("for {algo_name:}, our algos are {our_algos:?}, their algos are {their_algos:?}")]
pub struct AlgoNegotiateError {
    /// Human readable name of the algorithm slot.
    pub algo_name: String,
    /// The algorithms proposed by us (the client).
    pub our_algos: Vec<String>,
    /// The algorithms proposed by them (the server).
    pub their_algos: Vec<String>,
}

/// Error that occured because one side disconnected.
///
/// This corresponds to the `SSH_MSG_DISCONNECT` packet described in RFC 4253, section 11.1.
#[derive(Debug, Clone, thiserror::Error)]
pub struct DisconnectError {
    /// Machine-readable reason code (see [`codes::disconnect`][crate::codes::disconnect]).
    pub reason_code: u32,
    /// Human-readable description of the error.
    pub description: String,
    /// Language tag of `description` (per RFC 3066).
    pub description_lang: String,
}

impl DisconnectError {
    /// Disconnect "by application" with the given description.
    pub fn by_app(description: impl Into<String>) -> Self {
        Self {
            reason_code: disconnect::BY_APPLICATION,
            description: description.into(),
            description_lang: String::new(),
        }
    }

    /// Translates the [`reason_code`][Self::reason_code] into a string.
    pub fn reason_to_str(&self) -> Option<&'static str> {
        disconnect::to_str(self.reason_code)
    }
}

impl fmt::Display for DisconnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_reason(f, disconnect::to_str(self.reason_code), self.reason_code, &self.description)
    }
}

/// Error that occured when opening a channel.
///
/// This corresponds to the `SSH_MSG_CHANNEL_OPEN_FAILURE` packet described in RFC 4254, section
/// 5.1. Use [`reason()`][Self::reason] to get the failure as an enum.
#[derive(Debug, Clone, thiserror::Error)]
pub struct ChannelOpenError {
    /// Machine-readable reason code (see [`codes::open`][crate::codes::open]).
    pub reason_code: u32,
    /// Human-readable description of the error.
    pub description: String,
    /// Language tag of `description` (per RFC 3066).
    pub description_lang: String,
}

/// Typed reason of a [`ChannelOpenError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum OpenFailure {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
    Other(u32),
}

impl ChannelOpenError {
    /// Create an error with the given reason code and description.
    pub fn new(reason_code: u32, description: impl Into<String>) -> Self {
        Self { reason_code, description: description.into(), description_lang: String::new() }
    }

    /// The typed reason of the failure.
    pub fn reason(&self) -> OpenFailure {
        match self.reason_code {
            open::ADMINISTRATIVELY_PROHIBITED => OpenFailure::AdministrativelyProhibited,
            open::CONNECT_FAILED => OpenFailure::ConnectFailed,
            open::UNKNOWN_CHANNEL_TYPE => OpenFailure::UnknownChannelType,
            open::RESOURCE_SHORTAGE => OpenFailure::ResourceShortage,
            code => OpenFailure::Other(code),
        }
    }
}

impl fmt::Display for ChannelOpenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_reason(f, open::to_str(self.reason_code), self.reason_code, &self.description)
    }
}

fn fmt_reason(
    f: &mut fmt::Formatter,
    reason: Option<&'static str>,
    reason_code: u32,
    description: &str,
) -> fmt::Result {
    write!(f, "peer returned error ")?;
    if let Some(reason) = reason {
        write!(f, "`{}` ({})", reason, reason_code)?;
    } else {
        write!(f, "{}", reason_code)?;
    }
    if !description.is_empty() {
        write!(f, ": {:?}", description)?;
    }
    Ok(())
}
