//! Asynchronous SSH 2.0 client in pure Rust.
//!
//! Tsuna implements the client side of the SSH transport layer (RFC 4253), the "none" and
//! "password" methods of user authentication (RFC 4252) and the connection protocol (RFC 4254)
//! with interactive sessions and TCP/IP tunnels, on top of any Tokio I/O stream.
//!
//! - Entry point for making SSH connections is the [`Client`].
//! - Supported algorithms are listed in the [`kex`], [`pubkey`], [`cipher`], [`mac`] and
//! [`compress`] modules.
//! - Numeric constants of the protocol are in the [`codes`] module.
//!
#![allow(clippy::collapsible_if)]
#![allow(clippy::module_inception)]
#![allow(clippy::type_complexity)]
#![warn(missing_docs)]

pub use crate::client::{AuthFailure, AuthResult};
pub use crate::client::{
    AcceptChannel, Channel, ChannelConfig, ChannelEvent, ChannelKind, ChannelOpener, ChannelPhase,
    ChannelReceiver, ChannelReply, DataType, ExitSignal, DATA_STANDARD, DATA_STDERR,
};
pub use crate::client::{Client, ClientConfig, ClientFuture, ClientReceiver, HostKeyVerifier, Phase};
pub use crate::client::{AuthBanner, ClientEvent, DebugMsg};
pub use crate::client::{
    PtyRequest, Session, SessionEvent, SessionReceiver, SessionReply, WindowChange,
};
pub use crate::client::{Tunnel, TunnelEvent, TunnelReceiver};
pub use crate::codec::Buffer;
pub use crate::error::{
    AlgoNegotiateError, ChannelOpenError, DisconnectError, Error, OpenFailure, Result,
};
pub use crate::util::CryptoRngCore;

pub use self::cipher::CipherAlgo;
pub use self::compress::CompressAlgo;
pub use self::kex::KexAlgo;
pub use self::mac::MacAlgo;
pub use self::pubkey::{Pubkey, PubkeyAlgo};

pub use bytes;

pub mod cipher;
mod client;
mod codec;
pub mod codes;
pub mod compress;
mod error;
pub mod kex;
pub mod mac;
pub mod pubkey;
mod util;
