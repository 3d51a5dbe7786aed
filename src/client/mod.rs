pub use self::auth::{AuthFailure, AuthResult};
pub use self::channel::{
    AcceptChannel, Channel, ChannelConfig, ChannelEvent, ChannelKind, ChannelOpener, ChannelPhase,
    ChannelReceiver, ChannelReply, DataType, ExitSignal, DATA_STANDARD, DATA_STDERR,
};
pub use self::client::{Client, ClientConfig, ClientFuture, ClientReceiver, HostKeyVerifier};
pub use self::client_event::{AuthBanner, ClientEvent, DebugMsg};
pub use self::session::{
    PtyRequest, Session, SessionEvent, SessionReceiver, SessionReply, WindowChange,
};
pub use self::transport::Phase;
pub use self::tunnel::{Tunnel, TunnelEvent, TunnelReceiver};

mod auth;
mod channel;
mod channel_state;
mod client;
mod client_event;
mod client_state;
mod conn;
mod negotiate;
mod pending;
mod recv;
mod service;
mod session;
mod transport;
mod tunnel;
#[cfg(test)] mod tests;
