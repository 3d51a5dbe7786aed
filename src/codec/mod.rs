//! Encoding of SSH primitive types and of the binary packet protocol.
pub use self::buffer::Buffer;
pub(crate) use self::recv_pipe::{RecvPipe, RecvPacket, DecryptKeys};
pub(crate) use self::send_pipe::{SendPipe, EncryptKeys};

/// Both directions of the packet stream of one connection.
pub(crate) struct Codec {
    pub recv_pipe: RecvPipe,
    pub send_pipe: SendPipe,
}

mod buffer;
mod recv_pipe;
mod send_pipe;
