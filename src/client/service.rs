use std::sync::Arc;
use crate::codec::Buffer;
use crate::error::{Error, Result};
use super::transport::Transport;

/// A service running on top of the transport layer (RFC 4253, section 10).
///
/// The reader task routes every packet with a message number of 50 or higher to the active
/// service.
pub(super) trait Service {
    fn name(&self) -> &'static str;

    /// Handles a packet; `payload` is positioned after the message id.
    ///
    /// Returns [`Error::PacketNotImplemented`] for packets that the service does not know.
    fn handle(&mut self, tr: &mut Transport, msg_id: u8, payload: &mut Buffer) -> Result<()>;

    /// The session has failed or was closed, all pending operations must be resolved with
    /// `err`.
    fn notify_error(&mut self, err: &Arc<Error>);

    /// The peer did not understand our packet with sequence number `packet_seq`.
    fn notify_unimplemented(&mut self, tr: &mut Transport, packet_seq: u32) -> Result<()>;
}

/// The error that operations waiting on a dead session should fail with.
pub(super) fn waiter_error(err: &Arc<Error>) -> Error {
    match **err {
        Error::SessionClosed => Error::SessionClosed,
        _ => Error::SessionFailed(err.clone()),
    }
}
