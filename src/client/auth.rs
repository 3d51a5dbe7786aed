use std::sync::Arc;
use crate::codec::Buffer;
use crate::codes::msg;
use crate::error::{Error, Result};
use super::client_event::{AuthBanner, ClientEvent};
use super::client_state::SERVICE_CONN;
use super::pending::{PendingReply, PendingSlot};
use super::service::{waiter_error, Service};
use super::transport::{PacketSeq, Transport};

/// Result of an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum AuthResult {
    /// The user is authenticated, you can now open channels.
    Success,
    /// The server rejected the attempt.
    Failure(AuthFailure),
}

/// Message sent by the server when authentication attempt fails.
///
/// This corresponds to `SSH_MSG_USERAUTH_FAILURE` (RFC 4252, section 5.1). Note that this may
/// actually represent a [partial success][Self::partial_success].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// Authentication methods that may productively continue the authentication.
    ///
    /// Note that the server must not list the `"none"` method here, even if it is supported.
    pub methods_can_continue: Vec<String>,

    /// True if the authentication request was successful, but the authentication should continue.
    ///
    /// For example, this might be used if the server requires that you pass multiple
    /// authentications before continuing.
    pub partial_success: bool,
}

/// Authentication method supported by [`AuthService`].
#[derive(Debug, Copy, Clone)]
pub(super) enum AuthMethod<'a> {
    None,
    Password(&'a str),
}

impl AuthMethod<'_> {
    fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
        }
    }
}

/// The "ssh-userauth" service (RFC 4252).
#[derive(Debug, Default)]
pub(super) struct AuthService {
    pending: Option<PendingAuth>,
    authenticated: bool,
}

#[derive(Debug)]
struct PendingAuth {
    method_name: &'static str,
    packet_seq: PacketSeq,
    slot: PendingSlot<AuthResult>,
}

impl AuthService {
    /// Sends an authentication request.
    ///
    /// Returns `None` if the user is already authenticated.
    pub fn start(
        &mut self,
        tr: &mut Transport,
        username: &str,
        method: AuthMethod,
    ) -> Result<Option<PendingReply<AuthResult>>> {
        if self.authenticated {
            return Ok(None)
        } else if self.pending.is_some() {
            return Err(Error::AuthPending)
        }

        // RFC 4252, sections 5 and 8
        let mut payload = Buffer::new();
        payload.put_u8(msg::USERAUTH_REQUEST);
        payload.put_str(username);
        payload.put_str(SERVICE_CONN);
        payload.put_str(method.name());
        if let AuthMethod::Password(password) = method {
            payload.put_bool(false);
            payload.put_str(password);
        }
        let packet_seq = tr.send_packet(&payload.finish())?;
        log::debug!("sending SSH_MSG_USERAUTH_REQUEST for method {:?}", method.name());

        let (slot, reply) = PendingSlot::new();
        self.pending = Some(PendingAuth { method_name: method.name(), packet_seq, slot });
        Ok(Some(reply))
    }

    fn recv_success(&mut self, tr: &mut Transport) -> Result<()> {
        let Some(mut pending) = self.pending.take() else {
            return Err(Error::Protocol("received unexpected SSH_MSG_USERAUTH_SUCCESS"))
        };
        log::debug!("received SSH_MSG_USERAUTH_SUCCESS for method {:?}", pending.method_name);
        self.authenticated = true;
        tr.set_authenticated();
        pending.slot.resolve(Ok(AuthResult::Success));
        Ok(())
    }

    fn recv_failure(&mut self, payload: &mut Buffer) -> Result<()> {
        let failure = AuthFailure {
            methods_can_continue: payload.get_name_list()?,
            partial_success: payload.get_bool()?,
        };
        let Some(mut pending) = self.pending.take() else {
            return Err(Error::Protocol("received unexpected SSH_MSG_USERAUTH_FAILURE"))
        };
        log::debug!("received SSH_MSG_USERAUTH_FAILURE for method {:?}: {:?}",
            pending.method_name, failure);
        pending.slot.resolve(Ok(AuthResult::Failure(failure)));
        Ok(())
    }

    fn recv_banner(&mut self, tr: &mut Transport, payload: &mut Buffer) -> Result<()> {
        let banner = AuthBanner {
            message: payload.get_string()?,
            message_lang: payload.get_string()?,
        };
        log::info!("authentication banner from server: {:?}", banner.message);
        tr.send_event(ClientEvent::AuthBanner(banner));
        Ok(())
    }

    fn recv_passwd_changereq(&mut self, payload: &mut Buffer) -> Result<()> {
        match self.pending.take() {
            Some(mut pending) if pending.method_name == "password" => {
                let prompt = payload.get_string()?;
                payload.get_string()?; // language tag
                log::debug!("received SSH_MSG_USERAUTH_PASSWD_CHANGEREQ: {:?}", prompt);
                // changing the password is not supported, so the attempt has failed
                let failure = AuthFailure { methods_can_continue: Vec::new(), partial_success: false };
                pending.slot.resolve(Ok(AuthResult::Failure(failure)));
                Ok(())
            },
            pending => {
                self.pending = pending;
                Err(Error::PacketNotImplemented(msg::USERAUTH_PASSWD_CHANGEREQ))
            },
        }
    }
}

impl Service for AuthService {
    fn name(&self) -> &'static str {
        "ssh-userauth"
    }

    fn handle(&mut self, tr: &mut Transport, msg_id: u8, payload: &mut Buffer) -> Result<()> {
        match msg_id {
            msg::USERAUTH_SUCCESS => self.recv_success(tr),
            msg::USERAUTH_FAILURE => self.recv_failure(payload),
            msg::USERAUTH_BANNER => self.recv_banner(tr, payload),
            msg::USERAUTH_PASSWD_CHANGEREQ => self.recv_passwd_changereq(payload),
            _ => Err(Error::PacketNotImplemented(msg_id)),
        }
    }

    fn notify_error(&mut self, err: &Arc<Error>) {
        if let Some(mut pending) = self.pending.take() {
            pending.slot.resolve(Err(waiter_error(err)));
        }
    }

    fn notify_unimplemented(&mut self, tr: &mut Transport, packet_seq: u32) -> Result<()> {
        match self.pending.take() {
            Some(mut pending) if tr.packet_seq(pending.packet_seq) == Some(packet_seq) => {
                pending.slot.resolve(Err(Error::AuthFailed));
            },
            pending => self.pending = pending,
        }
        Ok(())
    }
}
