/// An event returned from [`ClientReceiver`][super::ClientReceiver].
///
/// Events that concern the whole connection rather than one channel. None of them needs an
/// answer, but the queue behind [`ClientReceiver`][super::ClientReceiver] is unbounded, so either
/// keep draining it or drop the receiver.
///
/// New variants may be added in minor releases (`#[non_exhaustive]`).
#[non_exhaustive]
#[derive(Debug)]
pub enum ClientEvent {
    /// `SSH_MSG_DEBUG` from the server (RFC 4253, section 11.3).
    DebugMsg(DebugMsg),

    /// `SSH_MSG_USERAUTH_BANNER` from the server (RFC 4252, section 5.4), a text to show the user
    /// while authenticating.
    AuthBanner(AuthBanner),
}

/// Payload of [`ClientEvent::DebugMsg`].
#[derive(Debug)]
pub struct DebugMsg {
    /// The server asks for the message to be shown to the user.
    pub always_display: bool,
    /// Text of the message.
    pub message: String,
    /// RFC 3066 language tag of `message`.
    pub message_lang: String,
}

/// Payload of [`ClientEvent::AuthBanner`].
#[derive(Debug)]
pub struct AuthBanner {
    /// Text of the banner.
    pub message: String,
    /// RFC 3066 language tag of `message`.
    pub message_lang: String,
}
