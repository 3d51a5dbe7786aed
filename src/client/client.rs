use bytes::Bytes;
use parking_lot::Mutex;
use rand::SeedableRng as _;
use rand::rngs::OsRng;
use std::future::{poll_fn, Future};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use crate::cipher::{self, CipherAlgo};
use crate::codec::Buffer;
use crate::compress::{self, CompressAlgo};
use crate::error::{DisconnectError, Error, Result};
use crate::kex::{self, KexAlgo};
use crate::mac::{self, MacAlgo};
use crate::pubkey::{self, Pubkey, PubkeyAlgo};
use super::auth::{AuthMethod, AuthResult};
use super::channel::{Channel, ChannelConfig, ChannelKind, ChannelOpener, ChannelReceiver};
use super::client_event::ClientEvent;
use super::client_state::{self, Shared, ServiceKind, SERVICE_AUTH};
use super::negotiate;
use super::session::{Session, SessionReceiver};
use super::transport::Phase;
use super::tunnel::{Tunnel, TunnelReceiver};

/// Handle to an SSH connection.
///
/// Use this object to send requests to the SSH server. In tandem, you will also need to use
/// [`ClientReceiver`] to handle events that we receive from the server, and [`ClientFuture`] to
/// perform the actual I/O.
///
/// To open a connection, pass your I/O stream (such as `tokio::net::TcpStream`) to
/// [`Client::open()`] and perform authentication using one of the `auth_*` methods. Once
/// you are authenticated, you can open a [`Session`] and execute a program. You can also open
/// multiple sessions from a single connection.
///
/// At the same time, you must poll the [`ClientFuture`] (probably from a different task).
///
/// You can cheaply clone this object and safely share the clones between tasks.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Creates an SSH connection from an existing stream.
    ///
    /// We initialize the client, but do not perform any I/O in this method. You should use the
    /// returned objects as follows:
    ///
    /// - [`Client`] allows you to interact with the SSH client. You should use it to authenticate
    /// yourself to the server and then you can open channels or sessions.
    /// - [`ClientReceiver`] is the receiving half of the client. It produces [`ClientEvent`]s,
    /// which are informative messages from the server. You may drop it if you don't care.
    /// - [`ClientFuture`] is a future that you must poll to drive the connection forward. You will
    /// usually spawn a task for this future.
    ///
    /// The `verifier` decides whether we trust the public key of the server; it is called during
    /// every key exchange, after we have checked that the server owns the private key. Pass
    /// `remote_addr` if you know it, it is handed to the verifier.
    pub fn open<IO, V>(
        stream: IO,
        config: ClientConfig,
        verifier: V,
        remote_addr: Option<SocketAddr>,
    ) -> Result<(Client, ClientReceiver, ClientFuture)>
        where IO: AsyncRead + AsyncWrite + Send + 'static,
              V: HostKeyVerifier + 'static,
    {
        let rng = rand_chacha::ChaCha8Rng::from_rng(OsRng)
            .map_err(|_| Error::Crypto("could not seed the random number generator"))?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (reject_tx, reject_rx) = mpsc::unbounded_channel();
        let notify = Arc::new(Notify::new());

        let mut st = client_state::new_client(
            config, Box::new(rng), Box::new(verifier), remote_addr, event_tx, notify.clone(), reject_tx)?;
        let shared = Arc::new_cyclic(move |weak| {
            st.conn.set_shared(weak.clone());
            Shared { st: Mutex::new(st), notify }
        });

        let client = Client { shared: shared.clone() };
        let client_rx = ClientReceiver { event_rx };
        let client_fut = ClientFuture { fut: Box::pin(client_state::run_client(shared, stream, reject_rx)) };
        Ok((client, client_rx, client_fut))
    }

    /// Current phase of the connection.
    pub fn phase(&self) -> Phase {
        self.shared.st.lock().tr.phase()
    }

    /// Session identifier (the exchange hash of the first key exchange).
    ///
    /// Returns `None` before the first key exchange completes.
    pub fn session_id(&self) -> Option<Bytes> {
        self.shared.st.lock().tr.session_id.clone()
    }

    /// Returns true if the server has authenticated you.
    ///
    /// You must use one of the `auth_*` methods to authenticate.
    pub fn is_authenticated(&self) -> bool {
        self.shared.st.lock().tr.is_authenticated()
    }

    /// Try to authenticate using the "none" method.
    ///
    /// The "none" method (RFC 4252, section 5.2) is useful in two situations:
    ///
    /// - The user can be "authorized" without any authorization, e.g. if the user has a blank
    /// password. Note that most SSH servers disable blank passwords by default.
    /// - You want to determine the list of authentication methods for this user, so you expect to
    /// get an [`AuthFailure`][super::AuthFailure] and look at the [list of methods that can
    /// continue][super::AuthFailure::methods_can_continue].
    ///
    /// If a previous authentication attempt was successful, this call immediately succeeds. If you
    /// start another authentication attempt before this attempt is resolved, it will fail with
    /// [`Error::AuthPending`].
    pub async fn auth_none(&self, username: &str) -> Result<AuthResult> {
        self.auth(username, AuthMethod::None).await
    }

    /// Try to authenticate using the "password" method.
    ///
    /// Technically, the "password" method (RFC 4252, section 8) allows the server to ask you to
    /// change the password, but we don't support that: such a request counts as a failure.
    ///
    /// If a previous authentication attempt was successful, this call immediately succeeds. If you
    /// start another authentication attempt before this attempt is resolved, it will fail with
    /// [`Error::AuthPending`].
    pub async fn auth_password(&self, username: &str, password: &str) -> Result<AuthResult> {
        self.auth(username, AuthMethod::Password(password)).await
    }

    async fn auth(&self, username: &str, method: AuthMethod<'_>) -> Result<AuthResult> {
        let timeout = self.request_timeout();
        let service_reply = client_state::with_state(&self.shared, |st| {
            client_state::request_service(st, SERVICE_AUTH)
        })?;
        if let Some(reply) = service_reply {
            reply.wait(timeout).await?;
        }

        let auth_reply = client_state::with_state(&self.shared, |st| {
            if st.active == Some(ServiceKind::Conn) {
                return Ok(None)
            }
            st.auth.start(&mut st.tr, username, method)
        })?;
        match auth_reply {
            Some(reply) => reply.wait(timeout).await,
            None => Ok(AuthResult::Success),
        }
    }

    /// Opens an SSH session to execute a program or the shell.
    ///
    /// If the session is opened successfully, you receive two objects:
    ///
    /// - [`Session`] is the handle for interacting with the session and sending data to the
    /// server.
    /// - [`SessionReceiver`] receives the [`SessionEvent`][super::SessionEvent]s produced by the
    /// session.
    ///
    /// You can open many sessions in parallel, the SSH protocol will multiplex the sessions over
    /// the underlying connection under the hood.
    ///
    /// You must be authenticated, otherwise this fails with [`Error::NotAuthenticated`].
    pub async fn open_session(&self, config: ChannelConfig) -> Result<(Session, SessionReceiver)> {
        let (channel, channel_rx, _) = self.open_channel(ChannelKind::Session, config).await?;
        Ok(Session::new(channel, channel_rx))
    }

    /// Opens a tunnel from the server to `connect_addr` (local forwarding).
    ///
    /// This opens a `"direct-tcpip"` channel (RFC 4254, section 7.2): the server connects to
    /// the given host and port and forwards the data between the connection and the tunnel. The
    /// `originator_addr` tells the server where the connection came from on our side.
    pub async fn connect_tunnel(
        &self,
        config: ChannelConfig,
        connect_addr: (String, u16),
        originator_addr: (String, u16),
    ) -> Result<(Tunnel, TunnelReceiver)> {
        let kind = ChannelKind::DirectTcpip {
            host: connect_addr.0,
            port: connect_addr.1 as u32,
            originator_host: originator_addr.0,
            originator_port: originator_addr.1 as u32,
        };
        let (channel, channel_rx, _) = self.open_channel(kind, config).await?;
        Ok(Tunnel::new(channel, channel_rx))
    }

    /// Asks the server to listen on `bind_addr` and `bind_port` (remote forwarding).
    ///
    /// This sends the `"tcpip-forward"` global request (RFC 4254, section 7.1). Connections to
    /// the bound port arrive as `"forwarded-tcpip"` channels, so you should
    /// [register an opener][Self::register_opener] for this channel type before calling this
    /// method. If you pass port 0, the server chooses the port.
    ///
    /// Returns the bound port.
    pub async fn bind_tunnel(&self, bind_addr: &str, bind_port: u16) -> Result<u32> {
        let mut payload = Buffer::new();
        payload.put_str(bind_addr);
        payload.put_u32(bind_port as u32);
        let reply = self.global_request("tcpip-forward", &payload.finish()).await?;
        if bind_port != 0 {
            return Ok(bind_port as u32)
        }
        Buffer::from_slice(&reply).get_u32()
    }

    /// Asks the server to stop listening on an address bound with
    /// [`bind_tunnel()`][Self::bind_tunnel].
    pub async fn cancel_tunnel(&self, bind_addr: &str, bind_port: u32) -> Result<()> {
        let mut payload = Buffer::new();
        payload.put_str(bind_addr);
        payload.put_u32(bind_port);
        self.global_request("cancel-tcpip-forward", &payload.finish()).await?;
        Ok(())
    }

    /// Opens a raw SSH channel (low level API).
    ///
    /// Use this to directly open an SSH channel, as described in RFC 4254, section 5. The `kind`
    /// gives the channel type and the "channel specific data" of `SSH_MSG_CHANNEL_OPEN`.
    ///
    /// If the channel is opened successfully, you receive three objects:
    ///
    /// - [`Channel`] is the handle for interacting with the channel and sending data to the
    /// server.
    /// - [`ChannelReceiver`] receives the [`ChannelEvent`][super::ChannelEvent]s produced by the
    /// channel.
    /// - The `Bytes` contain the channel specific data from the
    /// `SSH_MSG_CHANNEL_OPEN_CONFIRMATION` packet.
    ///
    /// If the server rejects the channel, you get [`Error::ChannelOpen`] with the reason. You
    /// must be authenticated, otherwise this fails with [`Error::NotAuthenticated`].
    pub async fn open_channel(&self, kind: ChannelKind, config: ChannelConfig)
        -> Result<(Channel, ChannelReceiver, Bytes)>
    {
        let (reply, request_timeout) = client_state::with_state(&self.shared, |st| {
            if st.active != Some(ServiceKind::Conn) {
                return Err(Error::NotAuthenticated)
            }
            let reply = st.conn.open_channel(&mut st.tr, &kind, &config)?;
            Ok((reply, st.tr.config.request_timeout))
        })?;
        let opened = reply.wait(config.open_timeout).await?;

        let channel = Channel {
            shared: self.shared.clone(),
            our_id: opened.our_id,
            send_timeout: config.send_timeout,
            request_timeout,
        };
        let channel_rx = ChannelReceiver {
            shared: self.shared.clone(),
            our_id: opened.our_id,
            event_rx: opened.event_rx,
        };
        Ok((channel, channel_rx, opened.confirm_payload))
    }

    /// Sends a global request and waits for the reply (low level API).
    ///
    /// This sends `SSH_MSG_GLOBAL_REQUEST` (RFC 4254, section 4) with the raw type-specific
    /// `payload`. Returns the type-specific data of `SSH_MSG_REQUEST_SUCCESS`, or
    /// [`Error::GlobalReq`] if the server replied with `SSH_MSG_REQUEST_FAILURE`.
    pub async fn global_request(&self, request_type: &str, payload: &[u8]) -> Result<Bytes> {
        let (reply, timeout) = client_state::with_state(&self.shared, |st| {
            if st.active != Some(ServiceKind::Conn) {
                return Err(Error::NotAuthenticated)
            }
            let reply = st.conn.send_global_request(&mut st.tr, request_type, payload, true)?;
            Ok((reply, st.tr.config.request_timeout))
        })?;
        match reply {
            Some(reply) => reply.wait(timeout).await,
            None => Ok(Bytes::new()),
        }
    }

    /// Registers an opener for channels of `channel_type` that the server opens to us.
    ///
    /// For example, connections to ports bound by [`bind_tunnel()`][Self::bind_tunnel] arrive as
    /// `"forwarded-tcpip"` channels. Registering another opener for the same type replaces the
    /// previous one.
    pub fn register_opener<O>(&self, channel_type: &str, opener: O) -> Result<()>
        where O: ChannelOpener + 'static
    {
        client_state::with_state(&self.shared, |st| {
            st.conn.register_opener(channel_type.into(), Box::new(opener));
            Ok(())
        })
    }

    /// Trigger key exchange (rekeying).
    ///
    /// Starts a key re-exchange (RFC 4253, section 9). Normally, we trigger the re-exchange
    /// automatically as needed (see [`ClientConfig::rekey_after_bytes`] and
    /// [`ClientConfig::rekey_after_duration`]), but you can use this method to start the exchange
    /// earlier.
    ///
    /// This method returns when the key exchange completes. If an exchange is already in progress,
    /// we simply wait for it to complete, we don't trigger another one.
    pub async fn rekey(&self) -> Result<()> {
        let reply = client_state::with_state(&self.shared, negotiate::rekey)?;
        reply.wait(self.request_timeout()).await
    }

    /// Disconnects from the server and closes the client.
    ///
    /// We send a disconnection message to the server, so that they can be sure that we intended to
    /// close the connection (i.e., it was not closed by a man-in-the-middle attacker). After
    /// this message is sent, the [`ClientFuture`] returns.
    ///
    /// The `error` describes the reasons for the disconnection to the server. You may want to use
    /// [`DisconnectError::by_app()`] as a reasonable default value.
    pub fn disconnect(&self, error: DisconnectError) -> Result<()> {
        client_state::disconnect(&mut self.shared.st.lock(), error)
    }

    /// Waits until the connection terminates.
    ///
    /// Returns `Ok` if the connection was closed in an orderly way, or the error that killed it
    /// ([`Error::SessionFailed`]).
    pub async fn wait(&self) -> Result<()> {
        client_state::wait_until(&self.shared, None, |_| Ok(None::<()>)).await
            .or_else(|err| match err {
                Error::SessionClosed => Ok(()),
                err => Err(err),
            })
    }

    fn request_timeout(&self) -> Option<Duration> {
        self.shared.st.lock().tr.config.request_timeout
    }
}

/// Receiving half of a [`Client`].
///
/// [`ClientReceiver`] provides you with the [`ClientEvent`]s, informative messages that the
/// server sends during the life of the connection. You can ignore them or drop the receiver.
pub struct ClientReceiver {
    event_rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl ClientReceiver {
    /// Wait for the next event.
    ///
    /// Returns `None` if the connection was closed.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Poll-friendly variant of [`.recv()`][Self::recv()].
    pub fn poll_recv(&mut self, cx: &mut Context) -> Poll<Option<ClientEvent>> {
        self.event_rx.poll_recv(cx)
    }
}

/// Future that drives the connection.
///
/// This future performs the reads and writes on the I/O stream. You must poll this future,
/// usually by spawning a task for it. The future completes when the connection is closed or when
/// an error happens; in the latter case it returns [`Error::SessionFailed`] with the cause.
#[must_use = "the connection makes no progress unless you poll the ClientFuture"]
pub struct ClientFuture {
    fut: Pin<Box<dyn Future<Output = Result<()>> + Send>>,
}

impl Future for ClientFuture {
    type Output = Result<()>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<()>> {
        self.fut.as_mut().poll(cx)
    }
}

/// Decides whether we trust the public key of the server.
///
/// The verifier is called during every key exchange with the address of the server (if it was
/// given to [`Client::open()`]) and its public key. If it returns false, the connection fails with
/// [`Error::HostKeyNotVerifiable`]. Any closure with the right signature is a verifier.
pub trait HostKeyVerifier: Send {
    /// Returns true if `pubkey` is the trusted key of the server at `remote_addr`.
    fn verify(&mut self, remote_addr: Option<SocketAddr>, pubkey: &Pubkey) -> bool;
}

impl<F> HostKeyVerifier for F
    where F: FnMut(Option<SocketAddr>, &Pubkey) -> bool + Send
{
    fn verify(&mut self, remote_addr: Option<SocketAddr>, pubkey: &Pubkey) -> bool {
        self(remote_addr, pubkey)
    }
}

/// Configuration of a [`Client`].
///
/// You should start from the [default][Default] instance, which has reasonable default
/// configuration, and modify it according to your needs. You may also find the method
/// [`ClientConfig::with()`] syntactically convenient.
///
/// If you need compatibility with old SSH servers that use outdated crypto, you may use
/// [`ClientConfig::default_compatible_less_secure()`]. However, this configuration is less secure.
///
/// This struct is `#[non_exhaustive]`, so we may add more fields without breaking backward
/// compatibility.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    /// Our identification string, sent before anything else (RFC 4253, section 4.2).
    ///
    /// It must start with `"SSH-2.0-"`; the line terminator is added automatically.
    pub ident: String,

    /// Supported [key exchange algorithms][crate::kex].
    ///
    /// We will use the first algorithm that is also supported by the server. If there is no
    /// overlap, the connnection will abort.
    pub kex_algos: Vec<&'static KexAlgo>,

    /// Supported [server public key algorithms][crate::pubkey].
    ///
    /// We will use the first algorithm that is also supported by the server. If there is no
    /// overlap, the connnection will abort.
    pub server_pubkey_algos: Vec<&'static PubkeyAlgo>,

    /// Supported [encryption algorithms][crate::cipher].
    ///
    /// We will use the first algorithm that is also supported by the server. If there is no
    /// overlap, the connnection will abort.
    pub cipher_algos: Vec<&'static CipherAlgo>,

    /// Supported [message authentication algorithms][crate::mac].
    ///
    /// We will use the first algorithm that is also supported by the server. If there is no
    /// overlap, the connnection will abort.
    pub mac_algos: Vec<&'static MacAlgo>,

    /// Supported [compression algorithms][crate::compress].
    pub compress_algos: Vec<&'static CompressAlgo>,

    /// Maximum length of a packet that we accept from the server.
    pub max_packet_len: usize,

    /// Start key re-exchange after this many bytes.
    ///
    /// The amount of data that symmetric ciphers can securely encrypt is usually limited, so we
    /// should periodically repeat key exchange to generate new symmetric keys (RFC 4253, section
    /// 9). We will trigger a key re-exchange after this number of bytes is transmitted or
    /// received.
    ///
    /// By default, this configuration is set to 2^30 bytes (as recommended by the SSH
    /// specification). We only allow you to make this value lower: higher values are capped at
    /// the default.
    pub rekey_after_bytes: u64,

    /// Start key re-exchange after this amount of time.
    ///
    /// By default, we perform the re-exchange after one hour (as recommended by the SSH
    /// specification).
    pub rekey_after_duration: Duration,

    /// Default timeout for replies from the server, such as the authentication result or the
    /// reply to a channel request.
    ///
    /// The default is no timeout.
    pub request_timeout: Option<Duration>,

    /// Send a keepalive request when the server has been silent for this long.
    ///
    /// The default is no keepalive.
    pub keepalive_interval: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            ident: format!("SSH-2.0-tsuna_{}", env!("CARGO_PKG_VERSION")),
            kex_algos: vec![
                &kex::CURVE25519_SHA256, &kex::CURVE25519_SHA256_LIBSSH,
                &kex::DIFFIE_HELLMAN_GROUP14_SHA256, &kex::DIFFIE_HELLMAN_GROUP16_SHA512,
            ],
            server_pubkey_algos: vec![
                &pubkey::SSH_ED25519,
                &pubkey::ECDSA_SHA2_NISTP256, &pubkey::ECDSA_SHA2_NISTP384,
                &pubkey::RSA_SHA2_256, &pubkey::RSA_SHA2_512,
            ],
            cipher_algos: vec![
                &cipher::AES128_CTR, &cipher::AES192_CTR, &cipher::AES256_CTR,
            ],
            mac_algos: vec![
                &mac::HMAC_SHA2_256_ETM, &mac::HMAC_SHA2_512_ETM,
                &mac::HMAC_SHA2_256, &mac::HMAC_SHA2_512,
            ],
            compress_algos: vec![
                &compress::NONE, &compress::ZLIB_OPENSSH,
            ],
            max_packet_len: 256 * 1024,
            rekey_after_bytes: 1 << 30,
            rekey_after_duration: Duration::from_secs(60 * 60),
            request_timeout: None,
            keepalive_interval: None,
        }
    }
}

impl ClientConfig {
    /// Default configuration with higher compatibility and lower security.
    ///
    /// Returns a configuration that includes support for outdated and potentially insecure crypto,
    /// notably SHA-1 and CBC mode. **Use at your own risk!**.
    pub fn default_compatible_less_secure() -> ClientConfig {
        Self::default().with(|c| {
            c.kex_algos.push(&kex::DIFFIE_HELLMAN_GROUP14_SHA1);
            c.server_pubkey_algos.push(&pubkey::SSH_RSA_SHA1);
            c.cipher_algos.extend_from_slice(&[&cipher::AES128_CBC, &cipher::AES256_CBC]);
            c.mac_algos.extend_from_slice(&[&mac::HMAC_SHA1_ETM, &mac::HMAC_SHA1]);
            c.compress_algos.push(&compress::ZLIB);
        })
    }

    /// Mutate `self` in a closure.
    ///
    /// This method applies your closure to `self` and returns the mutated configuration.
    pub fn with<F: FnOnce(&mut Self)>(mut self, f: F) -> Self {
        f(&mut self);
        self
    }
}
