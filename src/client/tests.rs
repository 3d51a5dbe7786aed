use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use crate::cipher::{self, CipherAlgo};
use crate::codec::{Buffer, DecryptKeys, EncryptKeys, RecvPipe, SendPipe};
use crate::codes::{disconnect, msg, open};
use crate::compress;
use crate::error::{DisconnectError, Error, OpenFailure, Result};
use crate::mac::{self, MacAlgo};
use crate::pubkey::{self, Pubkey};
use super::negotiate::{derive_keys, DerivedKeys};
use super::negotiate::tests::{stub_output, StubKex, STUB_EXCHANGE_HASH, STUB_KEX};
use super::*;

static CIPHER: &CipherAlgo = &cipher::AES128_CTR;
static MAC: &MacAlgo = &mac::HMAC_SHA2_256;

fn test_config() -> ClientConfig {
    ClientConfig::default().with(|c| {
        c.ident = "SSH-2.0-test_1.0".into();
        c.kex_algos = vec![&STUB_KEX];
        c.server_pubkey_algos = vec![&pubkey::SSH_ED25519];
        c.cipher_algos = vec![CIPHER];
        c.mac_algos = vec![MAC];
        c.compress_algos = vec![&compress::NONE];
        c.request_timeout = Some(Duration::from_secs(5));
    })
}

fn derived_keys() -> DerivedKeys {
    let kex = StubKex { init_sent: true, reply_recvd: true };
    derive_keys(&kex, &stub_output(), &STUB_EXCHANGE_HASH, (CIPHER, MAC), (CIPHER, MAC))
}

/// Server side of the connection, driven step by step from the test.
struct Server {
    stream: DuplexStream,
    send_pipe: SendPipe,
    recv_pipe: RecvPipe,
}

impl Server {
    fn new(stream: DuplexStream) -> Server {
        Server {
            stream,
            send_pipe: SendPipe::new(&mut rand::rngs::OsRng).unwrap(),
            recv_pipe: RecvPipe::new(1 << 20),
        }
    }

    async fn flush(&mut self) {
        let bytes = self.send_pipe.take_bytes();
        self.stream.write_all(&bytes).await.unwrap();
    }

    async fn send(&mut self, payload: &[u8]) {
        self.send_pipe.feed_packet(payload).unwrap();
        self.flush().await;
    }

    async fn fill(&mut self) {
        let mut buf = [0; 4096];
        let len = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf)).await
            .expect("timeout waiting for the client").unwrap();
        assert!(len > 0, "client closed the stream");
        self.recv_pipe.feed(&buf[..len]);
    }

    async fn recv_ident(&mut self) -> Bytes {
        loop {
            if let Some(ident) = self.recv_pipe.consume_ident().unwrap() {
                return ident
            }
            self.fill().await;
        }
    }

    async fn recv(&mut self) -> Buffer {
        loop {
            if let Some(packet) = self.recv_pipe.consume_packet().unwrap() {
                return Buffer::from_slice(&packet.payload)
            }
            self.fill().await;
        }
    }

    async fn recv_msg(&mut self, msg_id: u8) -> Buffer {
        let mut payload = self.recv().await;
        let recvd_id = payload.get_u8().unwrap();
        assert_eq!(recvd_id, msg_id, "expected {}, received {}", msg::to_str(msg_id), msg::to_str(recvd_id));
        payload
    }

    fn kex_init() -> Bytes {
        let mut kex_init = Buffer::new();
        kex_init.put_u8(msg::KEXINIT);
        kex_init.put_raw(&[0; 16]);
        kex_init.put_name_list(&[STUB_KEX.name]);
        kex_init.put_name_list(&["ssh-ed25519"]);
        kex_init.put_name_list(&[CIPHER.name]);
        kex_init.put_name_list(&[CIPHER.name]);
        kex_init.put_name_list(&[MAC.name]);
        kex_init.put_name_list(&[MAC.name]);
        kex_init.put_name_list(&["none"]);
        kex_init.put_name_list(&["none"]);
        kex_init.put_name_list(&[]);
        kex_init.put_name_list(&[]);
        kex_init.put_bool(false);
        kex_init.put_u32(0);
        kex_init.finish()
    }

    /// Sends the reply of the stub key exchange and NEWKEYS, then switches to the new keys.
    async fn send_kex_reply(&mut self) {
        self.send_pipe.feed_packet(&[msg::KEXDH_REPLY]).unwrap();
        self.send_pipe.feed_packet(&[msg::NEWKEYS]).unwrap();
        self.flush().await;

        // the stub exchange always yields the same hash, so every exchange derives the same keys
        // (but the ciphers start from the IV again)
        let keys = derived_keys();
        self.send_pipe.set_encrypt(EncryptKeys {
            encrypt: (CIPHER.make_encrypt)(&keys.enc_stc, &keys.iv_stc).unwrap(),
            mac: (MAC.make_mac)(&keys.mac_stc),
            mac_variant: MAC.variant,
            block_len: CIPHER.block_len,
            tag_len: MAC.tag_len,
        });
    }

    async fn recv_new_keys(&mut self) {
        self.recv_msg(msg::NEWKEYS).await;
        let keys = derived_keys();
        self.recv_pipe.set_decrypt(DecryptKeys {
            decrypt: (CIPHER.make_decrypt)(&keys.enc_cts, &keys.iv_cts).unwrap(),
            mac: (MAC.make_mac)(&keys.mac_cts),
            mac_variant: MAC.variant,
            block_len: CIPHER.block_len,
            tag_len: MAC.tag_len,
        });
    }

    async fn handshake(&mut self) {
        self.send_pipe.feed_ident(b"SSH-2.0-OpenSSH_8.0");
        self.send_pipe.feed_packet(&Server::kex_init()).unwrap();
        self.send_kex_reply().await;

        assert_eq!(self.recv_ident().await.as_ref(), b"SSH-2.0-test_1.0");
        self.recv_msg(msg::KEXINIT).await;
        self.recv_msg(msg::KEXDH_INIT).await;
        self.recv_new_keys().await;
    }

    async fn accept_service(&mut self) {
        let mut request = self.recv_msg(msg::SERVICE_REQUEST).await;
        assert_eq!(request.get_string().unwrap(), "ssh-userauth");
        let mut accept = Buffer::new();
        accept.put_u8(msg::SERVICE_ACCEPT);
        accept.put_str("ssh-userauth");
        self.send(&accept.finish()).await;
    }

    async fn accept_password(&mut self, username: &str, password: &str) {
        self.accept_service().await;
        let mut request = self.recv_msg(msg::USERAUTH_REQUEST).await;
        assert_eq!(request.get_string().unwrap(), username);
        assert_eq!(request.get_string().unwrap(), "ssh-connection");
        assert_eq!(request.get_string().unwrap(), "password");
        assert!(!request.get_bool().unwrap());
        assert_eq!(request.get_string().unwrap(), password);
        self.send(&[msg::USERAUTH_SUCCESS]).await;
    }

    /// Receives `SSH_MSG_CHANNEL_OPEN` and returns the type and the id of the client.
    async fn recv_open(&mut self) -> (String, u32) {
        let mut open = self.recv_msg(msg::CHANNEL_OPEN).await;
        let channel_type = open.get_string().unwrap();
        let client_id = open.get_u32().unwrap();
        open.get_u32().unwrap(); // initial window size
        open.get_u32().unwrap(); // maximum packet size
        (channel_type, client_id)
    }

    async fn confirm_open(&mut self, our_id: u32, window: u32, packet_len_max: u32) -> u32 {
        let (_, client_id) = self.recv_open().await;
        let mut confirm = Buffer::new();
        confirm.put_u8(msg::CHANNEL_OPEN_CONFIRMATION);
        confirm.put_u32(client_id);
        confirm.put_u32(our_id);
        confirm.put_u32(window);
        confirm.put_u32(packet_len_max);
        self.send(&confirm.finish()).await;
        client_id
    }

    async fn send_channel(&mut self, msg_id: u8, client_id: u32, body: &[u8]) {
        let mut payload = Buffer::new();
        payload.put_u8(msg_id);
        payload.put_u32(client_id);
        payload.put_raw(body);
        self.send(&payload.finish()).await;
    }

    async fn recv_data(&mut self, our_id: u32) -> Bytes {
        let mut data = self.recv_msg(msg::CHANNEL_DATA).await;
        assert_eq!(data.get_u32().unwrap(), our_id);
        data.get_bytes().unwrap()
    }
}

async fn connect() -> (Client, ClientReceiver, Server, JoinHandle<Result<()>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let verifier = |_: Option<SocketAddr>, pubkey: &Pubkey| pubkey.type_name() == "ssh-ed25519";
    let (client, client_rx, client_fut) = Client::open(client_io, test_config(), verifier, None).unwrap();
    let client_task = tokio::spawn(client_fut);

    let mut server = Server::new(server_io);
    server.handshake().await;
    (client, client_rx, server, client_task)
}

async fn connect_authed() -> (Client, ClientReceiver, Server, JoinHandle<Result<()>>) {
    let (client, client_rx, mut server, client_task) = connect().await;
    let (res, ()) = tokio::join!(
        client.auth_password("alice", "secret"),
        server.accept_password("alice", "secret"),
    );
    assert_eq!(res.unwrap(), AuthResult::Success);
    (client, client_rx, server, client_task)
}

fn u32_body(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_be_bytes()).collect()
}

#[tokio::test]
async fn test_handshake_and_password_auth() {
    let (client, _client_rx, _server, _client_task) = connect_authed().await;
    assert!(client.is_authenticated());
    assert_eq!(client.session_id().unwrap().as_ref(), &STUB_EXCHANGE_HASH);
    assert_eq!(client.phase(), Phase::ServiceActive);

    // already authenticated, nothing is sent
    assert_eq!(client.auth_none("alice").await.unwrap(), AuthResult::Success);
}

#[tokio::test]
async fn test_auth_failure() {
    let (client, _client_rx, mut server, _client_task) = connect().await;
    let server_side = async {
        server.accept_service().await;
        server.recv_msg(msg::USERAUTH_REQUEST).await;
        let mut failure = Buffer::new();
        failure.put_u8(msg::USERAUTH_FAILURE);
        failure.put_name_list(&["publickey", "password"]);
        failure.put_bool(false);
        server.send(&failure.finish()).await;
    };
    let (res, ()) = tokio::join!(client.auth_none("alice"), server_side);

    match res.unwrap() {
        AuthResult::Failure(failure) => {
            assert_eq!(failure.methods_can_continue, vec!["publickey", "password"]);
            assert!(!failure.partial_success);
        },
        res => panic!("unexpected result {:?}", res),
    }
    assert!(!client.is_authenticated());
    assert!(matches!(client.open_session(ChannelConfig::default()).await, Err(Error::NotAuthenticated)));
}

#[tokio::test]
async fn test_open_failure_then_success() {
    let (client, _client_rx, mut server, _client_task) = connect_authed().await;

    let server_side = async {
        let (channel_type, client_id) = server.recv_open().await;
        assert_eq!(channel_type, "session");
        let mut failure = Buffer::new();
        failure.put_u8(msg::CHANNEL_OPEN_FAILURE);
        failure.put_u32(client_id);
        failure.put_u32(open::ADMINISTRATIVELY_PROHIBITED);
        failure.put_str("no sessions today");
        failure.put_str("");
        server.send(&failure.finish()).await;
        client_id
    };
    let (res, first_id) = tokio::join!(client.open_session(ChannelConfig::default()), server_side);
    match res {
        Err(Error::ChannelOpen(err)) => {
            assert_eq!(err.reason(), OpenFailure::AdministrativelyProhibited);
            assert_eq!(err.description, "no sessions today");
        },
        res => panic!("unexpected result {:?}", res.map(|_| ())),
    }

    let (res, second_id) = tokio::join!(
        client.open_session(ChannelConfig::default()),
        server.confirm_open(100, 1000, 1000),
    );
    let (session, _session_rx) = res.unwrap();
    assert_eq!(session.channel().id(), second_id);
    assert_ne!(first_id, second_id);
}

#[tokio::test]
async fn test_exec_session() {
    let (client, _client_rx, mut server, _client_task) = connect_authed().await;
    let (res, client_id) = tokio::join!(
        client.open_session(ChannelConfig::default()),
        server.confirm_open(100, 1000, 1000),
    );
    let (session, mut session_rx) = res.unwrap();

    let server_side = async {
        let mut request = server.recv_msg(msg::CHANNEL_REQUEST).await;
        assert_eq!(request.get_u32().unwrap(), 100);
        assert_eq!(request.get_string().unwrap(), "exec");
        assert!(request.get_bool().unwrap());
        assert_eq!(request.get_bytes().unwrap().as_ref(), b"echo hello");
        server.send_channel(msg::CHANNEL_SUCCESS, client_id, &[]).await;
    };
    let (res, ()) = tokio::join!(async { session.exec(b"echo hello")?.want_reply().await }, server_side);
    res.unwrap();

    let mut stdout = Buffer::new();
    stdout.put_bytes(b"hello\n");
    server.send_channel(msg::CHANNEL_DATA, client_id, &stdout.finish()).await;
    let mut stderr = Buffer::new();
    stderr.put_u32(1);
    stderr.put_bytes(b"warning\n");
    server.send_channel(msg::CHANNEL_EXTENDED_DATA, client_id, &stderr.finish()).await;
    server.send_channel(msg::CHANNEL_EOF, client_id, &[]).await;
    let mut exit_status = Buffer::new();
    exit_status.put_str("exit-status");
    exit_status.put_bool(false);
    exit_status.put_u32(3);
    server.send_channel(msg::CHANNEL_REQUEST, client_id, &exit_status.finish()).await;
    server.send_channel(msg::CHANNEL_CLOSE, client_id, &[]).await;

    assert!(matches!(session_rx.recv().await, Some(SessionEvent::StdoutData(data)) if data == "hello\n"));
    assert!(matches!(session_rx.recv().await, Some(SessionEvent::StderrData(data)) if data == "warning\n"));
    assert!(matches!(session_rx.recv().await, Some(SessionEvent::Eof)));
    assert!(matches!(session_rx.recv().await, Some(SessionEvent::ExitStatus(3))));
    assert!(session_rx.recv().await.is_none());

    let mut close = server.recv_msg(msg::CHANNEL_CLOSE).await;
    assert_eq!(close.get_u32().unwrap(), 100);
    assert!(matches!(session.send_stdin(Bytes::from_static(b"late")).await, Err(Error::ChannelClosed)));
}

#[tokio::test]
async fn test_rekey_defers_packets() {
    let (client, _client_rx, mut server, _client_task) = connect_authed().await;
    let (res, client_id) = tokio::join!(
        client.open_session(ChannelConfig::default()),
        server.confirm_open(100, 1000, 1000),
    );
    let (session, mut session_rx) = res.unwrap();
    let send_seq = server.recv_pipe.packet_seq();

    // the server starts a key exchange, the client answers and waits for the reply
    server.send(&Server::kex_init()).await;
    server.recv_msg(msg::KEXINIT).await;
    server.recv_msg(msg::KEXDH_INIT).await;
    assert_eq!(client.phase(), Phase::KeyExchange);

    // sent during the exchange, so held back until our NEWKEYS
    let exec_reply = session.exec(b"cat").unwrap();
    let server_side = async {
        server.send_kex_reply().await;
        server.recv_new_keys().await;

        let mut request = server.recv_msg(msg::CHANNEL_REQUEST).await;
        assert_eq!(request.get_u32().unwrap(), 100);
        assert_eq!(request.get_string().unwrap(), "exec");
        server.send_channel(msg::CHANNEL_SUCCESS, client_id, &[]).await;
        server.recv_data(100).await
    };
    let (exec_res, stdin_res, data) = tokio::join!(
        exec_reply.want_reply(),
        session.send_stdin(Bytes::from_static(b"during kex")),
        server_side,
    );
    exec_res.unwrap();
    stdin_res.unwrap();
    assert_eq!(data.as_ref(), b"during kex");
    // KEXINIT, KEXDH_INIT, NEWKEYS, the request and the data, without a gap
    assert_eq!(server.recv_pipe.packet_seq(), send_seq.wrapping_add(5));
    assert_eq!(client.phase(), Phase::ServiceActive);

    // now the client starts the exchange
    let server_side = async {
        server.recv_msg(msg::KEXINIT).await;
        server.send_pipe.feed_packet(&Server::kex_init()).unwrap();
        server.send_kex_reply().await;
        server.recv_msg(msg::KEXDH_INIT).await;
        server.recv_new_keys().await;
    };
    let (res, ()) = tokio::join!(client.rekey(), server_side);
    res.unwrap();
    assert_eq!(client.session_id().unwrap().as_ref(), &STUB_EXCHANGE_HASH);

    // the channel still works under the new keys
    let mut stdout = Buffer::new();
    stdout.put_bytes(b"after kex");
    server.send_channel(msg::CHANNEL_DATA, client_id, &stdout.finish()).await;
    assert!(matches!(session_rx.recv().await, Some(SessionEvent::StdoutData(data)) if data == "after kex"));
    let (res, data) = tokio::join!(session.send_stdin(Bytes::from_static(b"more")), server.recv_data(100));
    res.unwrap();
    assert_eq!(data.as_ref(), b"more");
}

#[tokio::test]
async fn test_send_blocked_until_window_adjust() {
    let (client, _client_rx, mut server, _client_task) = connect_authed().await;
    let (res, client_id) = tokio::join!(
        client.open_session(ChannelConfig::default()),
        server.confirm_open(100, 10, 1000),
    );
    let (session, _session_rx) = res.unwrap();

    let send_task = tokio::spawn({
        let session = session.clone();
        async move { session.send_stdin(Bytes::from(vec![b'x'; 25])).await }
    });

    assert_eq!(server.recv_data(100).await.len(), 10);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!send_task.is_finished());

    server.send_channel(msg::CHANNEL_WINDOW_ADJUST, client_id, &u32_body(&[100])).await;
    assert_eq!(server.recv_data(100).await.len(), 15);
    send_task.await.unwrap().unwrap();
    assert_eq!(session.channel().phase(), ChannelPhase::Open);
}

#[tokio::test]
async fn test_corrupted_mac_fails_all_waiters() {
    let (client, _client_rx, mut server, client_task) = connect_authed().await;

    let open_task = tokio::spawn({
        let client = client.clone();
        async move { client.open_session(ChannelConfig::default()).await.map(|_| ()) }
    });
    server.recv_open().await;

    server.send_pipe.feed_packet(&[msg::IGNORE, 0, 0, 0, 0]).unwrap();
    let mut bytes = server.send_pipe.take_bytes().to_vec();
    if let Some(last) = bytes.last_mut() {
        *last ^= 0x01;
    }
    server.stream.write_all(&bytes).await.unwrap();

    match open_task.await.unwrap() {
        Err(Error::SessionFailed(err)) => assert!(matches!(*err, Error::Mac)),
        res => panic!("unexpected result {:?}", res),
    }
    assert!(matches!(client_task.await.unwrap(), Err(Error::SessionFailed(_))));
    assert!(client.wait().await.is_err());
    assert_eq!(client.phase(), Phase::Error);

    let mut disconnect = server.recv_msg(msg::DISCONNECT).await;
    assert_eq!(disconnect.get_u32().unwrap(), disconnect::MAC_ERROR);
}

#[tokio::test]
async fn test_unknown_channel_type_rejected() {
    let (_client, _client_rx, mut server, _client_task) = connect_authed().await;

    let mut open = Buffer::new();
    open.put_u8(msg::CHANNEL_OPEN);
    open.put_str("auth-agent@openssh.com");
    open.put_u32(5);
    open.put_u32(1000);
    open.put_u32(1000);
    server.send(&open.finish()).await;

    let mut failure = server.recv_msg(msg::CHANNEL_OPEN_FAILURE).await;
    assert_eq!(failure.get_u32().unwrap(), 5);
    assert_eq!(failure.get_u32().unwrap(), open::UNKNOWN_CHANNEL_TYPE);
}

#[tokio::test]
async fn test_remote_forwarding() {
    let (client, _client_rx, mut server, _client_task) = connect_authed().await;
    let (accept_tx, mut accept_rx) = mpsc::unbounded_channel::<AcceptChannel>();
    client.register_opener("forwarded-tcpip", accept_tx).unwrap();

    let server_side = async {
        let mut request = server.recv_msg(msg::GLOBAL_REQUEST).await;
        assert_eq!(request.get_string().unwrap(), "tcpip-forward");
        assert!(request.get_bool().unwrap());
        assert_eq!(request.get_string().unwrap(), "localhost");
        assert_eq!(request.get_u32().unwrap(), 0);
        let mut success = Buffer::new();
        success.put_u8(msg::REQUEST_SUCCESS);
        success.put_u32(4242);
        server.send(&success.finish()).await;
    };
    let (res, ()) = tokio::join!(client.bind_tunnel("localhost", 0), server_side);
    assert_eq!(res.unwrap(), 4242);

    let mut open = Buffer::new();
    open.put_u8(msg::CHANNEL_OPEN);
    open.put_str("forwarded-tcpip");
    open.put_u32(9);
    open.put_u32(1000);
    open.put_u32(1000);
    open.put_str("localhost");
    open.put_u32(4242);
    open.put_str("10.0.0.1");
    open.put_u32(5555);
    server.send(&open.finish()).await;

    let accept = accept_rx.recv().await.unwrap();
    let (tunnel, mut tunnel_rx, kind) = Tunnel::accept(accept, ChannelConfig::default()).unwrap();
    match kind {
        ChannelKind::ForwardedTcpip { connected_port, originator_host, .. } => {
            assert_eq!(connected_port, 4242);
            assert_eq!(originator_host, "10.0.0.1");
        },
        kind => panic!("unexpected kind {:?}", kind),
    }

    let mut confirm = server.recv_msg(msg::CHANNEL_OPEN_CONFIRMATION).await;
    assert_eq!(confirm.get_u32().unwrap(), 9);
    let client_id = confirm.get_u32().unwrap();

    let mut ping = Buffer::new();
    ping.put_bytes(b"ping");
    server.send_channel(msg::CHANNEL_DATA, client_id, &ping.finish()).await;
    assert!(matches!(tunnel_rx.recv().await, Some(TunnelEvent::Data(data)) if data == "ping"));

    tunnel.send_data(Bytes::from_static(b"pong")).await.unwrap();
    assert_eq!(server.recv_data(9).await.as_ref(), b"pong");
}

#[tokio::test]
async fn test_disconnect() {
    let (client, _client_rx, mut server, client_task) = connect_authed().await;
    client.disconnect(DisconnectError::by_app("bye")).unwrap();

    let mut disconnect = server.recv_msg(msg::DISCONNECT).await;
    assert_eq!(disconnect.get_u32().unwrap(), disconnect::BY_APPLICATION);
    assert_eq!(disconnect.get_string().unwrap(), "bye");

    client_task.await.unwrap().unwrap();
    client.wait().await.unwrap();
    assert_eq!(client.phase(), Phase::Closed);
    assert!(matches!(client.open_session(ChannelConfig::default()).await, Err(Error::SessionClosed)));
}
