use anyhow::{ensure, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use tsuna::codes::{disconnect, msg};
use tsuna::{
    cipher, compress, mac, pubkey, Buffer, ChannelConfig, Client, ClientConfig, ClientEvent,
    DisconnectError, Error, Pubkey, SessionEvent,
};
use crate::fake_server::{FakeServer, EXCHANGE_HASH, FIXED_KEX};

mod fake_server;

fn config() -> ClientConfig {
    ClientConfig::default().with(|c| {
        c.kex_algos = vec![&FIXED_KEX];
        c.server_pubkey_algos = vec![&pubkey::SSH_ED25519];
        c.cipher_algos = vec![&cipher::NONE];
        c.mac_algos = vec![&mac::NONE];
        c.compress_algos = vec![&compress::NONE];
    })
}

fn trust_all(_: Option<SocketAddr>, _: &Pubkey) -> bool {
    true
}

#[tokio::test]
async fn session_smoke_test() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    let (client, mut client_rx, client_fut) = Client::open(client_io, config(), trust_all, None)?;
    let client_task = tokio::spawn(client_fut);
    let mut server = FakeServer::new(server_io);

    let ident = server.handshake().await?;
    ensure!(ident.starts_with(b"SSH-2.0-tsuna_"), "unexpected ident {:?}", ident);

    let mut debug = Buffer::new();
    debug.put_u8(msg::DEBUG);
    debug.put_bool(false);
    debug.put_str("hello from the server");
    debug.put_str("");
    server.send(&debug.finish()).await?;
    match client_rx.recv().await {
        Some(ClientEvent::DebugMsg(debug)) => ensure!(debug.message == "hello from the server"),
        event => anyhow::bail!("unexpected event {:?}", event),
    }

    let (auth_res, server_res) = tokio::join!(client.auth_none("bob"), server.accept_auth_none("bob"));
    server_res?;
    ensure!(auth_res? == tsuna::AuthResult::Success);
    ensure!(client.session_id().as_deref() == Some(&EXCHANGE_HASH[..]));

    let server_side = async {
        let mut open = server.recv_msg(msg::CHANNEL_OPEN).await?;
        ensure!(open.get_string()? == "session");
        let client_id = open.get_u32()?;
        let mut confirm = Buffer::new();
        confirm.put_u8(msg::CHANNEL_OPEN_CONFIRMATION);
        confirm.put_u32(client_id);
        confirm.put_u32(77);
        confirm.put_u32(64 * 1024);
        confirm.put_u32(32 * 1024);
        server.send(&confirm.finish()).await?;
        anyhow::Ok(client_id)
    };
    let (open_res, server_res) = tokio::join!(client.open_session(ChannelConfig::default()), server_side);
    let client_id = server_res?;
    let (session, mut session_rx) = open_res?;

    let server_side = async {
        let mut request = server.recv_msg(msg::CHANNEL_REQUEST).await?;
        ensure!(request.get_u32()? == 77);
        ensure!(request.get_string()? == "exec");
        ensure!(request.get_bool()?);
        ensure!(request.get_bytes()?.as_ref() == b"cat");
        server.send_channel(msg::CHANNEL_SUCCESS, client_id, &[]).await
    };
    let (exec_res, server_res) = tokio::join!(async { session.exec(b"cat")?.want_reply().await }, server_side);
    server_res?;
    exec_res?;

    session.send_stdin(Bytes::from_static(b"meow")).await?;
    session.send_eof()?;
    let mut data = server.recv_msg(msg::CHANNEL_DATA).await?;
    ensure!(data.get_u32()? == 77);
    ensure!(data.get_bytes()?.as_ref() == b"meow");
    server.recv_msg(msg::CHANNEL_EOF).await?;

    let mut stdout = Buffer::new();
    stdout.put_bytes(b"meow");
    server.send_channel(msg::CHANNEL_DATA, client_id, &stdout.finish()).await?;
    let mut exit_status = Buffer::new();
    exit_status.put_str("exit-status");
    exit_status.put_bool(false);
    exit_status.put_u32(0);
    server.send_channel(msg::CHANNEL_REQUEST, client_id, &exit_status.finish()).await?;
    server.send_channel(msg::CHANNEL_EOF, client_id, &[]).await?;
    server.send_channel(msg::CHANNEL_CLOSE, client_id, &[]).await?;

    let mut output = Vec::new();
    let mut exit_status = None;
    while let Some(event) = session_rx.recv().await {
        match event {
            SessionEvent::StdoutData(data) => output.extend_from_slice(&data),
            SessionEvent::ExitStatus(status) => exit_status = Some(status),
            SessionEvent::Eof => {},
            event => anyhow::bail!("unexpected event {:?}", event),
        }
    }
    ensure!(output == b"meow");
    ensure!(exit_status == Some(0));
    server.recv_msg(msg::CHANNEL_CLOSE).await?;

    client.disconnect(DisconnectError::by_app("done"))?;
    let mut disconnect_msg = server.recv_msg(msg::DISCONNECT).await?;
    ensure!(disconnect_msg.get_u32()? == disconnect::BY_APPLICATION);
    client_task.await??;
    client.wait().await?;
    Ok(())
}

#[tokio::test]
async fn rejected_host_key() -> Result<()> {
    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    let verifier = |_: Option<SocketAddr>, pubkey: &Pubkey| pubkey.type_name() != "ssh-ed25519";
    let (client, _client_rx, client_fut) = Client::open(client_io, config(), verifier, None)?;
    let client_task = tokio::spawn(client_fut);
    let mut server = FakeServer::new(server_io);

    // the client gives up before sending its NEWKEYS
    let handshake_res = server.handshake().await;
    ensure!(handshake_res.is_err());

    match client_task.await? {
        Err(Error::SessionFailed(err)) => ensure!(matches!(*err, Error::HostKeyNotVerifiable)),
        res => anyhow::bail!("unexpected result {:?}", res),
    }
    ensure!(matches!(client.auth_none("bob").await, Err(Error::SessionFailed(_))));
    Ok(())
}
