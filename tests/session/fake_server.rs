//! Minimal SSH server that frames packets by hand, without encryption.
use anyhow::{bail, ensure, Context as _, Result};
use bytes::Bytes;
use ed25519_dalek::Signer as _;
use std::task::Poll;
use std::time::Duration;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};
use tsuna::codes::msg;
use tsuna::kex::{Kex, KexAlgo, KexInput, KexOutput};
use tsuna::Buffer;

pub const EXCHANGE_HASH: [u8; 32] = [0x5a; 32];
const HOST_KEY_SEED: [u8; 32] = [0x11; 32];

/// Key exchange with a fixed outcome: one empty init packet from the client, one empty reply from
/// the server.
pub static FIXED_KEX: KexAlgo = KexAlgo {
    name: "fixed-kex@tsuna.test",
    make_kex: |_rng| Ok(Box::new(FixedKex { init_sent: false, reply_recvd: false })),
};

struct FixedKex {
    init_sent: bool,
    reply_recvd: bool,
}

impl Kex for FixedKex {
    fn recv_packet(&mut self, msg_id: u8, _payload: &mut Buffer) -> tsuna::Result<()> {
        match msg_id {
            msg::KEXDH_REPLY => { self.reply_recvd = true; Ok(()) },
            _ => Err(tsuna::Error::PacketNotImplemented(msg_id)),
        }
    }

    fn send_packet(&mut self) -> tsuna::Result<Option<Bytes>> {
        if self.init_sent {
            return Ok(None)
        }
        self.init_sent = true;
        Ok(Some(Bytes::from_static(&[msg::KEXDH_INIT])))
    }

    fn poll(&mut self, _input: KexInput) -> Poll<tsuna::Result<KexOutput>> {
        if !self.reply_recvd {
            return Poll::Pending
        }
        let signing = ed25519_dalek::SigningKey::from_bytes(&HOST_KEY_SEED);
        let mut pubkey = Buffer::new();
        pubkey.put_str("ssh-ed25519");
        pubkey.put_bytes(signing.verifying_key().as_bytes());
        let mut sign = Buffer::new();
        sign.put_str("ssh-ed25519");
        sign.put_bytes(&signing.sign(&EXCHANGE_HASH).to_bytes());
        Poll::Ready(Ok(KexOutput {
            shared_secret_be: vec![0x01, 0x02, 0x03],
            exchange_hash: EXCHANGE_HASH.to_vec(),
            server_pubkey: pubkey.finish(),
            server_exchange_hash_sign: sign.finish(),
        }))
    }

    fn compute_hash(&self, data: &[u8]) -> Vec<u8> {
        use sha2::Digest as _;
        sha2::Sha256::digest(data).to_vec()
    }
}

pub struct FakeServer {
    stream: DuplexStream,
    recv_buf: Vec<u8>,
}

impl FakeServer {
    pub fn new(stream: DuplexStream) -> FakeServer {
        FakeServer { stream, recv_buf: Vec::new() }
    }

    async fn fill(&mut self) -> Result<()> {
        let mut buf = [0; 4096];
        let len = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf)).await
            .context("timeout waiting for the client")??;
        ensure!(len > 0, "client closed the connection");
        self.recv_buf.extend_from_slice(&buf[..len]);
        Ok(())
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        // RFC 4253, section 6, with 8-byte blocks and no MAC
        let mut padding_len = 8 - (5 + payload.len()) % 8;
        if padding_len < 4 {
            padding_len += 8;
        }
        let mut packet = Vec::with_capacity(5 + payload.len() + padding_len);
        packet.extend_from_slice(&((1 + payload.len() + padding_len) as u32).to_be_bytes());
        packet.push(padding_len as u8);
        packet.extend_from_slice(payload);
        packet.resize(packet.len() + padding_len, 0);
        self.stream.write_all(&packet).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Buffer> {
        loop {
            if self.recv_buf.len() >= 4 {
                let packet_len = u32::from_be_bytes(self.recv_buf[..4].try_into()?) as usize;
                if self.recv_buf.len() >= 4 + packet_len {
                    let packet: Vec<u8> = self.recv_buf.drain(..4 + packet_len).collect();
                    let padding_len = packet[4] as usize;
                    return Ok(Buffer::from_slice(&packet[5..4 + packet_len - padding_len]))
                }
            }
            self.fill().await?;
        }
    }

    pub async fn recv_msg(&mut self, msg_id: u8) -> Result<Buffer> {
        let mut payload = self.recv().await?;
        let recvd_id = payload.get_u8()?;
        if recvd_id != msg_id {
            bail!("expected {}, received {}", msg::to_str(msg_id), msg::to_str(recvd_id))
        }
        Ok(payload)
    }

    async fn recv_line(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.recv_buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.recv_buf.drain(..pos + 2).take(pos).collect();
                return Ok(line)
            }
            self.fill().await?;
        }
    }

    /// Runs the key exchange and returns the identification of the client.
    pub async fn handshake(&mut self) -> Result<Vec<u8>> {
        self.stream.write_all(b"SSH-2.0-OpenSSH_9.0\r\n").await?;

        let mut kex_init = Buffer::new();
        kex_init.put_u8(msg::KEXINIT);
        kex_init.put_raw(&[0; 16]);
        kex_init.put_name_list(&[FIXED_KEX.name]);
        kex_init.put_name_list(&["ssh-ed25519"]);
        for _ in 0..6 {
            kex_init.put_name_list(&["none"]);
        }
        kex_init.put_name_list(&[]);
        kex_init.put_name_list(&[]);
        kex_init.put_bool(false);
        kex_init.put_u32(0);
        self.send(&kex_init.finish()).await?;
        self.send(&[msg::KEXDH_REPLY]).await?;
        self.send(&[msg::NEWKEYS]).await?;

        let ident = self.recv_line().await?;
        self.recv_msg(msg::KEXINIT).await?;
        self.recv_msg(msg::KEXDH_INIT).await?;
        self.recv_msg(msg::NEWKEYS).await?;
        Ok(ident)
    }

    pub async fn accept_auth_none(&mut self, username: &str) -> Result<()> {
        let mut request = self.recv_msg(msg::SERVICE_REQUEST).await?;
        ensure!(request.get_string()? == "ssh-userauth");
        let mut accept = Buffer::new();
        accept.put_u8(msg::SERVICE_ACCEPT);
        accept.put_str("ssh-userauth");
        self.send(&accept.finish()).await?;

        let mut request = self.recv_msg(msg::USERAUTH_REQUEST).await?;
        ensure!(request.get_string()? == username);
        ensure!(request.get_string()? == "ssh-connection");
        ensure!(request.get_string()? == "none");
        self.send(&[msg::USERAUTH_SUCCESS]).await
    }

    pub async fn send_channel(&mut self, msg_id: u8, recipient: u32, body: &[u8]) -> Result<()> {
        let mut payload = Buffer::new();
        payload.put_u8(msg_id);
        payload.put_u32(recipient);
        payload.put_raw(body);
        self.send(&payload.finish()).await
    }
}
