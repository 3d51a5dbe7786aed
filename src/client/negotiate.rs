use bytes::Bytes;
use rand::RngCore as _;
use std::sync::Arc;
use std::task::Poll;
use std::time::Instant;
use crate::cipher::CipherAlgo;
use crate::codec::{Buffer, DecryptKeys, EncryptKeys};
use crate::compress::{CompressAlgo, Decompress};
use crate::codes::msg;
use crate::error::{AlgoNegotiateError, Error, Result};
use crate::kex::{Kex, KexAlgo, KexInput, KexOutput};
use crate::mac::MacAlgo;
use crate::pubkey::{Pubkey, PubkeyAlgo};
use super::client_state::ClientState;
use super::pending::{PendingReply, PendingSlot};
use super::service::waiter_error;
use super::transport::Transport;

// upper bound for `rekey_after_bytes`, RFC 4344 recommends to rekey after 1 GiB
const REKEY_AFTER_BYTES_MAX: u64 = 1 << 30;

#[derive(Default)]
pub(super) struct NegotiateState {
    state: State,
    our_kex_init: Option<Bytes>,
    their_kex_init: Option<Bytes>,
    algos: Option<Algos>,
    kex: Option<Box<dyn Kex + Send>>,
    ignore_next_kex_packet: bool,
    kex_packet_seqs: Vec<u32>,
    new_recv: Option<NewRecvKeys>,
    waiters: Vec<PendingSlot<()>>,
    exchanges: u32,
    last_kex_at: Option<Instant>,
    bytes_at_last_kex: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
enum State {
    #[default]
    Idle,
    ExpectKexInit,
    ExpectFollowup,
    ExpectNewKeys,
    Done,
}

#[derive(Debug, Copy, Clone)]
struct Algos {
    kex: &'static KexAlgo,
    server_pubkey: &'static PubkeyAlgo,
    cipher_cts: &'static CipherAlgo,
    cipher_stc: &'static CipherAlgo,
    mac_cts: &'static MacAlgo,
    mac_stc: &'static MacAlgo,
    compress_cts: &'static CompressAlgo,
    compress_stc: &'static CompressAlgo,
}

struct NewRecvKeys {
    keys: DecryptKeys,
    decompress: Box<dyn Decompress + Send>,
    delayed: bool,
}

/// The six keys derived from a finished key exchange (RFC 4253, section 7.2).
#[derive(Debug, PartialEq, Eq)]
pub(super) struct DerivedKeys {
    pub iv_cts: Vec<u8>,
    pub iv_stc: Vec<u8>,
    pub enc_cts: Vec<u8>,
    pub enc_stc: Vec<u8>,
    pub mac_cts: Vec<u8>,
    pub mac_stc: Vec<u8>,
}

impl NegotiateState {
    pub fn exchanges(&self) -> u32 {
        self.exchanges
    }

    /// True if the peer may be in the middle of a key exchange, so it must not send service
    /// packets.
    pub fn is_peer_in_kex(&self) -> bool {
        matches!(self.state, State::ExpectFollowup | State::ExpectNewKeys)
    }

    pub fn is_kex_packet_seq(&self, packet_seq: u32) -> bool {
        self.kex_packet_seqs.contains(&packet_seq)
    }

    pub fn notify_error(&mut self, err: &Arc<Error>) {
        for mut waiter in self.waiters.drain(..) {
            waiter.resolve(Err(waiter_error(err)));
        }
    }
}

/// Starts a key exchange unless one is already in progress.
pub(super) fn start_kex(st: &mut ClientState) -> Result<()> {
    if !matches!(st.negotiate.state, State::Idle | State::Done) {
        return Ok(())
    }
    st.tr.begin_kex();
    send_kex_init(st)?;
    st.negotiate.state = State::ExpectKexInit;
    Ok(())
}

/// Starts a key re-exchange and returns a reply that resolves when it is finished.
pub(super) fn rekey(st: &mut ClientState) -> Result<PendingReply<()>> {
    start_kex(st)?;
    let (slot, reply) = PendingSlot::new();
    st.negotiate.waiters.push(slot);
    Ok(reply)
}

/// Starts a key re-exchange if we have transferred too many bytes or too much time has elapsed
/// since the last exchange.
pub(super) fn check_rekey(st: &mut ClientState) -> Result<()> {
    if st.negotiate.state != State::Done {
        return Ok(())
    }

    let bytes_limit = st.tr.config.rekey_after_bytes.min(REKEY_AFTER_BYTES_MAX);
    let bytes = st.tr.transferred_bytes() - st.negotiate.bytes_at_last_kex;
    let elapsed = st.negotiate.last_kex_at.map(|at| at.elapsed()).unwrap_or_default();
    if bytes >= bytes_limit {
        log::debug!("starting key re-exchange after {} bytes", bytes);
        start_kex(st)
    } else if elapsed >= st.tr.config.rekey_after_duration {
        log::debug!("starting key re-exchange after {:?}", elapsed);
        start_kex(st)
    } else {
        Ok(())
    }
}

pub(super) fn recv_negotiate_packet(
    st: &mut ClientState,
    msg_id: u8,
    payload: &mut Buffer,
    raw: &Bytes,
) -> Result<()> {
    match msg_id {
        msg::KEXINIT => recv_kex_init(st, payload, raw),
        msg::NEWKEYS => recv_new_keys(st),
        _ => Err(Error::PacketNotImplemented(msg_id)),
    }
}

pub(super) fn recv_kex_packet(st: &mut ClientState, msg_id: u8, payload: &mut Buffer) -> Result<()> {
    if st.negotiate.state != State::ExpectFollowup {
        return Err(Error::Protocol("received unexpected key exchange packet"))
    }

    if st.negotiate.ignore_next_kex_packet {
        st.negotiate.ignore_next_kex_packet = false;
        log::debug!("ignoring wrongly guessed key exchange packet {}", msg_id);
        return Ok(())
    }

    let kex = st.negotiate.kex.as_mut()
        .ok_or(Error::Protocol("received key exchange packet, but no exchange is running"))?;
    kex.recv_packet(msg_id, payload)?;
    pump_kex(st)
}

fn send_kex_init(st: &mut ClientState) -> Result<()> {
    let mut cookie = [0; 16];
    st.tr.rng.try_fill_bytes(&mut cookie)
        .map_err(|_| Error::Crypto("could not generate random cookie"))?;

    fn get_algo_names<A: NamedAlgo>(algos: &[&A]) -> Vec<&'static str> {
        algos.iter().map(|algo| algo.name()).collect()
    }

    let config = &st.tr.config;
    let cipher_names = get_algo_names(&config.cipher_algos);
    let mac_names = get_algo_names(&config.mac_algos);
    let compress_names = get_algo_names(&config.compress_algos);

    // RFC 4253, section 7.1
    let mut payload = Buffer::new();
    payload.put_u8(msg::KEXINIT);
    payload.put_raw(&cookie);
    payload.put_name_list(&get_algo_names(&config.kex_algos));
    payload.put_name_list(&get_algo_names(&config.server_pubkey_algos));
    payload.put_name_list(&cipher_names);
    payload.put_name_list(&cipher_names);
    payload.put_name_list(&mac_names);
    payload.put_name_list(&mac_names);
    payload.put_name_list(&compress_names);
    payload.put_name_list(&compress_names);
    payload.put_name_list(&[]);
    payload.put_name_list(&[]);
    payload.put_bool(false);
    payload.put_u32(0);
    let payload = payload.finish();

    let packet_seq = st.tr.send_packet(&payload)?;
    st.negotiate.kex_packet_seqs.extend(packet_seq.sent());
    st.negotiate.our_kex_init = Some(payload);
    log::debug!("sending SSH_MSG_KEXINIT");
    Ok(())
}

#[derive(Debug)]
struct TheirKexInit {
    kex_algos: Vec<String>,
    server_pubkey_algos: Vec<String>,
    cipher_algos_cts: Vec<String>,
    cipher_algos_stc: Vec<String>,
    mac_algos_cts: Vec<String>,
    mac_algos_stc: Vec<String>,
    compress_algos_cts: Vec<String>,
    compress_algos_stc: Vec<String>,
    first_kex_packet_follows: bool,
}

fn recv_kex_init(st: &mut ClientState, payload: &mut Buffer, raw: &Bytes) -> Result<()> {
    if matches!(st.negotiate.state, State::Idle | State::Done) {
        log::debug!("server started key re-exchange");
        start_kex(st)?;
    }
    if st.negotiate.state != State::ExpectKexInit {
        return Err(Error::Protocol("received SSH_MSG_KEXINIT during key exchange"))
    }

    // RFC 4253, section 7.1
    payload.skip(16)?; // cookie
    let kex_init = TheirKexInit {
        kex_algos: payload.get_name_list()?,
        server_pubkey_algos: payload.get_name_list()?,
        cipher_algos_cts: payload.get_name_list()?,
        cipher_algos_stc: payload.get_name_list()?,
        mac_algos_cts: payload.get_name_list()?,
        mac_algos_stc: payload.get_name_list()?,
        compress_algos_cts: payload.get_name_list()?,
        compress_algos_stc: payload.get_name_list()?,
        first_kex_packet_follows: {
            payload.get_name_list()?; // languages_client_to_server
            payload.get_name_list()?; // languages_server_to_client
            payload.get_bool()?
        },
    };
    payload.get_u32()?; // reserved
    log::debug!("received SSH_MSG_KEXINIT: {:?}", kex_init);

    let algos = negotiate_algos(&st.tr, &kex_init)?;
    if kex_init.first_kex_packet_follows && guessed_wrong(&st.tr, &kex_init) {
        log::debug!("server guessed the key exchange wrongly, its next kex packet will be ignored");
        st.negotiate.ignore_next_kex_packet = true;
    }

    st.negotiate.their_kex_init = Some(raw.clone());
    st.negotiate.algos = Some(algos);
    st.negotiate.kex = Some((algos.kex.make_kex)(&mut *st.tr.rng)?);
    st.negotiate.state = State::ExpectFollowup;
    pump_kex(st)
}

// RFC 4253, section 7: the guess is wrong if the preferred kex algorithms or host key algorithms
// differ
fn guessed_wrong(tr: &Transport, kex_init: &TheirKexInit) -> bool {
    let our_kex = tr.config.kex_algos.first().map(|algo| algo.name);
    let our_pubkey = tr.config.server_pubkey_algos.first().map(|algo| algo.name);
    our_kex != kex_init.kex_algos.first().map(|name| name.as_str()) ||
        our_pubkey != kex_init.server_pubkey_algos.first().map(|name| name.as_str())
}

fn negotiate_algos(tr: &Transport, their: &TheirKexInit) -> Result<Algos> {
    let config = &tr.config;
    Ok(Algos {
        kex: negotiate_algo(&config.kex_algos, &their.kex_algos, "key exchange")?,
        server_pubkey: negotiate_algo(
            &config.server_pubkey_algos, &their.server_pubkey_algos, "server public key")?,
        cipher_cts: negotiate_algo(
            &config.cipher_algos, &their.cipher_algos_cts, "cipher client-to-server")?,
        cipher_stc: negotiate_algo(
            &config.cipher_algos, &their.cipher_algos_stc, "cipher server-to-client")?,
        mac_cts: negotiate_algo(&config.mac_algos, &their.mac_algos_cts, "mac client-to-server")?,
        mac_stc: negotiate_algo(&config.mac_algos, &their.mac_algos_stc, "mac server-to-client")?,
        compress_cts: negotiate_algo(
            &config.compress_algos, &their.compress_algos_cts, "compression client-to-server")?,
        compress_stc: negotiate_algo(
            &config.compress_algos, &their.compress_algos_stc, "compression server-to-client")?,
    })
}

fn negotiate_algo<A: NamedAlgo>(
    our_algos: &[&'static A],
    their_algos: &[String],
    name: &'static str,
) -> Result<&'static A> {
    for our_algo in our_algos.iter() {
        if their_algos.iter().any(|their_algo| our_algo.name() == their_algo.as_str()) {
            log::debug!("negotiated algo {:?} for {}", our_algo.name(), name);
            return Ok(our_algo)
        }
    }

    Err(Error::AlgoNegotiate(AlgoNegotiateError {
        algo_name: name.into(),
        our_algos: our_algos.iter().map(|a| a.name().into()).collect(),
        their_algos: their_algos.into(),
    }))
}

trait NamedAlgo { fn name(&self) -> &'static str; }
impl NamedAlgo for KexAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for CipherAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for MacAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for CompressAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for PubkeyAlgo { fn name(&self) -> &'static str { self.name } }

fn pump_kex(st: &mut ClientState) -> Result<()> {
    let Some(mut kex) = st.negotiate.kex.take() else {
        return Err(Error::Protocol("key exchange is not running"))
    };

    while let Some(payload) = kex.send_packet()? {
        let packet_seq = st.tr.send_packet(&payload)?;
        st.negotiate.kex_packet_seqs.extend(packet_seq.sent());
    }

    let (Some(their_ident), Some(our_kex_init), Some(their_kex_init)) = (
        st.tr.their_ident.as_ref(),
        st.negotiate.our_kex_init.as_ref(),
        st.negotiate.their_kex_init.as_ref(),
    ) else {
        return Err(Error::Protocol("key exchange started before both SSH_MSG_KEXINIT"))
    };
    let input = KexInput {
        client_ident: &st.tr.our_ident,
        server_ident: their_ident,
        client_kex_init: our_kex_init,
        server_kex_init: their_kex_init,
    };

    match kex.poll(input) {
        Poll::Pending => {
            st.negotiate.kex = Some(kex);
            Ok(())
        },
        Poll::Ready(output) => {
            log::debug!("finished key exchange");
            finish_kex(st, &*kex, output?)
        },
    }
}

fn finish_kex(st: &mut ClientState, kex: &dyn Kex, output: KexOutput) -> Result<()> {
    let algos = st.negotiate.algos
        .ok_or(Error::Protocol("key exchange finished without negotiated algorithms"))?;
    verify_server_pubkey(&mut st.tr, algos.server_pubkey, &output)?;

    let session_id = st.tr.session_id
        .get_or_insert_with(|| Bytes::copy_from_slice(&output.exchange_hash))
        .clone();
    let keys = derive_keys(kex, &output, &session_id,
        (algos.cipher_cts, algos.mac_cts), (algos.cipher_stc, algos.mac_stc));

    let new_recv = NewRecvKeys {
        keys: DecryptKeys {
            decrypt: (algos.cipher_stc.make_decrypt)(&keys.enc_stc, &keys.iv_stc)?,
            mac: (algos.mac_stc.make_mac)(&keys.mac_stc),
            mac_variant: algos.mac_stc.variant,
            block_len: algos.cipher_stc.block_len,
            tag_len: algos.mac_stc.tag_len,
        },
        decompress: (algos.compress_stc.make_decompress)(),
        delayed: algos.compress_stc.delayed && !st.tr.is_authenticated(),
    };
    send_new_keys(&mut st.tr, &algos, &keys)?;

    st.negotiate.new_recv = Some(new_recv);
    st.negotiate.state = State::ExpectNewKeys;
    Ok(())
}

fn verify_server_pubkey(tr: &mut Transport, algo: &'static PubkeyAlgo, output: &KexOutput) -> Result<()> {
    let pubkey = Pubkey::decode(output.server_pubkey.clone())?;
    (algo.verify)(&pubkey, &output.exchange_hash, output.server_exchange_hash_sign.clone())?;
    log::debug!("server host key {} signed the exchange hash", pubkey);

    if !tr.verifier.verify(tr.remote_addr, &pubkey) {
        return Err(Error::HostKeyNotVerifiable)
    }
    log::debug!("server host key was accepted");
    Ok(())
}

fn send_new_keys(tr: &mut Transport, algos: &Algos, keys: &DerivedKeys) -> Result<()> {
    let encrypt = EncryptKeys {
        encrypt: (algos.cipher_cts.make_encrypt)(&keys.enc_cts, &keys.iv_cts)?,
        mac: (algos.mac_cts.make_mac)(&keys.mac_cts),
        mac_variant: algos.mac_cts.variant,
        block_len: algos.cipher_cts.block_len,
        tag_len: algos.mac_cts.tag_len,
    };

    let mut payload = Buffer::new();
    payload.put_u8(msg::NEWKEYS);
    tr.send_packet(&payload.finish())?;

    tr.codec.send_pipe.set_encrypt(encrypt);
    let delayed = algos.compress_cts.delayed && !tr.is_authenticated();
    tr.codec.send_pipe.set_compress((algos.compress_cts.make_compress)(), delayed);
    log::debug!("sent SSH_MSG_NEWKEYS and applied new keys");

    tr.lower_barrier()
}

fn recv_new_keys(st: &mut ClientState) -> Result<()> {
    if st.negotiate.state != State::ExpectNewKeys {
        return Err(Error::Protocol("received unexpected SSH_MSG_NEWKEYS"))
    }
    let new_recv = st.negotiate.new_recv.take()
        .ok_or(Error::Protocol("received SSH_MSG_NEWKEYS before the keys were derived"))?;

    st.tr.codec.recv_pipe.set_decrypt(new_recv.keys);
    st.tr.codec.recv_pipe.set_decompress(new_recv.decompress, new_recv.delayed);
    log::debug!("received SSH_MSG_NEWKEYS and applied new keys");

    let neg = &mut st.negotiate;
    neg.state = State::Done;
    neg.our_kex_init = None;
    neg.their_kex_init = None;
    neg.algos = None;
    neg.ignore_next_kex_packet = false;
    neg.kex_packet_seqs.clear();
    neg.exchanges += 1;
    neg.last_kex_at = Some(Instant::now());
    neg.bytes_at_last_kex = st.tr.transferred_bytes();
    for mut waiter in neg.waiters.drain(..) {
        waiter.resolve(Ok(()));
    }

    st.tr.end_kex();
    Ok(())
}

pub(super) fn derive_keys(
    kex: &dyn Kex,
    output: &KexOutput,
    session_id: &[u8],
    algos_cts: (&CipherAlgo, &MacAlgo),
    algos_stc: (&CipherAlgo, &MacAlgo),
) -> DerivedKeys {
    let derive = |key_type, key_len| derive_key(kex, output, session_id, key_type, key_len);
    DerivedKeys {
        iv_cts: derive(b'A', algos_cts.0.iv_len),
        iv_stc: derive(b'B', algos_stc.0.iv_len),
        enc_cts: derive(b'C', algos_cts.0.key_len),
        enc_stc: derive(b'D', algos_stc.0.key_len),
        mac_cts: derive(b'E', algos_cts.1.key_len),
        mac_stc: derive(b'F', algos_stc.1.key_len),
    }
}

fn derive_key(
    kex: &dyn Kex,
    output: &KexOutput,
    session_id: &[u8],
    key_type: u8,
    key_len: usize,
) -> Vec<u8> {
    // RFC 4253, section 7.2
    let mut to_hash_prefix = Buffer::new();
    to_hash_prefix.put_mpint_uint_be(&output.shared_secret_be);
    to_hash_prefix.put_raw(&output.exchange_hash);

    let mut key = {
        let mut to_hash = to_hash_prefix.clone();
        to_hash.put_u8(key_type);
        to_hash.put_raw(session_id);
        kex.compute_hash(&to_hash.finish())
    };

    while key.len() < key_len {
        let mut to_hash = to_hash_prefix.clone();
        to_hash.put_raw(&key);
        key.extend_from_slice(&kex.compute_hash(&to_hash.finish()));
    }

    key.truncate(key_len);
    key
}
