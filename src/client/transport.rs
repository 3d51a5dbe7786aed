use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use crate::codec::{Buffer, Codec, RecvPipe, SendPipe};
use crate::codes::msg;
use crate::error::{Error, Result};
use crate::util::CryptoRngCore;
use super::client::{ClientConfig, HostKeyVerifier};
use super::client_event::ClientEvent;

/// Lifecycle of the SSH session.
///
/// During a key re-exchange the phase is [`KeyExchange`][Phase::KeyExchange] and the session
/// returns to the previous phase once the new keys are in place.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Exchanging identification strings.
    Connecting,
    /// Key exchange is in progress.
    KeyExchange,
    /// The first key exchange has finished, no service was requested yet.
    KeyExchangeDone,
    /// We have requested a service and wait for the server to accept it.
    ServiceRequested,
    /// A service (user authentication or the connection protocol) is running.
    ServiceActive,
    /// The session failed with an error.
    Error,
    /// The session was closed.
    Closed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Error | Phase::Closed)
    }
}

// limit of bytes waiting for the socket before writers of channel data are blocked
const SEND_BACKLOG_MAX: usize = 256 * 1024;

// number of flushes of deferred packets whose sequence numbers we remember
const FLUSH_HISTORY: usize = 4;

/// Identifies a packet passed to [`Transport::send_packet()`].
///
/// A packet held back by the re-key barrier has no sequence number until it is flushed, so it is
/// identified by a ticket instead; [`Transport::packet_seq()`] translates the ticket later.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) enum PacketSeq {
    Sent(u32),
    Deferred(u64),
}

impl PacketSeq {
    pub fn sent(self) -> Option<u32> {
        match self {
            PacketSeq::Sent(packet_seq) => Some(packet_seq),
            PacketSeq::Deferred(_) => None,
        }
    }
}

// deferred packets with tickets `first_ticket..first_ticket + count` were sent with consecutive
// sequence numbers starting at `first_seq`
#[derive(Debug, Copy, Clone)]
struct Flush {
    first_ticket: u64,
    count: u64,
    first_seq: u32,
}

/// The transport layer state that is shared by the services.
pub(super) struct Transport {
    pub config: ClientConfig,
    pub codec: Codec,
    pub rng: Box<dyn CryptoRngCore + Send>,
    pub our_ident: Bytes,
    pub their_ident: Option<Bytes>,
    pub session_id: Option<Bytes>,
    pub remote_addr: Option<SocketAddr>,
    pub verifier: Box<dyn HostKeyVerifier>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    notify: Arc<Notify>,
    phase: Phase,
    kex_return_phase: Option<Phase>,
    barrier: bool,
    deferred: VecDeque<Bytes>,
    next_ticket: u64,
    flushes: VecDeque<Flush>,
    authenticated: bool,
    error: Option<Arc<Error>>,
    last_recv: Instant,
}

impl Transport {
    pub fn new(
        config: ClientConfig,
        mut rng: Box<dyn CryptoRngCore + Send>,
        verifier: Box<dyn HostKeyVerifier>,
        remote_addr: Option<SocketAddr>,
        event_tx: mpsc::UnboundedSender<ClientEvent>,
        notify: Arc<Notify>,
    ) -> Result<Transport> {
        let codec = Codec {
            recv_pipe: RecvPipe::new(config.max_packet_len),
            send_pipe: SendPipe::new(&mut *rng)?,
        };
        let our_ident = Bytes::copy_from_slice(config.ident.as_bytes());
        Ok(Transport {
            config,
            codec,
            rng,
            our_ident,
            their_ident: None,
            session_id: None,
            remote_addr,
            verifier,
            event_tx,
            notify,
            phase: Phase::Connecting,
            kex_return_phase: None,
            // nothing but the key exchange may be sent before the first NEWKEYS
            barrier: true,
            deferred: VecDeque::new(),
            next_ticket: 0,
            flushes: VecDeque::new(),
            authenticated: false,
            error: None,
            last_recv: Instant::now(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Moves the session to `phase`.
    ///
    /// While a key exchange is running, non-terminal phases become the phase that we return to
    /// when the exchange finishes.
    pub fn set_phase(&mut self, phase: Phase) {
        if self.phase == Phase::KeyExchange && !phase.is_terminal() && phase != Phase::KeyExchange {
            self.kex_return_phase = Some(phase);
        } else if self.phase != phase {
            log::debug!("session phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
        self.wake();
    }

    /// Enters the key exchange and raises the re-key barrier.
    pub fn begin_kex(&mut self) {
        if self.phase != Phase::KeyExchange {
            self.kex_return_phase = match self.phase {
                Phase::Connecting => None,
                phase => Some(phase),
            };
            log::debug!("session phase {:?} -> {:?}", self.phase, Phase::KeyExchange);
            self.phase = Phase::KeyExchange;
        }
        self.barrier = true;
        self.wake();
    }

    /// Our NEWKEYS has been sent: lowers the barrier and flushes the packets that were held back,
    /// encrypted with the new keys.
    pub fn lower_barrier(&mut self) -> Result<()> {
        self.barrier = false;
        if !self.deferred.is_empty() {
            log::debug!("sending {} packets deferred by the key exchange", self.deferred.len());
            let count = self.deferred.len() as u64;
            let flush = Flush {
                first_ticket: self.next_ticket - count,
                count,
                first_seq: self.codec.send_pipe.packet_seq(),
            };
            if self.flushes.len() == FLUSH_HISTORY {
                self.flushes.pop_front();
            }
            self.flushes.push_back(flush);
        }
        while let Some(payload) = self.deferred.pop_front() {
            self.codec.send_pipe.feed_packet(&payload)?;
        }
        self.wake();
        Ok(())
    }

    /// Both sides have switched to the new keys.
    pub fn end_kex(&mut self) {
        if self.phase == Phase::KeyExchange {
            let phase = self.kex_return_phase.take().unwrap_or(Phase::KeyExchangeDone);
            log::debug!("session phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
        self.wake();
    }

    /// Sends a packet, or queues it if the re-key barrier is up.
    ///
    /// Returns the sequence number of the packet, or a ticket if the packet was queued.
    pub fn send_packet(&mut self, payload: &[u8]) -> Result<PacketSeq> {
        self.check_alive()?;
        let msg_id = payload.first().copied()
            .ok_or(Error::Protocol("attempted to send an empty packet"))?;
        if self.barrier && !msg::is_kex_safe(msg_id) {
            log::trace!("deferring {} until the key exchange finishes", msg::to_str(msg_id));
            self.deferred.push_back(Bytes::copy_from_slice(payload));
            let ticket = self.next_ticket;
            self.next_ticket += 1;
            return Ok(PacketSeq::Deferred(ticket))
        }

        let packet_seq = self.codec.send_pipe.feed_packet(payload)?;
        log::trace!("sending {}, seq {}", msg::to_str(msg_id), packet_seq);
        self.wake();
        Ok(PacketSeq::Sent(packet_seq))
    }

    /// The sequence number that the packet was sent with, or `None` if it is still deferred (or
    /// was flushed so long ago that we forgot).
    pub fn packet_seq(&self, packet: PacketSeq) -> Option<u32> {
        let ticket = match packet {
            PacketSeq::Sent(packet_seq) => return Some(packet_seq),
            PacketSeq::Deferred(ticket) => ticket,
        };
        self.flushes.iter()
            .find(|flush| ticket >= flush.first_ticket && ticket - flush.first_ticket < flush.count)
            .map(|flush| flush.first_seq.wrapping_add((ticket - flush.first_ticket) as u32))
    }

    /// Sends SSH_MSG_DISCONNECT, bypassing all checks.
    pub fn send_disconnect(&mut self, reason_code: u32, description: &str) {
        let mut payload = Buffer::new();
        payload.put_u8(msg::DISCONNECT);
        payload.put_u32(reason_code);
        payload.put_str(description);
        payload.put_str("");
        match self.codec.send_pipe.feed_packet(&payload.finish()) {
            Ok(_) => log::debug!("sending SSH_MSG_DISCONNECT with reason {}: {:?}",
                reason_code, description),
            Err(err) => log::debug!("could not send SSH_MSG_DISCONNECT: {}", err),
        }
        self.wake();
    }

    /// True if channel data can be written: no key exchange is in progress and the socket is
    /// keeping up with us.
    pub fn can_write(&self) -> bool {
        !self.barrier && self.codec.send_pipe.pending_len() < SEND_BACKLOG_MAX
    }

    pub fn check_alive(&self) -> Result<()> {
        if let Some(err) = self.error.as_ref() {
            return Err(Error::SessionFailed(err.clone()))
        }
        if self.phase == Phase::Closed {
            return Err(Error::SessionClosed)
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn error(&self) -> Option<&Arc<Error>> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, err: Arc<Error>) {
        self.error = Some(err);
        self.deferred.clear();
        self.phase = Phase::Error;
        self.wake();
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// The user has authenticated, which also switches on delayed compression.
    pub fn set_authenticated(&mut self) {
        self.authenticated = true;
        self.codec.send_pipe.start_delayed_compression();
        self.codec.recv_pipe.start_delayed_compression();
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.codec.send_pipe.sent_bytes() + self.codec.recv_pipe.recv_bytes()
    }

    pub fn touch_recv(&mut self) {
        self.last_recv = Instant::now();
    }

    pub fn last_recv(&self) -> Instant {
        self.last_recv
    }

    pub fn send_event(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Wakes up the writer task and everybody who waits for a change of the session state.
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Decodes the packets that we have sent so far, assuming that no keys are installed.
    #[cfg(test)]
    pub fn take_sent_payloads(&mut self) -> Vec<Bytes> {
        let mut recv_pipe = RecvPipe::new(self.config.max_packet_len);
        recv_pipe.feed(&self.codec.send_pipe.take_bytes());
        let mut payloads = Vec::new();
        while let Some(packet) = recv_pipe.consume_packet().unwrap() {
            payloads.push(packet.payload);
        }
        payloads
    }

    #[cfg(test)]
    pub fn new_for_test(config: ClientConfig) -> Transport {
        use rand::SeedableRng as _;
        let rng = Box::new(rand_chacha::ChaCha8Rng::seed_from_u64(7));
        let verifier = Box::new(|_: Option<SocketAddr>, _: &crate::pubkey::Pubkey| true);
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let mut tr = Transport::new(config, rng, verifier, None, event_tx, Arc::new(Notify::new()))
            .unwrap();
        tr.barrier = false;
        tr.phase = Phase::ServiceActive;
        tr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(msg_id: u8) -> Vec<u8> {
        vec![msg_id, 1, 2, 3]
    }

    #[test]
    fn test_barrier_defers_service_packets() {
        let mut tr = Transport::new_for_test(ClientConfig::default());
        tr.begin_kex();
        assert_eq!(tr.phase(), Phase::KeyExchange);
        assert!(!tr.can_write());

        assert_eq!(tr.send_packet(&payload(msg::CHANNEL_DATA)).unwrap(), PacketSeq::Deferred(0));
        assert_eq!(tr.send_packet(&payload(msg::SERVICE_REQUEST)).unwrap(), PacketSeq::Deferred(1));
        assert_eq!(tr.send_packet(&payload(msg::KEXINIT)).unwrap(), PacketSeq::Sent(0));
        assert_eq!(tr.send_packet(&payload(msg::IGNORE)).unwrap(), PacketSeq::Sent(1));
        let sent = tr.take_sent_payloads();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0][0], msg::KEXINIT);

        tr.lower_barrier().unwrap();
        assert!(tr.can_write());
        let sent = tr.take_sent_payloads();
        assert_eq!(sent.iter().map(|p| p[0]).collect::<Vec<_>>(),
            vec![msg::CHANNEL_DATA, msg::SERVICE_REQUEST]);
        assert_eq!(tr.codec.send_pipe.packet_seq(), 4);

        tr.end_kex();
        assert_eq!(tr.phase(), Phase::ServiceActive);
    }

    #[test]
    fn test_phase_during_kex() {
        let mut tr = Transport::new_for_test(ClientConfig::default());
        tr.phase = Phase::Connecting;
        tr.begin_kex();
        tr.lower_barrier().unwrap();
        tr.end_kex();
        assert_eq!(tr.phase(), Phase::KeyExchangeDone);

        tr.begin_kex();
        tr.set_phase(Phase::ServiceRequested);
        assert_eq!(tr.phase(), Phase::KeyExchange);
        tr.end_kex();
        assert_eq!(tr.phase(), Phase::ServiceRequested);
    }

    #[test]
    fn test_deferred_packet_seq() {
        let mut tr = Transport::new_for_test(ClientConfig::default());
        assert_eq!(tr.send_packet(&payload(msg::IGNORE)).unwrap(), PacketSeq::Sent(0));

        tr.begin_kex();
        let first = tr.send_packet(&payload(msg::GLOBAL_REQUEST)).unwrap();
        assert_eq!(tr.send_packet(&payload(msg::KEXINIT)).unwrap(), PacketSeq::Sent(1));
        let second = tr.send_packet(&payload(msg::CHANNEL_DATA)).unwrap();
        assert_eq!(tr.packet_seq(first), None);

        tr.send_packet(&payload(msg::NEWKEYS)).unwrap();
        tr.lower_barrier().unwrap();
        assert_eq!(tr.packet_seq(first), Some(3));
        assert_eq!(tr.packet_seq(second), Some(4));
        tr.end_kex();

        tr.begin_kex();
        let third = tr.send_packet(&payload(msg::GLOBAL_REQUEST)).unwrap();
        assert_eq!(third, PacketSeq::Deferred(2));
        tr.lower_barrier().unwrap();
        assert_eq!(tr.packet_seq(third), Some(5));
        assert_eq!(tr.packet_seq(first), Some(3));
        assert_eq!(tr.packet_seq(PacketSeq::Sent(7)), Some(7));
    }

    #[test]
    fn test_send_after_error() {
        let mut tr = Transport::new_for_test(ClientConfig::default());
        tr.set_error(Arc::new(Error::Mac));
        assert_eq!(tr.phase(), Phase::Error);
        match tr.send_packet(&payload(msg::IGNORE)) {
            Err(Error::SessionFailed(err)) => assert!(matches!(*err, Error::Mac)),
            res => panic!("unexpected result {:?}", res),
        }
    }
}
