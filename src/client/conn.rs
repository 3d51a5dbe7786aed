use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use crate::codec::Buffer;
use crate::codes::{msg, open};
use crate::error::{ChannelOpenError, Error, Result};
use super::channel::{
    AcceptChannel, ChannelConfig, ChannelEvent, ChannelKind, ChannelOpener, ChannelPhase, DataType,
};
use super::channel_state::{ChannelInit, ChannelState};
use super::client_state::Shared;
use super::pending::{PendingReply, PendingSlot};
use super::service::{waiter_error, Service};
use super::transport::{PacketSeq, Transport};

/// The "ssh-connection" service (RFC 4254): the table of channels and global requests.
pub(super) struct ConnService {
    channels: HashMap<u32, ChannelEntry>,
    next_id: u32,
    openers: HashMap<String, Box<dyn ChannelOpener>>,
    global_replies: VecDeque<PendingGlobal>,
    reject_tx: mpsc::UnboundedSender<(u32, ChannelOpenError)>,
    shared: Weak<Shared>,
    last_keepalive: Option<Instant>,
}

enum ChannelEntry {
    Opening(OpeningChannel),
    Accepting(AcceptingChannel),
    Ready(ChannelState),
}

struct OpeningChannel {
    config: ChannelConfig,
    slot: PendingSlot<OpenedChannel>,
}

struct AcceptingChannel {
    their_id: u32,
    send_window: u32,
    send_len_max: u32,
}

struct PendingGlobal {
    packet_seq: PacketSeq,
    slot: PendingSlot<Bytes>,
}

/// Channel that the server has confirmed.
pub(super) struct OpenedChannel {
    pub our_id: u32,
    pub event_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    pub confirm_payload: Bytes,
}

impl ConnService {
    pub fn new(reject_tx: mpsc::UnboundedSender<(u32, ChannelOpenError)>) -> ConnService {
        ConnService {
            channels: HashMap::new(),
            next_id: 0,
            openers: HashMap::new(),
            global_replies: VecDeque::new(),
            reject_tx,
            shared: Weak::new(),
            last_keepalive: None,
        }
    }

    pub fn set_shared(&mut self, shared: Weak<Shared>) {
        self.shared = shared;
    }

    pub fn register_opener(&mut self, channel_type: String, opener: Box<dyn ChannelOpener>) {
        self.openers.insert(channel_type, opener);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn alloc_our_id(&mut self) -> u32 {
        // ids grow monotonically, so that a late packet for a closed channel cannot hit a new one
        loop {
            let our_id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.channels.contains_key(&our_id) {
                return our_id
            }
        }
    }

    /// Sends `SSH_MSG_CHANNEL_OPEN`; the reply resolves when the server confirms or rejects.
    pub fn open_channel(
        &mut self,
        tr: &mut Transport,
        kind: &ChannelKind,
        config: &ChannelConfig,
    ) -> Result<PendingReply<OpenedChannel>> {
        let our_id = self.alloc_our_id();

        // RFC 4254, section 5.1
        let mut payload = Buffer::new();
        payload.put_u8(msg::CHANNEL_OPEN);
        payload.put_str(kind.channel_type());
        payload.put_u32(our_id);
        payload.put_u32(config.recv_window_max);
        payload.put_u32(config.recv_packet_len_max);
        kind.encode_payload(&mut payload);
        tr.send_packet(&payload.finish())?;
        log::debug!("sending SSH_MSG_CHANNEL_OPEN {:?} for our channel {}", kind.channel_type(), our_id);

        let (slot, reply) = PendingSlot::new();
        let opening = OpeningChannel { config: config.clone(), slot };
        self.channels.insert(our_id, ChannelEntry::Opening(opening));
        Ok(reply)
    }

    /// Confirms a channel opened by the server.
    pub fn accept_channel(
        &mut self,
        tr: &mut Transport,
        our_id: u32,
        config: &ChannelConfig,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>> {
        let Some(ChannelEntry::Accepting(accepting)) = self.channels.remove(&our_id) else {
            return Err(Error::ChannelClosed)
        };

        let mut payload = Buffer::new();
        payload.put_u8(msg::CHANNEL_OPEN_CONFIRMATION);
        payload.put_u32(accepting.their_id);
        payload.put_u32(our_id);
        payload.put_u32(config.recv_window_max);
        payload.put_u32(config.recv_packet_len_max);
        tr.send_packet(&payload.finish())?;
        log::debug!("sending SSH_MSG_CHANNEL_OPEN_CONFIRMATION for our channel {}", our_id);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let channel = ChannelState::new(ChannelInit {
            our_id,
            their_id: accepting.their_id,
            event_tx,
            send_window: accepting.send_window,
            send_len_max: accepting.send_len_max,
            config,
        });
        self.channels.insert(our_id, ChannelEntry::Ready(channel));
        Ok(event_rx)
    }

    /// Rejects a channel opened by the server, unless it was already accepted.
    pub fn reject_channel(&mut self, tr: &mut Transport, our_id: u32, error: ChannelOpenError) -> Result<()> {
        let accepting = match self.channels.remove(&our_id) {
            Some(ChannelEntry::Accepting(accepting)) => accepting,
            Some(entry) => {
                self.channels.insert(our_id, entry);
                return Ok(())
            },
            None => return Ok(()),
        };
        send_open_failure(tr, accepting.their_id, &error)?;
        log::debug!("sending SSH_MSG_CHANNEL_OPEN_FAILURE for our channel {}: {}", our_id, error);
        Ok(())
    }

    /// The channel with our id `our_id`, if it is open.
    pub fn ready_channel(&mut self, our_id: u32) -> Result<&mut ChannelState> {
        match self.channels.get_mut(&our_id) {
            Some(ChannelEntry::Ready(channel)) => Ok(channel),
            _ => Err(Error::ChannelClosed),
        }
    }

    pub fn channel_phase(&self, our_id: u32) -> ChannelPhase {
        match self.channels.get(&our_id) {
            Some(ChannelEntry::Opening(_) | ChannelEntry::Accepting(_)) => ChannelPhase::Opening,
            Some(ChannelEntry::Ready(channel)) => channel.phase(),
            None => ChannelPhase::Closed,
        }
    }

    /// The application has taken `len` bytes of data from the channel.
    pub fn consume(&mut self, tr: &mut Transport, our_id: u32, len: usize) -> Result<()> {
        if tr.is_closed() {
            return Ok(())
        }
        match self.channels.get_mut(&our_id) {
            Some(ChannelEntry::Ready(channel)) => channel.consume(tr, len),
            _ => Ok(()),
        }
    }

    /// Sends `SSH_MSG_GLOBAL_REQUEST` (RFC 4254, section 4).
    ///
    /// Replies are matched with requests in the order in which the requests were sent.
    pub fn send_global_request(
        &mut self,
        tr: &mut Transport,
        request_type: &str,
        payload: &[u8],
        want_reply: bool,
    ) -> Result<Option<PendingReply<Bytes>>> {
        let mut packet = Buffer::new();
        packet.put_u8(msg::GLOBAL_REQUEST);
        packet.put_str(request_type);
        packet.put_bool(want_reply);
        packet.put_raw(payload);
        let packet_seq = tr.send_packet(&packet.finish())?;
        log::debug!("sending SSH_MSG_GLOBAL_REQUEST {:?}", request_type);

        if want_reply {
            let (slot, reply) = PendingSlot::new();
            self.global_replies.push_back(PendingGlobal { packet_seq, slot });
            Ok(Some(reply))
        } else {
            Ok(None)
        }
    }

    /// Sends a keepalive request if the server has been silent for the keepalive interval.
    pub fn check_keepalive(&mut self, tr: &mut Transport) -> Result<()> {
        let Some(interval) = tr.config.keepalive_interval else {
            return Ok(())
        };

        let now = Instant::now();
        if now.duration_since(tr.last_recv()) < interval {
            return Ok(())
        }
        if let Some(last_keepalive) = self.last_keepalive {
            if now.duration_since(last_keepalive) < interval {
                return Ok(())
            }
        }

        self.last_keepalive = Some(now);
        // any reply from the server will do, so nobody waits for it
        let _ = self.send_global_request(tr, "keepalive@openssh.com", &[], true)?;
        Ok(())
    }

    fn recv_channel_open(&mut self, tr: &mut Transport, payload: &mut Buffer) -> Result<()> {
        let channel_type = payload.get_string()?;
        let their_id = payload.get_u32()?;
        let send_window = payload.get_u32()?;
        let send_len_max = payload.get_u32()?;
        log::debug!("received SSH_MSG_CHANNEL_OPEN {:?} for their channel {}", channel_type, their_id);

        if !self.openers.contains_key(&channel_type) {
            let error = ChannelOpenError::new(open::UNKNOWN_CHANNEL_TYPE, "unknown channel type");
            log::debug!("rejecting channel {:?}: no opener is registered", channel_type);
            return send_open_failure(tr, their_id, &error)
        }

        let kind = ChannelKind::decode(channel_type, payload)?;
        let our_id = self.alloc_our_id();
        let accepting = AcceptingChannel { their_id, send_window, send_len_max };
        self.channels.insert(our_id, ChannelEntry::Accepting(accepting));

        let accept = AcceptChannel {
            shared: self.shared.clone(),
            reject_tx: self.reject_tx.clone(),
            our_id,
            kind,
            answered: false,
        };
        if let Some(opener) = self.openers.get_mut(accept.kind().channel_type()) {
            opener.open(accept);
        }
        Ok(())
    }

    fn recv_channel_open_confirmation(&mut self, tr: &mut Transport, payload: &mut Buffer) -> Result<()> {
        let our_id = payload.get_u32()?;
        let their_id = payload.get_u32()?;
        let send_window = payload.get_u32()?;
        let send_len_max = payload.get_u32()?;
        let confirm_payload = payload.take_unread();
        log::debug!("received SSH_MSG_CHANNEL_OPEN_CONFIRMATION for our channel {}, \
            window {}, max packet size {}", our_id, send_window, send_len_max);

        let Some(ChannelEntry::Opening(opening)) = self.channels.remove(&our_id) else {
            return Err(Error::Protocol("received SSH_MSG_CHANNEL_OPEN_CONFIRMATION \
                for a channel that is not being opened"))
        };
        let OpeningChannel { config, mut slot } = opening;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut channel = ChannelState::new(ChannelInit {
            our_id, their_id, event_tx, send_window, send_len_max, config: &config,
        });

        if slot.is_abandoned() {
            log::debug!("nobody waits for our channel {} anymore, closing it", our_id);
            channel.close(tr)?;
        } else {
            slot.resolve(Ok(OpenedChannel { our_id, event_rx, confirm_payload }));
        }
        self.channels.insert(our_id, ChannelEntry::Ready(channel));
        Ok(())
    }

    fn recv_channel_open_failure(&mut self, payload: &mut Buffer) -> Result<()> {
        let our_id = payload.get_u32()?;
        let error = ChannelOpenError {
            reason_code: payload.get_u32()?,
            description: payload.get_string()?,
            description_lang: payload.get_string()?,
        };
        log::debug!("received SSH_MSG_CHANNEL_OPEN_FAILURE for our channel {}: {}", our_id, error);

        let Some(ChannelEntry::Opening(mut opening)) = self.channels.remove(&our_id) else {
            return Err(Error::Protocol("received SSH_MSG_CHANNEL_OPEN_FAILURE \
                for a channel that is not being opened"))
        };
        opening.slot.resolve(Err(Error::ChannelOpen(error)));
        Ok(())
    }

    fn recv_channel_packet(&mut self, tr: &mut Transport, msg_id: u8, payload: &mut Buffer) -> Result<()> {
        let our_id = payload.get_u32()?;
        let Some(ChannelEntry::Ready(channel)) = self.channels.get_mut(&our_id) else {
            log::debug!("received {} for unknown channel {}", msg::to_str(msg_id), our_id);
            return Err(Error::Protocol("received channel packet for a channel that is not open"))
        };

        match msg_id {
            msg::CHANNEL_DATA => {
                let data = payload.get_bytes()?;
                channel.recv_data(tr, data, DataType::Standard)?;
            },
            msg::CHANNEL_EXTENDED_DATA => {
                let code = payload.get_u32()?;
                let data = payload.get_bytes()?;
                channel.recv_data(tr, data, DataType::Extended(code))?;
            },
            msg::CHANNEL_WINDOW_ADJUST => channel.recv_window_adjust(tr, payload.get_u32()?)?,
            msg::CHANNEL_EOF => channel.recv_eof()?,
            msg::CHANNEL_CLOSE => {
                channel.recv_close(tr)?;
                self.channels.remove(&our_id);
                log::debug!("our channel {} is closed", our_id);
            },
            msg::CHANNEL_REQUEST => channel.recv_request(tr, payload)?,
            msg::CHANNEL_SUCCESS => channel.recv_reply(true)?,
            msg::CHANNEL_FAILURE => channel.recv_reply(false)?,
            _ => return Err(Error::PacketNotImplemented(msg_id)),
        }
        Ok(())
    }

    fn recv_global_request(&mut self, tr: &mut Transport, payload: &mut Buffer) -> Result<()> {
        let request_type = payload.get_string()?;
        let want_reply = payload.get_bool()?;
        log::debug!("received SSH_MSG_GLOBAL_REQUEST {:?}", request_type);
        if want_reply {
            tr.send_packet(&[msg::REQUEST_FAILURE])?;
        }
        Ok(())
    }

    fn recv_global_reply(&mut self, success: bool, payload: &mut Buffer) -> Result<()> {
        let Some(mut pending) = self.global_replies.pop_front() else {
            return Err(Error::Protocol("received global request reply, but no reply was expected"))
        };
        if success {
            log::debug!("received SSH_MSG_REQUEST_SUCCESS");
            pending.slot.resolve(Ok(payload.take_unread()));
        } else {
            log::debug!("received SSH_MSG_REQUEST_FAILURE");
            pending.slot.resolve(Err(Error::GlobalReq));
        }
        Ok(())
    }
}

fn send_open_failure(tr: &mut Transport, their_id: u32, error: &ChannelOpenError) -> Result<()> {
    let mut payload = Buffer::new();
    payload.put_u8(msg::CHANNEL_OPEN_FAILURE);
    payload.put_u32(their_id);
    payload.put_u32(error.reason_code);
    payload.put_str(&error.description);
    payload.put_str(&error.description_lang);
    tr.send_packet(&payload.finish())?;
    Ok(())
}

impl Service for ConnService {
    fn name(&self) -> &'static str {
        "ssh-connection"
    }

    fn handle(&mut self, tr: &mut Transport, msg_id: u8, payload: &mut Buffer) -> Result<()> {
        match msg_id {
            msg::GLOBAL_REQUEST => self.recv_global_request(tr, payload),
            msg::REQUEST_SUCCESS => self.recv_global_reply(true, payload),
            msg::REQUEST_FAILURE => self.recv_global_reply(false, payload),
            msg::CHANNEL_OPEN => self.recv_channel_open(tr, payload),
            msg::CHANNEL_OPEN_CONFIRMATION => self.recv_channel_open_confirmation(tr, payload),
            msg::CHANNEL_OPEN_FAILURE => self.recv_channel_open_failure(payload),
            msg::CHANNEL_WINDOW_ADJUST ..= msg::CHANNEL_FAILURE =>
                self.recv_channel_packet(tr, msg_id, payload),
            _ => Err(Error::PacketNotImplemented(msg_id)),
        }
    }

    fn notify_error(&mut self, err: &Arc<Error>) {
        for (_, entry) in self.channels.drain() {
            match entry {
                ChannelEntry::Opening(mut opening) => { opening.slot.resolve(Err(waiter_error(err))); },
                ChannelEntry::Ready(mut channel) => channel.notify_error(err),
                ChannelEntry::Accepting(_) => {},
            }
        }
        for mut pending in self.global_replies.drain(..) {
            pending.slot.resolve(Err(waiter_error(err)));
        }
        self.openers.clear();
    }

    fn notify_unimplemented(&mut self, tr: &mut Transport, packet_seq: u32) -> Result<()> {
        let idx = self.global_replies.iter()
            .position(|pending| tr.packet_seq(pending.packet_seq) == Some(packet_seq));
        if let Some(mut pending) = idx.and_then(|idx| self.global_replies.remove(idx)) {
            log::debug!("server does not implement our global request, seq {}", packet_seq);
            pending.slot.resolve(Err(Error::GlobalReq));
        }
        Ok(())
    }
}
