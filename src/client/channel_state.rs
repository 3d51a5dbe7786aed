use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use crate::codec::Buffer;
use crate::codes::msg;
use crate::error::{Error, Result};
use super::channel::{ChannelConfig, ChannelEvent, ChannelPhase, DataType, ExitSignal};
use super::pending::{PendingReply, PendingSlot};
use super::service::waiter_error;
use super::transport::Transport;

pub(super) struct ChannelInit<'a> {
    pub our_id: u32,
    pub their_id: u32,
    pub event_tx: mpsc::UnboundedSender<ChannelEvent>,
    pub send_window: u32,
    pub send_len_max: u32,
    pub config: &'a ChannelConfig,
}

/// State of an open channel (RFC 4254, section 5).
pub(super) struct ChannelState {
    our_id: u32,
    their_id: u32,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
    eof_sent: bool,
    eof_recvd: bool,
    close_sent: bool,
    close_recvd: bool,
    send_window: u32,
    send_len_max: u32,
    recv_window: u32,
    recv_consumed: u32,
    adjust_threshold: u32,
    replies: VecDeque<PendingSlot<()>>,
}

impl ChannelState {
    pub fn new(init: ChannelInit) -> ChannelState {
        let config = init.config;
        ChannelState {
            our_id: init.our_id,
            their_id: init.their_id,
            event_tx: init.event_tx,
            eof_sent: false,
            eof_recvd: false,
            close_sent: false,
            close_recvd: false,
            send_window: init.send_window,
            send_len_max: init.send_len_max,
            recv_window: config.recv_window_max,
            recv_consumed: 0,
            adjust_threshold: config.adjust_threshold()
                .clamp(1, config.recv_window_max.max(1)),
            replies: VecDeque::new(),
        }
    }

    pub fn our_id(&self) -> u32 {
        self.our_id
    }

    pub fn phase(&self) -> ChannelPhase {
        match (self.close_sent, self.close_recvd) {
            (true, true) => ChannelPhase::Closed,
            (true, false) | (false, true) => ChannelPhase::Closing,
            (false, false) => match (self.eof_sent, self.eof_recvd) {
                (false, false) => ChannelPhase::Open,
                (true, false) => ChannelPhase::EofSent,
                (false, true) => ChannelPhase::EofReceived,
                (true, true) => ChannelPhase::HalfClosed,
            },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close_sent && self.close_recvd
    }

    pub fn send_window(&self) -> u32 {
        self.send_window
    }

    /// Sends as much of `data` as the window allows, in one packet.
    ///
    /// Returns the number of bytes that were sent and removed from `data`; zero means that the
    /// caller must wait for a window adjustment.
    pub fn send_data(&mut self, tr: &mut Transport, data: &mut Bytes, data_type: DataType) -> Result<usize> {
        if self.close_sent {
            return Err(Error::ChannelClosed)
        } else if self.eof_sent {
            return Err(Error::ChannelEofSent)
        }

        let len = data.len()
            .min(self.send_window as usize)
            .min(self.send_len_max as usize);
        if len == 0 {
            return Ok(0)
        }
        let chunk = data.split_to(len);

        // RFC 4254, section 5.2
        let mut payload = Buffer::new();
        match data_type {
            DataType::Standard => {
                payload.put_u8(msg::CHANNEL_DATA);
                payload.put_u32(self.their_id);
            },
            DataType::Extended(code) => {
                payload.put_u8(msg::CHANNEL_EXTENDED_DATA);
                payload.put_u32(self.their_id);
                payload.put_u32(code);
            },
        }
        payload.put_bytes(&chunk);
        tr.send_packet(&payload.finish())?;

        self.send_window -= len as u32;
        log::trace!("sending {} bytes of {:?} for our channel {}, send window {}",
            len, data_type, self.our_id, self.send_window);
        Ok(len)
    }

    pub fn send_eof(&mut self, tr: &mut Transport) -> Result<()> {
        if self.close_sent {
            return Err(Error::ChannelClosed)
        } else if self.eof_sent {
            return Ok(())
        }

        let mut payload = Buffer::new();
        payload.put_u8(msg::CHANNEL_EOF);
        payload.put_u32(self.their_id);
        tr.send_packet(&payload.finish())?;
        self.eof_sent = true;
        log::debug!("sending SSH_MSG_CHANNEL_EOF for our channel {}", self.our_id);
        Ok(())
    }

    /// Sends `SSH_MSG_CHANNEL_CLOSE`, unless we have already sent it.
    pub fn close(&mut self, tr: &mut Transport) -> Result<()> {
        if self.close_sent {
            return Ok(())
        }

        let mut payload = Buffer::new();
        payload.put_u8(msg::CHANNEL_CLOSE);
        payload.put_u32(self.their_id);
        tr.send_packet(&payload.finish())?;
        self.close_sent = true;
        log::debug!("sending SSH_MSG_CHANNEL_CLOSE for our channel {}", self.our_id);
        Ok(())
    }

    /// Sends `SSH_MSG_CHANNEL_REQUEST`, returns the pending reply if `want_reply` is set.
    ///
    /// Replies are matched to requests in the order in which the requests were sent.
    pub fn send_request(
        &mut self,
        tr: &mut Transport,
        request_type: &str,
        payload: &[u8],
        want_reply: bool,
    ) -> Result<Option<PendingReply<()>>> {
        if self.close_sent {
            return Err(Error::ChannelClosed)
        }

        // RFC 4254, section 5.4
        let mut packet = Buffer::new();
        packet.put_u8(msg::CHANNEL_REQUEST);
        packet.put_u32(self.their_id);
        packet.put_str(request_type);
        packet.put_bool(want_reply);
        packet.put_raw(payload);
        tr.send_packet(&packet.finish())?;
        log::debug!("sending SSH_MSG_CHANNEL_REQUEST {:?} for our channel {}", request_type, self.our_id);

        if want_reply {
            let (slot, reply) = PendingSlot::new();
            self.replies.push_back(slot);
            Ok(Some(reply))
        } else {
            Ok(None)
        }
    }

    /// The application has taken `len` bytes of received data.
    ///
    /// Sends `SSH_MSG_CHANNEL_WINDOW_ADJUST` once the consumed bytes reach the threshold.
    pub fn consume(&mut self, tr: &mut Transport, len: usize) -> Result<()> {
        self.recv_consumed = self.recv_consumed.saturating_add(len as u32);
        if self.recv_consumed < self.adjust_threshold || self.close_sent || self.close_recvd {
            return Ok(())
        }

        let adjust = self.recv_consumed;
        let mut payload = Buffer::new();
        payload.put_u8(msg::CHANNEL_WINDOW_ADJUST);
        payload.put_u32(self.their_id);
        payload.put_u32(adjust);
        tr.send_packet(&payload.finish())?;

        self.recv_window = self.recv_window.saturating_add(adjust);
        self.recv_consumed = 0;
        log::trace!("sending SSH_MSG_CHANNEL_WINDOW_ADJUST {} for our channel {}, recv window {}",
            adjust, self.our_id, self.recv_window);
        Ok(())
    }

    pub fn recv_data(&mut self, tr: &mut Transport, data: Bytes, data_type: DataType) -> Result<()> {
        if self.close_sent {
            log::trace!("ignoring {} bytes of data for closing channel {}", data.len(), self.our_id);
            return Ok(())
        } else if self.eof_recvd {
            return Err(Error::Protocol("received channel data after SSH_MSG_CHANNEL_EOF"))
        }
        // our own EOF only ends our direction, the peer may keep sending (e.g. output of `exec`)

        let len = data.len();
        if len > self.recv_window as usize {
            return Err(Error::Protocol("received more channel data than the window allows"))
        }
        self.recv_window -= len as u32;
        log::trace!("received {} bytes of {:?} for our channel {}, recv window {}",
            len, data_type, self.our_id, self.recv_window);

        if self.event_tx.send(ChannelEvent::Data(data, data_type)).is_err() {
            // nobody will take the data, so it is consumed right away
            self.consume(tr, len)?;
        }
        Ok(())
    }

    pub fn recv_window_adjust(&mut self, tr: &mut Transport, adjust: u32) -> Result<()> {
        self.send_window = self.send_window.checked_add(adjust)
            .ok_or(Error::Protocol("received SSH_MSG_CHANNEL_WINDOW_ADJUST that overflows the window"))?;
        log::trace!("received SSH_MSG_CHANNEL_WINDOW_ADJUST {} for our channel {}, send window {}",
            adjust, self.our_id, self.send_window);
        tr.wake();
        Ok(())
    }

    pub fn recv_eof(&mut self) -> Result<()> {
        if self.eof_recvd {
            log::warn!("received SSH_MSG_CHANNEL_EOF twice for our channel {}", self.our_id);
            return Ok(())
        }
        log::debug!("received SSH_MSG_CHANNEL_EOF for our channel {}", self.our_id);
        self.eof_recvd = true;
        let _ = self.event_tx.send(ChannelEvent::Eof);
        Ok(())
    }

    /// Handles `SSH_MSG_CHANNEL_CLOSE`: replies with our own close and fails all pending requests.
    ///
    /// The channel is closed afterwards and should be removed.
    pub fn recv_close(&mut self, tr: &mut Transport) -> Result<()> {
        if self.close_recvd {
            return Err(Error::Protocol("received SSH_MSG_CHANNEL_CLOSE twice"))
        }
        log::debug!("received SSH_MSG_CHANNEL_CLOSE for our channel {}", self.our_id);
        self.close_recvd = true;
        self.close(tr)?;
        for mut reply in self.replies.drain(..) {
            reply.resolve(Err(Error::ChannelClosed));
        }
        tr.wake();
        Ok(())
    }

    pub fn recv_request(&mut self, tr: &mut Transport, payload: &mut Buffer) -> Result<()> {
        let request_type = payload.get_string()?;
        let want_reply = payload.get_bool()?;
        log::debug!("received SSH_MSG_CHANNEL_REQUEST {:?} for our channel {}", request_type, self.our_id);

        let event = match request_type.as_str() {
            // RFC 4254, section 6.10
            "exit-status" => Some(ChannelEvent::ExitStatus(payload.get_u32()?)),
            "exit-signal" => Some(ChannelEvent::ExitSignal(ExitSignal {
                signal_name: payload.get_string()?,
                core_dumped: payload.get_bool()?,
                message: payload.get_string()?,
                message_lang: payload.get_string()?,
            })),
            _ => None,
        };

        let success = event.is_some();
        if let Some(event) = event {
            let _ = self.event_tx.send(event);
        } else {
            log::debug!("ignoring unknown channel request {:?}", request_type);
        }

        if want_reply && !self.close_sent {
            let mut reply = Buffer::new();
            reply.put_u8(if success { msg::CHANNEL_SUCCESS } else { msg::CHANNEL_FAILURE });
            reply.put_u32(self.their_id);
            tr.send_packet(&reply.finish())?;
        }
        Ok(())
    }

    pub fn recv_reply(&mut self, success: bool) -> Result<()> {
        let Some(mut reply) = self.replies.pop_front() else {
            return Err(Error::Protocol("received channel request reply, but no reply was expected"))
        };
        log::debug!("received {} for our channel {}",
            if success { "SSH_MSG_CHANNEL_SUCCESS" } else { "SSH_MSG_CHANNEL_FAILURE" }, self.our_id);
        reply.resolve(if success { Ok(()) } else { Err(Error::ChannelReq) });
        Ok(())
    }

    pub fn notify_error(&mut self, err: &Arc<Error>) {
        for mut reply in self.replies.drain(..) {
            reply.resolve(Err(waiter_error(err)));
        }
    }
}
