use bytes::Bytes;
use crate::codec::{Buffer, RecvPacket};
use crate::codes::msg;
use crate::error::{DisconnectError, Error, Result};
use super::client_event::{ClientEvent, DebugMsg};
use super::client_state::{self, ClientState, ServiceKind};
use super::negotiate;

/// Processes all complete input in the receive pipe.
///
/// Runs in the reader task with the state locked, so it must never wait: packets that cannot be
/// sent right now are queued by the transport.
pub(super) fn recv_input(st: &mut ClientState) -> Result<()> {
    if st.tr.their_ident.is_none() {
        let Some(ident) = st.tr.codec.recv_pipe.consume_ident()? else {
            return Ok(())
        };
        log::debug!("received peer identification: {:?}", ident);
        st.tr.their_ident = Some(ident);
        negotiate::start_kex(st)?;
    }

    while let Some(packet) = st.tr.codec.recv_pipe.consume_packet()? {
        recv_packet(st, packet)?;
        if st.tr.is_closed() {
            break
        }
    }

    negotiate::check_rekey(st)
}

fn recv_packet(st: &mut ClientState, packet: RecvPacket) -> Result<()> {
    let mut payload = Buffer::from_slice(&packet.payload);
    match recv_packet_dispatch(st, &mut payload, &packet.payload) {
        Ok(()) => Ok(()),
        Err(Error::PacketNotImplemented(msg_id)) => not_implemented(st, msg_id, &packet),
        Err(err) => Err(err),
    }
}

fn recv_packet_dispatch(st: &mut ClientState, payload: &mut Buffer, raw: &Bytes) -> Result<()> {
    let msg_id = payload.get_u8()?;
    log::trace!("received {}", msg::to_str(msg_id));
    match msg_id {
        msg::DISCONNECT => recv_disconnect(payload),
        msg::IGNORE => Ok(()),
        msg::UNIMPLEMENTED => recv_unimplemented(st, payload),
        msg::DEBUG => recv_debug(st, payload),
        msg::SERVICE_ACCEPT => client_state::recv_service_accept(st, payload),
        20..=29 => negotiate::recv_negotiate_packet(st, msg_id, payload, raw),
        30..=49 => negotiate::recv_kex_packet(st, msg_id, payload),
        50..=255 => recv_service_packet(st, msg_id, payload),
        _ => Err(Error::PacketNotImplemented(msg_id)),
    }
}

fn recv_service_packet(st: &mut ClientState, msg_id: u8, payload: &mut Buffer) -> Result<()> {
    if st.negotiate.is_peer_in_kex() {
        return Err(Error::Protocol("received service packet during key exchange"))
    }

    let is_auth = st.active == Some(ServiceKind::Auth);
    let Some((service, tr)) = st.active_service() else {
        return Err(Error::Protocol("received service packet, but no service is running"))
    };
    service.handle(tr, msg_id, payload)?;

    if is_auth && st.tr.is_authenticated() {
        client_state::activate_conn(st);
    }
    Ok(())
}

fn recv_disconnect(payload: &mut Buffer) -> Result<()> {
    let disconnect = DisconnectError {
        reason_code: payload.get_u32()?,
        description: payload.get_string()?,
        description_lang: payload.get_string()?,
    };
    log::debug!("received SSH_MSG_DISCONNECT: {}", disconnect);
    Err(Error::PeerDisconnected(disconnect))
}

fn recv_debug(st: &mut ClientState, payload: &mut Buffer) -> Result<()> {
    let debug_msg = DebugMsg {
        always_display: payload.get_bool()?,
        message: payload.get_string()?,
        message_lang: payload.get_string()?,
    };
    if debug_msg.always_display {
        log::info!("debug message from server: {:?}", debug_msg.message);
    } else {
        log::debug!("received SSH_MSG_DEBUG: {:?}", debug_msg.message);
    }
    st.tr.send_event(ClientEvent::DebugMsg(debug_msg));
    Ok(())
}

fn recv_unimplemented(st: &mut ClientState, payload: &mut Buffer) -> Result<()> {
    let packet_seq = payload.get_u32()?;
    log::debug!("received SSH_MSG_UNIMPLEMENTED for packet seq {}", packet_seq);

    if st.negotiate.is_kex_packet_seq(packet_seq) {
        return Err(Error::Kex("server does not implement our key exchange packet"))
    }
    match st.active_service() {
        Some((service, tr)) => service.notify_unimplemented(tr, packet_seq),
        None => Ok(()),
    }
}

fn not_implemented(st: &mut ClientState, msg_id: u8, packet: &RecvPacket) -> Result<()> {
    log::debug!("received unimplemented packet {}, seq {}", msg_id, packet.packet_seq);
    let mut reply = Buffer::new();
    reply.put_u8(msg::UNIMPLEMENTED);
    reply.put_u32(packet.packet_seq);
    st.tr.send_packet(&reply.finish())?;
    Ok(())
}
