use parking_lot::Mutex;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use crate::codec::Buffer;
use crate::codes::msg;
use crate::error::{ChannelOpenError, DisconnectError, Error, Result};
use crate::util::{with_timeout, CryptoRngCore};
use super::auth::AuthService;
use super::client::{ClientConfig, HostKeyVerifier};
use super::client_event::ClientEvent;
use super::conn::ConnService;
use super::negotiate::{self, NegotiateState};
use super::pending::{PendingReply, PendingSlot};
use super::recv;
use super::service::{waiter_error, Service};
use super::transport::{Phase, Transport};

const READ_BUF_LEN: usize = 16 * 1024;
const TICK_PERIOD: Duration = Duration::from_secs(1);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// State shared between the client handles and the tasks that drive the session.
///
/// All state lives behind a single mutex, which is never held across an `.await`. Tasks that wait
/// for a change of the state (the writer task and user operations that wait for the key exchange
/// or for window space) wait on `notify`.
pub(super) struct Shared {
    pub st: Mutex<ClientState>,
    pub notify: Arc<Notify>,
}

pub(super) struct ClientState {
    pub tr: Transport,
    pub negotiate: NegotiateState,
    pub auth: AuthService,
    pub conn: ConnService,
    pub active: Option<ServiceKind>,
    service_req: Option<ServiceRequest>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) enum ServiceKind {
    Auth,
    Conn,
}

struct ServiceRequest {
    name: &'static str,
    waiters: Vec<PendingSlot<()>>,
}

pub(super) const SERVICE_AUTH: &str = "ssh-userauth";
pub(super) const SERVICE_CONN: &str = "ssh-connection";

impl ClientState {
    pub fn active_service(&mut self) -> Option<(&mut dyn Service, &mut Transport)> {
        match self.active {
            Some(ServiceKind::Auth) => Some((&mut self.auth, &mut self.tr)),
            Some(ServiceKind::Conn) => Some((&mut self.conn, &mut self.tr)),
            None => None,
        }
    }

    #[cfg(test)]
    pub fn new_for_test(config: ClientConfig) -> ClientState {
        let (reject_tx, _reject_rx) = mpsc::unbounded_channel();
        ClientState {
            tr: Transport::new_for_test(config),
            negotiate: NegotiateState::default(),
            auth: AuthService::default(),
            conn: ConnService::new(reject_tx),
            active: None,
            service_req: None,
        }
    }
}

pub(super) fn new_client(
    config: ClientConfig,
    rng: Box<dyn CryptoRngCore + Send>,
    verifier: Box<dyn HostKeyVerifier>,
    remote_addr: Option<SocketAddr>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    notify: Arc<Notify>,
    reject_tx: mpsc::UnboundedSender<(u32, ChannelOpenError)>,
) -> Result<ClientState> {
    let mut tr = Transport::new(config, rng, verifier, remote_addr, event_tx, notify)?;
    let our_ident = tr.our_ident.clone();
    tr.codec.send_pipe.feed_ident(&our_ident);
    log::debug!("sending our identification: {:?}", our_ident);

    Ok(ClientState {
        tr,
        negotiate: NegotiateState::default(),
        auth: AuthService::default(),
        conn: ConnService::new(reject_tx),
        active: None,
        service_req: None,
    })
}

/// Drives the session over `stream` until it is closed or fails.
pub(super) async fn run_client<IO>(
    shared: Arc<Shared>,
    stream: IO,
    reject_rx: mpsc::UnboundedReceiver<(u32, ChannelOpenError)>,
) -> Result<()>
    where IO: AsyncRead + AsyncWrite + Send + 'static
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let res = tokio::select! {
        res = read_loop(&shared, &mut reader) => res,
        res = write_loop(&shared, &mut writer) => res,
        res = timer_loop(&shared) => res,
        res = reject_loop(&shared, reject_rx) => res,
    };

    let error = {
        let mut st = shared.st.lock();
        match res {
            Ok(()) => if st.tr.error().is_none() {
                st.tr.set_phase(Phase::Closed);
                notify_error(&mut st, &Arc::new(Error::SessionClosed));
            },
            Err(Error::SessionFailed(err)) => fail(&mut st, err),
            Err(err) => fail(&mut st, Arc::new(err)),
        }
        st.tr.error().cloned()
    };

    // the disconnect message is sent on a best-effort basis
    let remaining = shared.st.lock().tr.codec.send_pipe.take_bytes();
    let _ = tokio::time::timeout(FLUSH_TIMEOUT, async {
        if !remaining.is_empty() {
            writer.write_all(&remaining).await?;
        }
        writer.shutdown().await
    }).await;
    log::debug!("session finished");

    match error {
        Some(err) => Err(Error::SessionFailed(err)),
        None => Ok(()),
    }
}

async fn read_loop<R: AsyncRead + Unpin>(shared: &Shared, reader: &mut R) -> Result<()> {
    let mut buf = vec![0; READ_BUF_LEN];
    loop {
        let read_len = reader.read(&mut buf).await.map_err(Error::ReadIo)?;

        let bytes_needed = {
            let mut st = shared.st.lock();
            if let Some(err) = st.tr.error() {
                return Err(Error::SessionFailed(err.clone()))
            } else if read_len == 0 {
                return match st.tr.phase() {
                    Phase::Closed => Ok(()),
                    _ => Err(Error::PeerClosed),
                }
            } else if st.tr.is_closed() {
                log::trace!("ignoring {} bytes received after disconnect", read_len);
                continue
            }

            log::trace!("received {} bytes", read_len);
            st.tr.codec.recv_pipe.feed(&buf[..read_len]);
            st.tr.touch_recv();
            recv::recv_input(&mut st)?;
            st.tr.codec.recv_pipe.bytes_needed()
        };

        if bytes_needed > buf.len() {
            buf.resize(bytes_needed, 0);
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(shared: &Shared, writer: &mut W) -> Result<()> {
    loop {
        let mut notified = pin!(shared.notify.notified());
        notified.as_mut().enable();

        let (bytes, closed) = {
            let mut st = shared.st.lock();
            if let Some(err) = st.tr.error() {
                return Err(Error::SessionFailed(err.clone()))
            }
            (st.tr.codec.send_pipe.take_bytes(), st.tr.phase() == Phase::Closed)
        };

        if !bytes.is_empty() {
            log::trace!("writing {} bytes", bytes.len());
            writer.write_all(&bytes).await.map_err(Error::WriteIo)?;
            writer.flush().await.map_err(Error::WriteIo)?;
            // writers blocked on the send backlog may continue
            shared.notify.notify_waiters();
            continue
        } else if closed {
            return Ok(())
        }

        notified.await;
    }
}

async fn timer_loop(shared: &Shared) -> Result<()> {
    let mut interval = tokio::time::interval(TICK_PERIOD);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let mut st = shared.st.lock();
        if st.tr.is_closed() {
            continue
        }

        negotiate::check_rekey(&mut st)?;
        if st.active == Some(ServiceKind::Conn) {
            let st = &mut *st;
            st.conn.check_keepalive(&mut st.tr)?;
        }
    }
}

async fn reject_loop(
    shared: &Shared,
    mut reject_rx: mpsc::UnboundedReceiver<(u32, ChannelOpenError)>,
) -> Result<()> {
    while let Some((our_id, error)) = reject_rx.recv().await {
        let mut st = shared.st.lock();
        if st.tr.is_closed() {
            continue
        }
        let st = &mut *st;
        st.conn.reject_channel(&mut st.tr, our_id, error)?;
    }
    std::future::pending().await
}

/// Waits until `f` returns `Some`, calling it whenever the session state changes.
///
/// `f` is called with the state locked; it must not block and should not fail unless the
/// operation is over.
pub(super) async fn wait_until<T, F>(shared: &Shared, timeout: Option<Duration>, mut f: F) -> Result<T>
    where F: FnMut(&mut ClientState) -> Result<Option<T>>
{
    with_timeout(timeout, async {
        loop {
            let mut notified = pin!(shared.notify.notified());
            notified.as_mut().enable();
            {
                let mut st = shared.st.lock();
                st.tr.check_alive()?;
                match f(&mut st) {
                    Ok(Some(value)) => return Ok(value),
                    Ok(None) => {},
                    Err(err) => return Err(fail_if_fatal(&mut st, err)),
                }
            }
            notified.await;
        }
    }).await
}

/// Calls `f` with the locked state of a live session.
pub(super) fn with_state<T, F>(shared: &Shared, f: F) -> Result<T>
    where F: FnOnce(&mut ClientState) -> Result<T>
{
    let mut st = shared.st.lock();
    st.tr.check_alive()?;
    f(&mut st).map_err(|err| fail_if_fatal(&mut st, err))
}

/// Kills the session if `err` is fatal and returns the error for the caller.
pub(super) fn fail_if_fatal(st: &mut ClientState, err: Error) -> Error {
    match err {
        Error::SessionFailed(_) | Error::SessionClosed => err,
        err if err.is_session_fatal() => {
            let err = Arc::new(err);
            fail(st, err.clone());
            Error::SessionFailed(err)
        },
        err => err,
    }
}

/// Marks the session as failed and resolves all pending operations with the error.
pub(super) fn fail(st: &mut ClientState, err: Arc<Error>) {
    if st.tr.error().is_some() {
        return
    }

    log::debug!("session failed: {}", err);
    if st.tr.phase() != Phase::Closed {
        if let Some(reason_code) = err.disconnect_reason() {
            st.tr.send_disconnect(reason_code, &err.to_string());
        }
    }
    st.tr.set_error(err.clone());
    notify_error(st, &err);
}

/// Performs an orderly shutdown initiated by us.
pub(super) fn disconnect(st: &mut ClientState, error: DisconnectError) -> Result<()> {
    st.tr.check_alive()?;
    st.tr.send_disconnect(error.reason_code, &error.description);
    st.tr.set_phase(Phase::Closed);
    notify_error(st, &Arc::new(Error::SessionClosed));
    Ok(())
}

fn notify_error(st: &mut ClientState, err: &Arc<Error>) {
    st.negotiate.notify_error(err);
    st.auth.notify_error(err);
    st.conn.notify_error(err);
    if let Some(req) = st.service_req.take() {
        for mut waiter in req.waiters {
            waiter.resolve(Err(waiter_error(err)));
        }
    }
    st.tr.wake();
}

/// Requests service `name` from the server (RFC 4253, section 10).
///
/// Returns `None` if the service is already running.
pub(super) fn request_service(st: &mut ClientState, name: &'static str) -> Result<Option<PendingReply<()>>> {
    if name != SERVICE_AUTH {
        return Err(Error::ServiceNotSupported(name.into()))
    }
    if st.active.is_some() {
        // the connection service replaces the authentication service after success
        return Ok(None)
    }

    let (slot, reply) = PendingSlot::new();
    match st.service_req.as_mut() {
        Some(req) => req.waiters.push(slot),
        None => {
            let mut payload = Buffer::new();
            payload.put_u8(msg::SERVICE_REQUEST);
            payload.put_str(name);
            st.tr.send_packet(&payload.finish())?;
            log::debug!("sending SSH_MSG_SERVICE_REQUEST for {:?}", name);
            st.tr.set_phase(Phase::ServiceRequested);
            st.service_req = Some(ServiceRequest { name, waiters: vec![slot] });
        },
    }
    Ok(Some(reply))
}

pub(super) fn recv_service_accept(st: &mut ClientState, payload: &mut Buffer) -> Result<()> {
    let service_name = payload.get_string()?;
    let Some(req) = st.service_req.take() else {
        return Err(Error::Protocol("received unexpected SSH_MSG_SERVICE_ACCEPT"))
    };
    if service_name != req.name {
        return Err(Error::Protocol("received SSH_MSG_SERVICE_ACCEPT for a service that we did not request"))
    }

    log::debug!("received SSH_MSG_SERVICE_ACCEPT for {:?}", service_name);
    st.active = Some(ServiceKind::Auth);
    st.tr.set_phase(Phase::ServiceActive);
    for mut waiter in req.waiters {
        waiter.resolve(Ok(()));
    }
    Ok(())
}

/// The user is authenticated, the connection protocol takes over.
pub(super) fn activate_conn(st: &mut ClientState) {
    if st.active != Some(ServiceKind::Conn) {
        log::debug!("user is authenticated, starting the {:?} service", SERVICE_CONN);
        st.active = Some(ServiceKind::Conn);
        st.tr.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_service_once() {
        let mut st = ClientState::new_for_test(ClientConfig::default());
        let first = request_service(&mut st, SERVICE_AUTH).unwrap();
        let second = request_service(&mut st, SERVICE_AUTH).unwrap();
        assert!(first.is_some() && second.is_some());
        let sent = st.tr.take_sent_payloads();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], msg::SERVICE_REQUEST);
        assert_eq!(st.tr.phase(), Phase::ServiceRequested);

        let mut accept = Buffer::new();
        accept.put_str(SERVICE_AUTH);
        recv_service_accept(&mut st, &mut accept).unwrap();
        assert_eq!(st.active, Some(ServiceKind::Auth));
        assert_eq!(st.tr.phase(), Phase::ServiceActive);
        assert!(request_service(&mut st, SERVICE_AUTH).unwrap().is_none());
    }

    #[test]
    fn test_unexpected_service_accept() {
        let mut st = ClientState::new_for_test(ClientConfig::default());
        let mut accept = Buffer::new();
        accept.put_str(SERVICE_AUTH);
        assert!(matches!(recv_service_accept(&mut st, &mut accept), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unsupported_service() {
        let mut st = ClientState::new_for_test(ClientConfig::default());
        assert!(matches!(request_service(&mut st, "ssh-sftp"), Err(Error::ServiceNotSupported(_))));
    }

    #[tokio::test]
    async fn test_fail_resolves_waiters() {
        let mut st = ClientState::new_for_test(ClientConfig::default());
        let reply = request_service(&mut st, SERVICE_AUTH).unwrap().unwrap();
        st.tr.take_sent_payloads();

        fail(&mut st, Arc::new(Error::Mac));
        assert_eq!(st.tr.phase(), Phase::Error);
        match reply.wait(None).await {
            Err(Error::SessionFailed(err)) => assert!(matches!(*err, Error::Mac)),
            res => panic!("unexpected result {:?}", res),
        }

        // the session sends a disconnect with the MAC error reason
        let sent = st.tr.take_sent_payloads();
        assert_eq!(sent.len(), 1);
        let mut payload = Buffer::from_slice(&sent[0]);
        assert_eq!(payload.get_u8().unwrap(), msg::DISCONNECT);
        assert_eq!(payload.get_u32().unwrap(), crate::codes::disconnect::MAC_ERROR);
    }
}
