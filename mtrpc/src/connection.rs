use std::{
    io::IoSlice,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{Semaphore, mpsc},
};
use tokio_rustls::TlsStream;
use tokio_util::sync::CancellationToken;

use crate::{
    CALL_WINDOW, ClientConfig, Message, MsgFlags, MsgMeta, PeerIdentity, Role, SecurityContext, State,
    TaskSupervisor,
    call_table::{CallGuard, CallTable},
    error::{Error, ErrorKind, Result},
    frame::{PREFACE, encode_frame, parse_frame},
    payload::Payload,
    task_supervisor::TaskSupervisorGuard,
};

type Stream = TlsStream<TcpStream>;

const OUTBOUND_QUEUE: usize = 1024;

/// A call's inbound queue holds its window of `Data` frames plus the
/// closing `EndOfStream` and `Status`.
const CALL_QUEUE: usize = CALL_WINDOW + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// Refuses new calls while in-flight calls finish.
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Everything the owner of one tracked call holds.
pub(crate) struct TrackedCall {
    pub inbound: mpsc::Receiver<Message>,
    pub cancel: CancellationToken,
    /// Credit for sending `Data` frames to the peer.
    pub credits: Arc<Semaphore>,
    pub guard: CallGuard,
}

struct ConnectionInner {
    role: Role,
    peer: Option<PeerIdentity>,
    peer_addr: SocketAddr,
    state: AtomicU8,
    outbound: mpsc::Sender<Bytes>,
    calls: Arc<CallTable>,
    close_reason: Mutex<Option<Error>>,
    /// Owns the reader and writer tasks; its stop token parents every call.
    tasks: TaskSupervisor,
}

impl ConnectionInner {
    fn shutdown(&self, reason: Error) {
        {
            let mut close_reason = self
                .close_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if close_reason.is_none() {
                *close_reason = Some(reason);
            }
        }
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.tasks.stop();
    }
}

/// One authenticated TLS connection multiplexing many calls.
///
/// Cheap to clone. The reader task routes frames by call id, the writer task
/// batches outbound frames from every call into vectored writes.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connects, completes the TLS handshake and waits for the server
    /// preface.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the TCP connect fails, `Handshake` if TLS
    /// negotiation fails or the server rejects our certificate, and
    /// `Timeout` if `connect_timeout` expires first.
    pub async fn dial(
        addr: SocketAddr,
        security: &SecurityContext,
        config: &ClientConfig,
    ) -> Result<Self> {
        let (connector, server_name) = security.connector()?;

        let connect = async {
            let tcp = TcpStream::connect(addr).await?;
            tcp.set_nodelay(true)?;
            let mut tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::new(ErrorKind::Handshake, format!("{addr}: {e}")))?;

            // with TLS 1.3 the server verifies our certificate after we
            // consider the handshake done; a rejection shows up here.
            let mut preface = [0u8; PREFACE.len()];
            tls.read_exact(&mut preface).await.map_err(|e| {
                Error::new(
                    ErrorKind::Handshake,
                    format!("{addr} closed the connection during the handshake: {e}"),
                )
            })?;
            if preface != PREFACE {
                return Err(Error::new(
                    ErrorKind::Protocol,
                    format!("unexpected preface from {addr}: {preface:02X?}"),
                ));
            }
            Ok::<_, Error>(tls)
        };

        let tls = match config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| {
                    Error::new(
                        ErrorKind::Timeout,
                        format!("connect to {addr} timed out after {timeout:?}"),
                    )
                })??,
            None => connect.await?,
        };

        let peer = PeerIdentity::from_chain(tls.get_ref().1.peer_certificates());
        tracing::debug!("connected to {addr}");
        Ok(Self::start(
            TlsStream::Client(tls),
            Role::Client,
            peer,
            addr,
            None,
        ))
    }

    pub(crate) fn start(
        stream: Stream,
        role: Role,
        peer: Option<PeerIdentity>,
        peer_addr: SocketAddr,
        state: Option<Arc<State>>,
    ) -> Self {
        let (recv_stream, send_stream) = tokio::io::split(stream);
        let (outbound, receiver) = mpsc::channel(OUTBOUND_QUEUE);
        let inner = Arc::new(ConnectionInner {
            role,
            peer,
            peer_addr,
            state: AtomicU8::new(ConnectionState::Open as u8),
            outbound,
            calls: Arc::default(),
            close_reason: Mutex::default(),
            tasks: TaskSupervisor::create(),
        });

        let guard = inner.tasks.start_async_task();
        tokio::spawn(async move {
            if let Err(e) = Self::start_send_loop(send_stream, receiver, &guard).await {
                tracing::debug!("send loop for {peer_addr} failed: {e}");
            }
        });

        let guard = inner.tasks.start_async_task();
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let result = tokio::select! {
                () = guard.stopped() => Ok(()),
                r = Self::start_recv_loop(recv_stream, weak.clone(), state) => r,
            };
            if let Err(e) = result
                && let Some(inner) = weak.upgrade()
            {
                tracing::debug!("recv loop for {peer_addr} stopped: {e}");
                inner.shutdown(e);
            }
        });

        Self { inner }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// The verified certificate chain of the remote side, if it sent one.
    #[must_use]
    pub fn peer(&self) -> Option<&PeerIdentity> {
        self.inner.peer.as_ref()
    }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Number of calls currently in flight.
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.inner.calls.len()
    }

    /// Stops accepting calls, waits up to `grace` for in-flight calls, then
    /// cancels the rest and closes the transport.
    pub async fn close(&self, grace: Duration) {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            if tokio::time::timeout(grace, inner.calls.wait_empty())
                .await
                .is_err()
            {
                tracing::warn!(
                    "{} calls to {} still running after {grace:?}, cancelling",
                    inner.calls.len(),
                    inner.peer_addr
                );
            }
            inner.shutdown(Error::new(ErrorKind::Cancelled, "connection closed"));
        }
        self.join().await;
    }

    /// Cancels every in-flight call and closes the transport immediately.
    pub fn abort(&self) {
        self.inner
            .shutdown(Error::new(ErrorKind::Cancelled, "connection aborted"));
    }

    /// Waits until the reader and writer tasks have exited.
    pub async fn join(&self) {
        self.inner.tasks.all_stopped().await;
    }

    /// Why the connection closed, or a generic `Transport` error.
    pub(crate) fn close_error(&self) -> Error {
        self.inner
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| Error::new(ErrorKind::Transport, "connection closed"))
    }

    pub(crate) fn alloc_callid(&self) -> u64 {
        self.inner.calls.alloc_id()
    }

    /// Registers a call so the reader task can route its frames.
    pub(crate) fn track_call(&self, callid: u64) -> Result<TrackedCall> {
        let (tx, inbound) = mpsc::channel(CALL_QUEUE);
        let cancel = self.inner.tasks.child_token();
        let credits = Arc::new(Semaphore::new(CALL_WINDOW));
        let guard = self
            .inner
            .calls
            .insert(callid, tx, cancel.clone(), credits.clone())?;
        Ok(TrackedCall {
            inbound,
            cancel,
            credits,
            guard,
        })
    }

    /// # Errors
    ///
    /// Returns the close reason if the connection is gone.
    pub(crate) async fn send_frame(&self, meta: &MsgMeta, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(meta, payload)?;
        self.inner
            .outbound
            .send(frame)
            .await
            .map_err(|_| self.close_error())
    }

    /// Queues a frame without waiting, for use from `Drop`.
    pub(crate) fn try_send_frame(&self, meta: &MsgMeta) -> Result<()> {
        let frame = encode_frame(meta, &[])?;
        self.inner
            .outbound
            .try_send(frame)
            .map_err(|e| Error::new(ErrorKind::Transport, e.to_string()))
    }

    async fn handle_frame(&self, msg: Message, state: Option<&Arc<State>>) -> Result<()> {
        let callid = msg.meta.callid;
        let flags = msg.meta.flags;
        match (self.inner.role, state) {
            (Role::Server, Some(state)) => {
                if !msg.meta.is_req() {
                    return Err(Error::new(
                        ErrorKind::Protocol,
                        format!("client sent a response frame for call {callid}"),
                    ));
                }
                if flags.contains(MsgFlags::Open) {
                    if self.state() == ConnectionState::Open {
                        state.dispatch(self, msg)?;
                    } else {
                        self.refuse(&msg.meta).await;
                    }
                } else if flags.contains(MsgFlags::Cancel) {
                    self.inner.calls.cancel(callid);
                } else {
                    self.route(msg).await?;
                }
            }
            (Role::Client, None) => {
                if msg.meta.is_req() {
                    return Err(Error::new(
                        ErrorKind::Protocol,
                        format!("server sent a request frame for call {callid}"),
                    ));
                }
                self.route(msg).await?;
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::Internal,
                    "connection role does not match its dispatch state",
                ));
            }
        }
        Ok(())
    }

    /// Hands a frame to its call, or its credit to the call's sender.
    ///
    /// Never waits on the call itself. A call whose peer breaks flow control
    /// is cancelled and the reader moves on.
    async fn route(&self, msg: Message) -> Result<()> {
        let callid = msg.meta.callid;
        let routed = if msg.meta.flags.contains(MsgFlags::Credit) {
            let credit: usize = msg.deserialize()?;
            self.inner.calls.grant(callid, credit)
        } else {
            self.inner.calls.post(callid, msg)
        };
        if let Err(e) = routed {
            tracing::warn!("{e} from {}, cancelling the call", self.inner.peer_addr);
            if self.inner.role == Role::Client {
                let meta = MsgMeta::new(callid, MsgFlags::IsReq | MsgFlags::Cancel);
                if let Err(e) = self.send_frame(&meta, &[]).await {
                    tracing::debug!("send cancel for call {callid} failed: {e}");
                }
            }
        }
        Ok(())
    }

    async fn refuse(&self, open: &MsgMeta) {
        let err = Error::new(ErrorKind::Unavailable, "connection is closing");
        let use_msgpack = open.use_msgpack();
        let mut flags = MsgFlags::Status | MsgFlags::EndOfStream;
        if use_msgpack {
            flags |= MsgFlags::UseMessagePack;
        }
        let meta = MsgMeta::new(open.callid, flags);
        let sent = match Payload::encode(&Some(err), use_msgpack) {
            Ok(payload) => self.send_frame(&meta, &payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::debug!("refuse call {} failed: {e}", open.callid);
        }
    }

    async fn start_recv_loop(
        mut recv_stream: ReadHalf<Stream>,
        weak: Weak<ConnectionInner>,
        state: Option<Arc<State>>,
    ) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(1 << 16);
        loop {
            if let Some(msg) = parse_frame(&mut buffer)? {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                Connection { inner }
                    .handle_frame(msg, state.as_ref())
                    .await?;
            } else {
                let n = recv_stream.read_buf(&mut buffer).await?;
                if n == 0 {
                    return Err(Error::new(
                        ErrorKind::Transport,
                        "connection closed by peer",
                    ));
                }
            }
        }
    }

    async fn start_send_loop(
        mut send_stream: WriteHalf<Stream>,
        mut receiver: mpsc::Receiver<Bytes>,
        guard: &TaskSupervisorGuard,
    ) -> Result<()> {
        const LIMIT: usize = 64;
        let mut msgs = Vec::with_capacity(LIMIT);
        let mut closing = false;
        loop {
            // after stop, drain what is already queued and then shut down.
            let n = tokio::select! {
                biased;
                n = receiver.recv_many(&mut msgs, LIMIT) => n,
                () = guard.stopped(), if !closing => {
                    receiver.close();
                    closing = true;
                    continue;
                }
            };
            if n == 0 {
                break;
            }

            let mut bufs = [IoSlice::new(&[]); LIMIT];
            for (msg, io_slice) in msgs.iter().zip(&mut bufs) {
                *io_slice = IoSlice::new(msg);
            }

            let mut slices = &mut bufs[..msgs.len()];
            while !slices.is_empty() {
                let n = send_stream.write_vectored(slices).await?;
                if n == 0 {
                    return Err(Error::new(ErrorKind::Transport, "write zero"));
                }
                IoSlice::advance_slices(&mut slices, n);
            }
            send_stream.flush().await?;
            msgs.clear();
        }
        send_stream.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.inner.role)
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.state())
            .field("calls", &self.inner.calls)
            .finish_non_exhaustive()
    }
}
