use std::{
    marker::PhantomData,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    CALL_WINDOW, CallCore, Connection, ConnectionState, Message, MsgFlags, MsgMeta, Payload, Role,
    error::{Error, ErrorKind, Result},
};

/// Consumed messages are credited back to the sender in batches.
const CREDIT_BATCH: usize = CALL_WINDOW / 2;

/// State shared by every handle onto one call.
pub(crate) struct CallShared {
    conn: Connection,
    callid: u64,
    use_msgpack: bool,
    core: Mutex<CallCore>,
    cancel: CancellationToken,
    credits: Arc<Semaphore>,
    /// Inbound messages consumed but not yet credited back.
    consumed: AtomicUsize,
}

impl CallShared {
    pub fn new(
        conn: Connection,
        callid: u64,
        use_msgpack: bool,
        core: CallCore,
        cancel: CancellationToken,
        credits: Arc<Semaphore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn,
            callid,
            use_msgpack,
            core: Mutex::new(core),
            cancel,
            credits,
            consumed: AtomicUsize::new(0),
        })
    }

    pub fn core(&self) -> MutexGuard<'_, CallCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn callid(&self) -> u64 {
        self.callid
    }

    pub fn use_msgpack(&self) -> bool {
        self.use_msgpack
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn meta(&self, flags: MsgFlags) -> MsgMeta {
        let mut flags = flags;
        if self.use_msgpack {
            flags |= MsgFlags::UseMessagePack;
        }
        if self.conn.role() == Role::Client {
            flags |= MsgFlags::IsReq;
        }
        MsgMeta::new(self.callid, flags)
    }

    /// The error for a call whose token fired.
    pub fn cancel_error(&self) -> Error {
        if self.conn.state() == ConnectionState::Closed {
            self.conn.close_error()
        } else {
            Error::new(ErrorKind::Cancelled, "call cancelled")
        }
    }

    pub fn fail(&self, err: Error) -> Error {
        self.core().fail(err)
    }

    /// Sends one data frame, checking cancellation at the boundary.
    ///
    /// Waits for send credit while the peer has a full window unconsumed.
    pub async fn send_message(&self, payload: Payload) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.fail(self.cancel_error()));
        }
        self.core().on_send()?;
        let meta = self.meta(MsgFlags::Data);
        let send = async {
            self.credits
                .acquire()
                .await
                .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?
                .forget();
            self.conn.send_frame(&meta, &payload).await
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(self.fail(self.cancel_error())),
            r = send => r.map_err(|e| self.fail(e)),
        }
    }

    /// Counts one consumed inbound message and returns a batch of credit
    /// to the peer.
    pub async fn consume(&self) {
        if self.consumed.fetch_add(1, Ordering::AcqRel) + 1 < CREDIT_BATCH {
            return;
        }
        let credit = self.consumed.swap(0, Ordering::AcqRel);
        let meta = self.meta(MsgFlags::Credit);
        let sent = match Payload::encode(&credit, self.use_msgpack) {
            Ok(payload) => self.conn.send_frame(&meta, &payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::debug!("send credit for call {} failed: {e}", self.callid);
        }
    }

    /// Sets the server-side terminal status and reports it to the client.
    ///
    /// Returns the status actually recorded, which is the earlier one if
    /// the call had already failed.
    pub async fn finish(&self, status: Result<()>) -> Result<()> {
        let status = {
            let mut core = self.core();
            if let Err(e) = core.finish(status) {
                tracing::debug!("call {} ended before its handler: {e}", self.callid);
            }
            core.status().cloned().unwrap_or(Ok(()))
        };

        let meta = self.meta(MsgFlags::Status | MsgFlags::EndOfStream);
        let sent = match Payload::encode(&status.as_ref().err(), self.use_msgpack) {
            Ok(payload) => self.conn.send_frame(&meta, &payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::debug!("send status of call {} failed: {e}", self.callid);
        }
        status
    }
}

/// Untyped inbound half of a server-side call.
pub(crate) struct CallReceiver {
    shared: Arc<CallShared>,
    inbound: mpsc::Receiver<Message>,
}

impl CallReceiver {
    pub fn new(shared: Arc<CallShared>, inbound: mpsc::Receiver<Message>) -> Self {
        Self { shared, inbound }
    }

    pub fn shared(&self) -> &Arc<CallShared> {
        &self.shared
    }

    /// Next request frame, or `None` once the client half-closed.
    pub async fn recv_message(&mut self) -> Result<Option<Message>> {
        {
            let core = self.shared.core();
            core.ensure_open()?;
            if core.recv_closed() {
                return Ok(None);
            }
        }

        let msg = tokio::select! {
            biased;
            () = self.shared.cancel.cancelled() => {
                return Err(self.shared.fail(self.shared.cancel_error()));
            }
            msg = self.inbound.recv() => msg,
        };
        let Some(msg) = msg else {
            return Err(self.shared.fail(self.shared.conn.close_error()));
        };

        let flags = msg.meta.flags;
        if flags.contains(MsgFlags::Data) {
            self.shared.core().on_recv()?;
            self.shared.consume().await;
            Ok(Some(msg))
        } else if flags.contains(MsgFlags::EndOfStream) {
            self.shared.core().on_recv_end()?;
            Ok(None)
        } else {
            Err(self.shared.fail(Error::new(
                ErrorKind::Protocol,
                format!("unexpected frame flags: {flags:?}"),
            )))
        }
    }

    /// The single request of a unary or server-streaming call.
    pub async fn recv_single(&mut self) -> Result<Message> {
        let msg = self.recv_message().await?.ok_or_else(|| {
            Error::new(ErrorKind::Protocol, "call closed without a request")
        })?;
        match self.recv_message().await? {
            None => Ok(msg),
            Some(_) => Err(self.shared.fail(Error::new(
                ErrorKind::Protocol,
                "call received more than one request",
            ))),
        }
    }
}

/// The stream of requests seen by a client-streaming or bidi handler.
pub struct RequestStream<Req> {
    receiver: CallReceiver,
    _marker: PhantomData<fn() -> Req>,
}

impl<Req> RequestStream<Req>
where
    Req: for<'c> Deserialize<'c>,
{
    pub(crate) fn new(receiver: CallReceiver) -> Self {
        Self {
            receiver,
            _marker: PhantomData,
        }
    }

    /// Next request in send order, or `None` after the client half-closed.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the client cancelled, `CallClosed` once the
    /// call ended and `Protocol` for frames that break the call shape.
    pub async fn recv(&mut self) -> Result<Option<Req>> {
        match self.receiver.recv_message().await? {
            Some(msg) => msg.deserialize().map(Some),
            None => Ok(None),
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.receiver.shared.cancel.is_cancelled()
    }
}

impl<Req> std::fmt::Debug for RequestStream<Req> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestStream")
            .field("callid", &self.receiver.shared.callid)
            .finish()
    }
}

/// The outbound half of a streaming handler. Clones share the same call.
pub struct ResponseSink<Rsp> {
    shared: Arc<CallShared>,
    _marker: PhantomData<fn(Rsp)>,
}

impl<Rsp> Clone for ResponseSink<Rsp> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Rsp: Serialize> ResponseSink<Rsp> {
    pub(crate) fn new(shared: Arc<CallShared>) -> Self {
        Self {
            shared,
            _marker: PhantomData,
        }
    }

    /// Sends one response.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` once the client cancelled; the handler should
    /// stop producing.
    pub async fn send(&self, rsp: &Rsp) -> Result<()> {
        let payload = Payload::encode(rsp, self.shared.use_msgpack)?;
        self.shared.send_message(payload).await
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolves when the client cancels the call.
    pub async fn cancelled(&self) {
        self.shared.cancel.cancelled().await;
    }
}

impl<Rsp> std::fmt::Debug for ResponseSink<Rsp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseSink")
            .field("callid", &self.shared.callid)
            .finish()
    }
}
