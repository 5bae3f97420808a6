use std::{marker::PhantomData, net::SocketAddr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    CallCore, CallShape, CallState, ClientConfig, Connection, ConnectionState, Message, MsgFlags,
    Payload, Role, SecurityContext,
    call_table::CallGuard,
    connection::TrackedCall,
    error::{Error, ErrorKind, Result},
    stream::CallShared,
};

/// Client end of one call.
///
/// Dropping an unfinished call cancels it on the server.
pub struct ClientCall<Req, Rsp> {
    shared: Arc<CallShared>,
    inbound: mpsc::Receiver<Message>,
    _guard: CallGuard,
    _marker: PhantomData<fn(Req) -> Rsp>,
}

impl<Req, Rsp> ClientCall<Req, Rsp>
where
    Req: Serialize,
    Rsp: for<'c> Deserialize<'c>,
{
    async fn open(
        conn: &Connection,
        method: &str,
        shape: CallShape,
        use_msgpack: bool,
    ) -> Result<Self> {
        if conn.state() != ConnectionState::Open {
            return Err(Error::new(
                ErrorKind::Unavailable,
                format!("connection is {:?}", conn.state()),
            ));
        }

        let callid = conn.alloc_callid();
        let TrackedCall {
            inbound,
            cancel,
            credits,
            guard,
        } = conn.track_call(callid)?;
        let shared = CallShared::new(
            conn.clone(),
            callid,
            use_msgpack,
            CallCore::new(shape, Role::Client),
            cancel,
            credits,
        );

        let mut meta = shared.meta(MsgFlags::Open);
        meta.method = method.to_string();
        conn.send_frame(&meta, &[]).await?;

        Ok(Self {
            shared,
            inbound,
            _guard: guard,
            _marker: PhantomData,
        })
    }

    /// Sends one request.
    ///
    /// # Errors
    ///
    /// Returns `CallClosed` once the call ended and `Protocol` for a send
    /// after `close_send` or a second request on a non-streaming call.
    pub async fn send(&mut self, req: &Req) -> Result<()> {
        let payload = Payload::encode(req, self.shared.use_msgpack())?;
        self.shared.send_message(payload).await
    }

    /// Half-closes the request direction.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if a unary or server-streaming call has not sent
    /// its request.
    pub async fn close_send(&mut self) -> Result<()> {
        if self.shared.core().send_closed() {
            return Ok(());
        }
        self.shared.core().close_send()?;
        let meta = self.shared.meta(MsgFlags::EndOfStream);
        self.shared
            .conn()
            .send_frame(&meta, &[])
            .await
            .map_err(|e| self.shared.fail(e))
    }

    /// Next response.
    ///
    /// Returns `Ok(None)` after the server finished with an OK status and
    /// `Err(status)` if the call failed.
    ///
    /// # Errors
    ///
    /// Returns the failure status, or `CallClosed` once the call already
    /// ended.
    pub async fn recv(&mut self) -> Result<Option<Rsp>> {
        self.shared.core().ensure_open()?;

        let msg = tokio::select! {
            biased;
            msg = self.inbound.recv() => msg,
            () = self.shared.cancel_token().cancelled() => {
                return Err(self.shared.fail(self.shared.cancel_error()));
            }
        };
        let Some(msg) = msg else {
            return Err(self.shared.fail(self.shared.conn().close_error()));
        };

        let flags = msg.meta.flags;
        if flags.contains(MsgFlags::Status) {
            let status = msg.status().map_err(|e| {
                Error::new(ErrorKind::Protocol, format!("invalid status frame: {e}"))
            });
            let mut core = self.shared.core();
            core.finish(status.and_then(|status| status))?;
            match core.status() {
                Some(Err(e)) => Err(e.clone()),
                _ => Ok(None),
            }
        } else if flags.contains(MsgFlags::Data) {
            self.shared.core().on_recv()?;
            self.shared.consume().await;
            msg.deserialize().map(Some)
        } else {
            Err(self.shared.fail(Error::new(
                ErrorKind::Protocol,
                format!("unexpected frame flags: {flags:?}"),
            )))
        }
    }

    /// Half-closes and waits for the single response of a unary or
    /// client-streaming call.
    ///
    /// # Errors
    ///
    /// Returns the failure status, or `Protocol` if the server did not send
    /// exactly one response.
    pub async fn close_and_recv(&mut self) -> Result<Rsp> {
        self.close_send().await?;
        let rsp = self
            .recv()
            .await?
            .ok_or_else(|| Error::new(ErrorKind::Protocol, "call completed without a response"))?;
        match self.recv().await? {
            None => Ok(rsp),
            Some(_) => Err(self.shared.fail(Error::new(
                ErrorKind::Protocol,
                "call returned more than one response",
            ))),
        }
    }

    /// Cancels the call. The server observes it at its next message
    /// boundary; locally the call fails with `Cancelled`.
    pub async fn cancel(&mut self) {
        {
            let mut core = self.shared.core();
            if core.is_terminal() {
                return;
            }
            core.fail(Error::new(ErrorKind::Cancelled, "call cancelled by client"));
        }
        let meta = self.shared.meta(MsgFlags::Cancel);
        if let Err(e) = self.shared.conn().send_frame(&meta, &[]).await {
            tracing::debug!("send cancel for call {} failed: {e}", self.shared.callid());
        }
    }
}

impl<Req, Rsp> ClientCall<Req, Rsp> {
    #[must_use]
    pub fn callid(&self) -> u64 {
        self.shared.callid()
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.shared.core().state()
    }

    /// The terminal status, once the call ended.
    #[must_use]
    pub fn status(&self) -> Option<Result<()>> {
        self.shared.core().status().cloned()
    }
}

impl<Req, Rsp> Drop for ClientCall<Req, Rsp> {
    fn drop(&mut self) {
        if self.shared.core().is_terminal() {
            return;
        }
        let meta = self.shared.meta(MsgFlags::Cancel);
        if let Err(e) = self.shared.conn().try_send_frame(&meta) {
            tracing::debug!("cancel dropped call {} failed: {e}", self.shared.callid());
        }
    }
}

impl<Req, Rsp> std::fmt::Debug for ClientCall<Req, Rsp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCall")
            .field("callid", &self.shared.callid())
            .field("state", &self.state())
            .finish()
    }
}

/// A connection to one server plus call helpers for each shape.
#[derive(Clone, Debug)]
pub struct Client {
    conn: Connection,
    config: ClientConfig,
}

impl Client {
    /// # Errors
    ///
    /// See [`Connection::dial`].
    pub async fn connect(
        addr: SocketAddr,
        security: &SecurityContext,
        config: ClientConfig,
    ) -> Result<Self> {
        let conn = Connection::dial(addr, security, &config).await?;
        Ok(Self { conn, config })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Opens a call of any shape.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the connection is closing.
    pub async fn call<Req, Rsp>(&self, method: &str, shape: CallShape) -> Result<ClientCall<Req, Rsp>>
    where
        Req: Serialize,
        Rsp: for<'c> Deserialize<'c>,
    {
        ClientCall::open(&self.conn, method, shape, self.config.use_msgpack).await
    }

    /// One request, one response, bounded by the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns the server's failure status, or `Timeout` after cancelling
    /// the call when the deadline passes.
    pub async fn unary<Req, Rsp>(&self, method: &str, req: &Req) -> Result<Rsp>
    where
        Req: Serialize,
        Rsp: for<'c> Deserialize<'c>,
    {
        let mut call = self.call::<Req, Rsp>(method, CallShape::Unary).await?;
        let timeout = self.config.timeout;
        let result = tokio::time::timeout(timeout, async {
            call.send(req).await?;
            call.close_and_recv().await
        })
        .await;
        match result {
            Ok(result) => result,
            Err(_) => {
                call.cancel().await;
                Err(Error::new(
                    ErrorKind::Timeout,
                    format!("{method} timed out after {timeout:?}"),
                ))
            }
        }
    }

    /// Sends the single request of a server-streaming call; read the
    /// responses with [`ClientCall::recv`].
    ///
    /// # Errors
    pub async fn server_stream<Req, Rsp>(&self, method: &str, req: &Req) -> Result<ClientCall<Req, Rsp>>
    where
        Req: Serialize,
        Rsp: for<'c> Deserialize<'c>,
    {
        let mut call = self.call(method, CallShape::ServerStream).await?;
        call.send(req).await?;
        call.close_send().await?;
        Ok(call)
    }

    /// # Errors
    pub async fn client_stream<Req, Rsp>(&self, method: &str) -> Result<ClientCall<Req, Rsp>>
    where
        Req: Serialize,
        Rsp: for<'c> Deserialize<'c>,
    {
        self.call(method, CallShape::ClientStream).await
    }

    /// # Errors
    pub async fn bidi_stream<Req, Rsp>(&self, method: &str) -> Result<ClientCall<Req, Rsp>>
    where
        Req: Serialize,
        Rsp: for<'c> Deserialize<'c>,
    {
        self.call(method, CallShape::BidiStream).await
    }

    /// See [`Connection::close`].
    pub async fn close(&self, grace: Duration) {
        self.conn.close(grace).await;
    }

    pub fn abort(&self) {
        self.conn.abort();
    }
}
