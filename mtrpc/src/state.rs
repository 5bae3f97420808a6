use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use foldhash::fast::RandomState;
use futures_util::{FutureExt, future::BoxFuture};

use crate::{
    CallCore, CallShape, Connection, Context, InterceptorChain, Message, MsgMeta, Role, Router,
    UnaryHandler,
    connection::TrackedCall,
    error::{Error, ErrorKind, Result},
    interceptor::panic_message,
    router::Handler,
    stream::{CallReceiver, CallShared},
};

/// Immutable server state shared by every connection: the registry and the
/// interceptor-wrapped unary handlers.
pub struct State {
    router: Router,
    unary: HashMap<String, UnaryHandler, RandomState>,
}

impl State {
    #[must_use]
    pub fn create(router: Router, chain: &InterceptorChain) -> Self {
        let unary = router
            .methods()
            .filter_map(|method| match method.handler() {
                Handler::Unary(handler) => {
                    Some((method.name().to_string(), chain.compose(handler.clone())))
                }
                _ => None,
            })
            .collect();
        Self { router, unary }
    }

    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Registers a new call from its `Open` frame and spawns its task.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the client reused a live call id.
    pub(crate) fn dispatch(self: &Arc<Self>, conn: &Connection, open: Message) -> Result<()> {
        let tracked = conn.track_call(open.meta.callid)?;
        tokio::spawn(self.clone().serve_call(conn.clone(), open.meta, tracked));
        Ok(())
    }

    async fn serve_call(self: Arc<Self>, conn: Connection, meta: MsgMeta, tracked: TrackedCall) {
        let TrackedCall {
            inbound,
            cancel,
            credits,
            guard,
        } = tracked;
        let ctx = Context::new(
            meta.method.clone(),
            meta.callid,
            conn.peer().cloned(),
            conn.peer_addr(),
            cancel.clone(),
        );

        let method = self.router.resolve(&meta.method);
        let shape = method.as_ref().map_or(CallShape::Unary, |m| m.shape());
        let shared = CallShared::new(
            conn,
            meta.callid,
            meta.use_msgpack(),
            CallCore::new(shape, Role::Server),
            cancel,
            credits,
        );

        let result = match method {
            Ok(method) => {
                let handler = method.handler().clone();
                let receiver = CallReceiver::new(shared.clone(), inbound);
                self.invoke(&meta.method, handler, ctx, receiver).await
            }
            Err(e) => {
                tracing::warn!("{e}");
                Err(e)
            }
        };

        if let Err(e) = shared.finish(result).await {
            tracing::debug!(method = %meta.method, callid = meta.callid, "call failed: {e}");
        }
        drop(guard);
    }

    /// Runs the handler behind a panic guard, racing it against the call's
    /// cancellation.
    async fn invoke(
        &self,
        name: &str,
        handler: Handler,
        ctx: Context,
        mut receiver: CallReceiver,
    ) -> Result<()> {
        let shared = receiver.shared().clone();
        let fut: BoxFuture<'static, Result<()>> = match handler {
            Handler::Unary(handler) => {
                // the composed handler when interceptors apply.
                let handler = self.unary.get(name).cloned().unwrap_or(handler);
                let shared = shared.clone();
                async move {
                    let req = receiver.recv_single().await?;
                    let rsp = handler(ctx, req).await?;
                    shared.send_message(rsp).await
                }
                .boxed()
            }
            Handler::ServerStream(handler) => {
                let shared = shared.clone();
                async move {
                    let req = receiver.recv_single().await?;
                    handler(ctx, req, shared).await
                }
                .boxed()
            }
            Handler::ClientStream(handler) => {
                let shared = shared.clone();
                async move {
                    let rsp = handler(ctx, receiver).await?;
                    shared.send_message(rsp).await
                }
                .boxed()
            }
            Handler::BidiStream(handler) => {
                let shared = shared.clone();
                async move { handler(ctx, receiver, shared).await }.boxed()
            }
        };

        let guarded = AssertUnwindSafe(fut).catch_unwind().map(|r| {
            r.unwrap_or_else(|panic| {
                let msg = panic_message(panic.as_ref());
                tracing::error!(method = %name, "handler panicked: {msg}");
                Err(Error::new(ErrorKind::Internal, format!("panic: {msg}")))
            })
        });

        tokio::select! {
            r = guarded => r,
            () = shared.cancel_token().cancelled() => Err(shared.cancel_error()),
        }
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}
