use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures_util::{FutureExt, future::BoxFuture};

use crate::{
    Context, Message, Payload,
    error::{Error, ErrorKind, Result},
};

/// Type-erased unary handler: request message in, encoded response out.
pub type UnaryHandler =
    Arc<dyn Fn(Context, Message) -> BoxFuture<'static, Result<Payload>> + Send + Sync>;

/// Cross-cutting logic wrapped around every unary call.
///
/// An implementation either runs `next` exactly once, possibly transforming
/// its result, or short-circuits with its own response or error. `Next` is
/// consumed by [`Next::run`], so it cannot be run twice.
pub trait Interceptor: Send + Sync {
    fn intercept<'a>(
        &'a self,
        ctx: Context,
        req: Message,
        next: Next,
    ) -> BoxFuture<'a, Result<Payload>>;
}

/// The rest of the chain, ending in the method handler.
pub struct Next(UnaryHandler);

impl Next {
    pub fn run(self, ctx: Context, req: Message) -> BoxFuture<'static, Result<Payload>> {
        (self.0)(ctx, req)
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

/// Ordered interceptors. The first one pushed is the outermost.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Wraps `terminal` so that each call passes through every interceptor
    /// in declared order.
    #[must_use]
    pub fn compose(&self, terminal: UnaryHandler) -> UnaryHandler {
        self.interceptors
            .iter()
            .rev()
            .fold(terminal, |next, interceptor| {
                let interceptor = interceptor.clone();
                let handler: UnaryHandler = Arc::new(move |ctx: Context, req: Message| {
                    let interceptor = interceptor.clone();
                    let next = Next(next.clone());
                    async move { interceptor.intercept(ctx, req, next).await }.boxed()
                });
                handler
            })
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Turns a panic anywhere below it into an `Internal` error.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryInterceptor;

impl Interceptor for RecoveryInterceptor {
    fn intercept<'a>(
        &'a self,
        ctx: Context,
        req: Message,
        next: Next,
    ) -> BoxFuture<'a, Result<Payload>> {
        let method = ctx.method().to_string();
        // the handler may panic before returning its future, so run it
        // inside the guarded future.
        let guarded = AssertUnwindSafe(async move { next.run(ctx, req).await });
        Box::pin(async move {
            match guarded.catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    tracing::error!(method = %method, "handler panicked: {msg}");
                    Err(Error::new(ErrorKind::Internal, format!("panic: {msg}")))
                }
            }
        })
    }
}

/// Logs each request and its result. Never alters the result.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn intercept<'a>(
        &'a self,
        ctx: Context,
        req: Message,
        next: Next,
    ) -> BoxFuture<'a, Result<Payload>> {
        Box::pin(async move {
            let method = ctx.method().to_string();
            let callid = ctx.callid();
            let use_msgpack = req.meta.use_msgpack();
            tracing::info!(
                method = %method,
                callid,
                request = %req.payload.preview(use_msgpack),
                "rpc request"
            );

            let result = next.run(ctx, req).await;
            match &result {
                Ok(rsp) => tracing::info!(
                    method = %method,
                    callid,
                    response = %rsp.preview(use_msgpack),
                    "rpc response"
                ),
                Err(e) => tracing::info!(method = %method, callid, error = %e, "rpc response"),
            }
            result
        })
    }
}
