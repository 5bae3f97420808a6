use std::{collections::HashMap, future::Future, sync::Arc};

use foldhash::fast::RandomState;
use futures_util::{FutureExt, future::BoxFuture};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    CallShape, Context, Message, Payload, RequestStream, ResponseSink, UnaryHandler,
    error::{Error, ErrorKind, Result},
    stream::{CallReceiver, CallShared},
};

type ServerStreamHandler =
    Arc<dyn Fn(Context, Message, Arc<CallShared>) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type ClientStreamHandler =
    Arc<dyn Fn(Context, CallReceiver) -> BoxFuture<'static, Result<Payload>> + Send + Sync>;
type BidiStreamHandler = Arc<
    dyn Fn(Context, CallReceiver, Arc<CallShared>) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub(crate) enum Handler {
    Unary(UnaryHandler),
    ServerStream(ServerStreamHandler),
    ClientStream(ClientStreamHandler),
    BidiStream(BidiStreamHandler),
}

/// A named method and its shape-specific handler.
#[derive(Clone)]
pub struct MethodDescriptor {
    name: String,
    handler: Handler,
}

impl MethodDescriptor {
    pub fn unary<Req, Rsp, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let handler: UnaryHandler = Arc::new(move |ctx: Context, msg: Message| {
            let use_msgpack = msg.meta.use_msgpack();
            let fut = msg.deserialize::<Req>().map(|req| f(ctx, req));
            async move {
                let rsp = fut?.await?;
                Payload::encode(&rsp, use_msgpack)
            }
            .boxed()
        });
        Self {
            name: name.into(),
            handler: Handler::Unary(handler),
        }
    }

    pub fn server_stream<Req, Rsp, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(Context, Req, ResponseSink<Rsp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: ServerStreamHandler =
            Arc::new(move |ctx: Context, msg: Message, shared: Arc<CallShared>| {
                let fut = msg
                    .deserialize::<Req>()
                    .map(|req| f(ctx, req, ResponseSink::new(shared)));
                async move { fut?.await }.boxed()
            });
        Self {
            name: name.into(),
            handler: Handler::ServerStream(handler),
        }
    }

    pub fn client_stream<Req, Rsp, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(Context, RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let handler: ClientStreamHandler = Arc::new(move |ctx: Context, receiver: CallReceiver| {
            let use_msgpack = receiver.shared().use_msgpack();
            let fut = f(ctx, RequestStream::new(receiver));
            async move {
                let rsp = fut.await?;
                Payload::encode(&rsp, use_msgpack)
            }
            .boxed()
        });
        Self {
            name: name.into(),
            handler: Handler::ClientStream(handler),
        }
    }

    pub fn bidi_stream<Req, Rsp, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(Context, RequestStream<Req>, ResponseSink<Rsp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: BidiStreamHandler = Arc::new(
            move |ctx: Context, receiver: CallReceiver, shared: Arc<CallShared>| {
                f(ctx, RequestStream::new(receiver), ResponseSink::new(shared)).boxed()
            },
        );
        Self {
            name: name.into(),
            handler: Handler::BidiStream(handler),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn shape(&self) -> CallShape {
        match self.handler {
            Handler::Unary(_) => CallShape::Unary,
            Handler::ServerStream(_) => CallShape::ServerStream,
            Handler::ClientStream(_) => CallShape::ClientStream,
            Handler::BidiStream(_) => CallShape::BidiStream,
        }
    }

    pub(crate) fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("shape", &self.shape())
            .finish()
    }
}

/// Method registry, filled at startup and read-only once serving.
#[derive(Default)]
pub struct Router {
    methods: HashMap<String, MethodDescriptor, RandomState>,
}

impl Router {
    /// # Errors
    ///
    /// Returns `DuplicateMethod` if the name is already registered.
    pub fn register(&mut self, method: MethodDescriptor) -> Result<()> {
        if self.methods.contains_key(&method.name) {
            return Err(Error::new(
                ErrorKind::DuplicateMethod,
                format!("method already registered: {}", method.name),
            ));
        }
        self.methods.insert(method.name.clone(), method);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown method name.
    pub fn resolve(&self, name: &str) -> Result<&MethodDescriptor> {
        self.methods.get(name).ok_or_else(|| {
            Error::new(ErrorKind::NotFound, format!("method not found: {name}"))
        })
    }

    pub fn method_names(&self) -> impl Iterator<Item = &String> {
        self.methods.keys()
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.methods.keys())
            .finish()
    }
}
