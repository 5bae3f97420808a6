use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::future::join_all;

use crate::{
    Acceptor, Connection, InterceptorChain, Listener, Result, Router, SecurityContext,
    ServerConfig, State,
};

/// RPC server: a method registry served over mutually authenticated TLS.
///
/// ```rust,no_run
/// # use mtrpc::{Server, Router, MethodDescriptor, InterceptorChain, RecoveryInterceptor,
/// #     LoggingInterceptor, ServerConfig, ClientAuthPolicy, build_server_security};
/// # use std::{path::Path, time::Duration};
/// # #[tokio::main]
/// # async fn main() -> mtrpc::Result<()> {
/// let mut router = Router::default();
/// router.register(MethodDescriptor::unary(
///     "SearchService/Search",
///     |_ctx, req: String| async move { Ok(format!("{req} Server")) },
/// ))?;
///
/// let chain = InterceptorChain::new()
///     .with(RecoveryInterceptor)
///     .with(LoggingInterceptor);
/// let server = Server::create(router, &chain, &ServerConfig::default());
///
/// let security = build_server_security(
///     Path::new("server.pem"),
///     Path::new("server.key"),
///     Some(Path::new("ca.pem")),
///     ClientAuthPolicy::RequireAndVerify,
/// )?;
/// let addr = server.listen("127.0.0.1:50051".parse().unwrap(), &security).await?;
/// println!("listening on {addr}");
///
/// server.stop(Duration::from_secs(5)).await;
/// server.join().await;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    state: Arc<State>,
    config: ServerConfig,
    listener: Listener,
}

impl Server {
    /// Freezes the router and folds `chain` around every unary handler.
    #[must_use]
    pub fn create(router: Router, chain: &InterceptorChain, config: &ServerConfig) -> Self {
        Self {
            state: Arc::new(State::create(router, chain)),
            config: config.clone(),
            listener: Listener::new(),
        }
    }

    /// Binds `addr` and starts accepting connections.
    ///
    /// Returns the bound address, which differs from `addr` for port 0.
    ///
    /// # Errors
    ///
    /// Returns `Bind` if the address cannot be bound and `InvalidArgument`
    /// if `security` is not a server context.
    pub async fn listen(&self, addr: SocketAddr, security: &SecurityContext) -> Result<SocketAddr> {
        let acceptor = Acceptor::bind(addr, security, self.state.clone(), &self.config).await?;
        let mut methods: Vec<_> = self.state.router().method_names().collect();
        methods.sort();
        tracing::info!(
            client_auth = ?security.client_auth(),
            "serving methods: {methods:?}"
        );
        Ok(self.listener.start_listen(acceptor))
    }

    #[must_use]
    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        self.listener.connections()
    }

    /// Stops accepting, then closes every connection gracefully.
    pub async fn stop(&self, grace: Duration) {
        self.listener.stop();
        let connections = self.listener.connections();
        join_all(connections.iter().map(|conn| conn.close(grace))).await;
    }

    /// Stops accepting and aborts every connection.
    pub fn abort(&self) {
        self.listener.stop();
        for conn in self.listener.connections() {
            conn.abort();
        }
    }

    /// Waits for the accept loops and all connections to end.
    pub async fn join(&self) {
        self.listener.join().await;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.abort();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("listener", &self.listener)
            .finish()
    }
}
