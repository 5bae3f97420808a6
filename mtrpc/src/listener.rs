use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use foldhash::fast::RandomState;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};
use tokio_rustls::{TlsAcceptor, TlsStream};

use crate::{
    Connection, PeerIdentity, Role, SecurityContext, ServerConfig, State, TaskSupervisor,
    error::{Error, ErrorKind, Result},
    frame::PREFACE,
};

/// Server-side TLS handshake plus preface.
#[derive(Clone)]
struct Handshake {
    tls: TlsAcceptor,
    state: Arc<State>,
    config: ServerConfig,
}

impl Handshake {
    async fn run(&self, tcp: TcpStream, peer_addr: SocketAddr) -> Result<Connection> {
        tcp.set_nodelay(true)?;
        let accept = async {
            let mut tls = self
                .tls
                .accept(tcp)
                .await
                .map_err(|e| Error::new(ErrorKind::Handshake, format!("{peer_addr}: {e}")))?;
            tls.write_all(&PREFACE).await?;
            tls.flush().await?;
            Ok::<_, Error>(tls)
        };
        let timeout = self.config.handshake_timeout;
        let tls = tokio::time::timeout(timeout, accept).await.map_err(|_| {
            Error::new(
                ErrorKind::Handshake,
                format!("{peer_addr}: handshake timed out after {timeout:?}"),
            )
        })??;

        let peer = PeerIdentity::from_chain(tls.get_ref().1.peer_certificates());
        Ok(Connection::start(
            TlsStream::Server(tls),
            Role::Server,
            peer,
            peer_addr,
            Some(self.state.clone()),
        ))
    }
}

/// A bound TLS listening socket.
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    handshake: Handshake,
}

impl Acceptor {
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `security` is not a server context and
    /// `Bind` if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        security: &SecurityContext,
        state: Arc<State>,
        config: &ServerConfig,
    ) -> Result<Self> {
        let tls = security.acceptor()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::Bind, format!("{addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::Bind, format!("{addr}: {e}")))?;
        Ok(Self {
            listener,
            local_addr,
            handshake: Handshake {
                tls,
                state,
                config: config.clone(),
            },
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts one connection and completes its handshake.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if accepting fails and `Handshake` if the client
    /// fails TLS negotiation or certificate verification.
    pub async fn accept(&self) -> Result<Connection> {
        let (tcp, peer_addr) = self.listener.accept().await?;
        self.handshake.run(tcp, peer_addr).await
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Accept loops plus the registry of live server connections.
///
/// Handshakes run in their own tasks so a slow client never blocks the
/// accept loop.
pub struct Listener {
    task_supervisor: TaskSupervisor,
    connections: Arc<dashmap::DashMap<u64, Connection, RandomState>>,
    next_id: Arc<AtomicU64>,
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener {
    #[must_use]
    pub fn new() -> Self {
        Self {
            task_supervisor: TaskSupervisor::create(),
            connections: Arc::default(),
            next_id: Arc::default(),
        }
    }

    /// Starts an accept loop on `acceptor` and returns its address.
    pub fn start_listen(&self, acceptor: Acceptor) -> SocketAddr {
        let listener_addr = acceptor.local_addr();
        let connections = self.connections.clone();
        let next_id = self.next_id.clone();

        let task_supervisor = self.task_supervisor.start_async_task();
        tokio::spawn(async move {
            tokio::select! {
                () = task_supervisor.stopped() => {
                    tracing::info!("stop accept loop: {listener_addr}");
                }
                () = async {
                    tracing::info!("start listening: {listener_addr}");
                    loop {
                        let (tcp, peer_addr) = match acceptor.listener.accept().await {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                tracing::error!("accept on {listener_addr} failed: {e}");
                                break;
                            }
                        };

                        let guard = task_supervisor.start_async_task();
                        let handshake = acceptor.handshake.clone();
                        let connections = connections.clone();
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(async move {
                            let conn = tokio::select! {
                                () = guard.stopped() => return,
                                r = handshake.run(tcp, peer_addr) => match r {
                                    Ok(conn) => conn,
                                    Err(e) => {
                                        tracing::warn!("reject connection: {e}");
                                        return;
                                    }
                                },
                            };

                            tracing::info!(
                                peer = %peer_addr,
                                identity = conn.peer().map(PeerIdentity::fingerprint).as_deref(),
                                "connection established"
                            );
                            connections.insert(id, conn.clone());
                            if guard.is_stopped() {
                                conn.abort();
                            }
                            conn.join().await;
                            connections.remove(&id);
                            tracing::info!(peer = %peer_addr, "connection closed");
                        });
                    }
                } => {}
            }
        });

        listener_addr
    }

    /// Live connections.
    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Stops every accept loop. Established connections are untouched.
    pub fn stop(&self) {
        self.task_supervisor.stop();
    }

    /// Waits until the accept loops and every connection have ended.
    pub async fn join(&self) {
        self.task_supervisor.all_stopped().await;
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("connections", &self.connections.len())
            .finish()
    }
}
