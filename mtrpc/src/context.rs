use std::net::SocketAddr;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::PeerIdentity;

/// Per-call information handed to interceptors and handlers.
#[derive(Clone, Debug)]
pub struct Context {
    method: String,
    callid: u64,
    peer: Option<PeerIdentity>,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
}

impl Context {
    pub(crate) fn new(
        method: String,
        callid: u64,
        peer: Option<PeerIdentity>,
        peer_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            method,
            callid,
            peer,
            peer_addr,
            cancel,
        }
    }

    /// A detached context, for driving handlers outside a connection.
    #[must_use]
    pub fn detached(method: impl Into<String>) -> Self {
        Self::new(
            method.into(),
            0,
            None,
            SocketAddr::from(([0, 0, 0, 0], 0)),
            CancellationToken::new(),
        )
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn callid(&self) -> u64 {
        self.callid
    }

    /// The verified client certificate chain, if one was presented.
    #[must_use]
    pub fn peer(&self) -> Option<&PeerIdentity> {
        self.peer.as_ref()
    }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// True once the client cancelled or the connection went away.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}
