#![forbid(unsafe_code)]
//! Mutually authenticated RPC over TLS.
//!
//! A [`Server`] serves methods registered in a [`Router`] over connections
//! secured by a [`SecurityContext`]. Each connection multiplexes calls of
//! four shapes (unary, server-streaming, client-streaming and bidi), and
//! every unary call passes through an [`InterceptorChain`].

mod error;
pub use error::{Error, ErrorKind, Result};

mod payload;
pub use payload::Payload;

mod msg;
pub use msg::{Message, MsgFlags, MsgMeta};

mod frame;
pub use frame::{CALL_WINDOW, MAX_MSG_SIZE, encode_frame, parse_frame};

mod credentials;
pub use credentials::{
    ClientAuthPolicy, ClientTlsConfig, PeerIdentity, SecurityContext, ServerTlsConfig,
    build_client_security, build_server_security,
};

mod config;
pub use config::{ClientConfig, ServerConfig};

mod call;
pub use call::{CallCore, CallShape, CallState, Role};

mod call_table;

mod task_supervisor;
pub use task_supervisor::TaskSupervisor;

mod context;
pub use context::Context;

mod stream;
pub use stream::{RequestStream, ResponseSink};

mod interceptor;
pub use interceptor::{
    Interceptor, InterceptorChain, LoggingInterceptor, Next, RecoveryInterceptor, UnaryHandler,
};

mod router;
pub use router::{MethodDescriptor, Router};

mod state;
pub use state::State;

mod connection;
pub use connection::{Connection, ConnectionState};

mod listener;
pub use listener::{Acceptor, Listener};

mod client;
pub use client::{Client, ClientCall};

mod server;
pub use server::Server;
