use std::{path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};
use mtrpc::{
    ClientAuthPolicy, InterceptorChain, LoggingInterceptor, RecoveryInterceptor, Router, Server,
    ServerConfig, build_server_security,
};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ClientAuth {
    None,
    RequestOnly,
    RequireAndVerify,
}

impl From<ClientAuth> for ClientAuthPolicy {
    fn from(value: ClientAuth) -> Self {
        match value {
            ClientAuth::None => Self::None,
            ClientAuth::RequestOnly => Self::RequestOnly,
            ClientAuth::RequireAndVerify => Self::RequireAndVerify,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "0.0.0.0:9002")]
    pub addr: std::net::SocketAddr,

    /// Server certificate chain (PEM).
    #[arg(long, default_value = "certs/server/server.pem")]
    pub cert: PathBuf,

    /// Server private key (PEM).
    #[arg(long, default_value = "certs/server/server.key")]
    pub key: PathBuf,

    /// CA bundle used to verify client certificates.
    #[arg(long, default_value = "certs/ca.pem")]
    pub ca: PathBuf,

    #[arg(long, value_enum, default_value = "require-and-verify")]
    client_auth: ClientAuth,

    /// Seconds in-flight calls get to finish on Ctrl-C.
    #[arg(long, default_value = "5")]
    pub grace_secs: u64,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> mtrpc::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let security = build_server_security(
        &args.cert,
        &args.key,
        Some(&args.ca),
        args.client_auth.into(),
    )?;

    let mut router = Router::default();
    mtrpc_demo::register(&mut router)?;
    let chain = InterceptorChain::new()
        .with(RecoveryInterceptor)
        .with(LoggingInterceptor);
    let config = ServerConfig {
        grace_period: Duration::from_secs(args.grace_secs),
        ..Default::default()
    };
    let server = Server::create(router, &chain, &config);

    let addr = server.listen(args.addr, &security).await?;
    tracing::info!("serving on {addr}, press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to wait for Ctrl-C: {e}");
    }
    tracing::info!("stopping, grace period {:?}", config.grace_period);
    server.stop(config.grace_period).await;
    server.join().await;
    Ok(())
}
