use std::{path::PathBuf, time::Duration};

use clap::Parser;
use mtrpc::{Client, ClientConfig, build_client_security};
use mtrpc_demo::{
    LIST, RECORD, ROUTE, SEARCH, SearchRequest, SearchResponse, StreamRequest, StreamResponse,
};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Server address.
    #[arg(default_value = "127.0.0.1:9002")]
    pub addr: std::net::SocketAddr,

    /// Client certificate chain (PEM). Omit to connect anonymously.
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Client private key (PEM).
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// CA bundle used to verify the server.
    #[arg(long, default_value = "certs/ca.pem")]
    pub ca: PathBuf,

    /// Name the server certificate must be valid for.
    #[arg(long, default_value = "localhost")]
    pub server_name: String,

    /// Use MessagePack
    #[arg(long, default_value_t = false)]
    pub use_msgpack: bool,

    /// Search request and stream point name.
    #[arg(short, long, default_value = "gRPC")]
    pub value: String,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> mtrpc::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let security = build_client_security(
        args.cert.as_deref(),
        args.key.as_deref(),
        &args.ca,
        &args.server_name,
    )?;
    let config = ClientConfig {
        use_msgpack: args.use_msgpack,
        ..Default::default()
    };
    let client = Client::connect(args.addr, &security, config).await?;

    let rsp: SearchResponse = client
        .unary(
            SEARCH,
            &SearchRequest {
                request: args.value.clone(),
            },
        )
        .await?;
    tracing::info!("search rsp: {}", rsp.response);

    let name = format!("{}: List", args.value);
    let mut list = client
        .server_stream::<_, StreamResponse>(LIST, &StreamRequest::new(name, 2018))
        .await?;
    while let Some(rsp) = list.recv().await? {
        tracing::info!("list rsp: {} {}", rsp.pt.name, rsp.pt.value);
    }

    let mut record = client
        .client_stream::<StreamRequest, StreamResponse>(RECORD)
        .await?;
    for value in 2018..=2024 {
        record
            .send(&StreamRequest::new(format!("{}: Record", args.value), value))
            .await?;
    }
    let rsp = record.close_and_recv().await?;
    tracing::info!("record rsp: {} {}", rsp.pt.name, rsp.pt.value);

    let mut route = client
        .bidi_stream::<StreamRequest, StreamResponse>(ROUTE)
        .await?;
    for value in 2018..2021 {
        route
            .send(&StreamRequest::new(format!("{}: Route", args.value), value))
            .await?;
        if let Some(rsp) = route.recv().await? {
            tracing::info!("route rsp: {} {}", rsp.pt.name, rsp.pt.value);
        }
    }
    route.close_send().await?;
    while let Some(rsp) = route.recv().await? {
        tracing::info!("route rsp: {} {}", rsp.pt.name, rsp.pt.value);
    }

    client.close(Duration::from_secs(1)).await;
    Ok(())
}
