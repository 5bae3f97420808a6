use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Writes a test CA plus server and client identities.", long_about = None)]
pub struct Args {
    /// Output directory.
    #[arg(default_value = "certs")]
    pub dir: PathBuf,

    /// Names the server certificate is valid for.
    #[arg(long, default_values_t = ["localhost".to_string(), "127.0.0.1".to_string()])]
    pub server_name: Vec<String>,
}

fn main() -> mtrpc::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let names: Vec<&str> = args.server_name.iter().map(String::as_str).collect();
    let pki = mtrpc_demo::certs::generate(&names)?;
    pki.write_to(&args.dir)?;
    tracing::info!("wrote test certificates to {}", args.dir.display());
    Ok(())
}
