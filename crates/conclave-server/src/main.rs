//! Conclave server binary.
//!
//! # Usage
//!
//! ```bash
//! # Development: self-signed certificate, local database
//! conclave-server --bind 127.0.0.1:4430 --database-url postgres://localhost/conclave
//!
//! # Production
//! conclave-server --bind 0.0.0.0:443 --cert cert.pem --key key.pem \
//!     --database-url postgres://conclave@db/conclave --store-root /var/cache/conclave
//! ```

use std::path::PathBuf;

use clap::Parser;
use conclave_server::{ServerConfig, backend::PgBackend, dispatch::Server};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Conclave collaboration daemon
#[derive(Parser, Debug)]
#[command(name = "conclave-server")]
#[command(about = "Multi-tenant collaboration daemon")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:443")]
    bind: String,

    /// Path to the TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<PathBuf>,

    /// Path to the TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Database connection URL
    #[arg(long, default_value = "postgres://localhost/conclave")]
    database_url: String,

    /// Root of the file storage area
    #[arg(long, default_value = "/var/cache/conclave/store")]
    store_root: PathBuf,

    /// Host name advertised in web links
    #[arg(long, default_value = "localhost")]
    web_host: String,

    /// Local port of the web front-end
    #[arg(long, default_value = "80")]
    web_port: u16,

    /// Local port of the peer service
    #[arg(long, default_value = "5000")]
    peer_port: u16,

    /// File holding the administrator secret
    #[arg(long, default_value = "/etc/conclave/admin_secret")]
    admin_secret: PathBuf,

    /// Ticket time-to-live in seconds
    #[arg(long, default_value = "300")]
    ticket_ttl: u64,

    /// Signing key ids trusted daemon-wide
    #[arg(long = "trusted-key")]
    trusted_keys: Vec<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("conclave server starting");

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("no TLS certificate provided - using a self-signed certificate");
    }

    let config = ServerConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        database_url: args.database_url.clone(),
        store_root: args.store_root,
        web_host: args.web_host,
        web_port: args.web_port,
        peer_port: args.peer_port,
        admin_secret_path: args.admin_secret,
        ticket_ttl_secs: args.ticket_ttl,
        trusted_key_ids: args.trusted_keys,
        ..ServerConfig::default()
    };

    let backend = PgBackend::connect(&args.database_url).await?;
    let server = Server::bind(config, backend).await?;

    tracing::info!("server listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}
