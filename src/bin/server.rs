//! Smartproxy Server
//!
//! Terminates TLS from cooperating clients, checks the shared secret, and
//! relays each authenticated connection to the destination it names.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use smartproxy::{
    config::{generate_example_config, Config, LoggingConfig},
    transport::{bind_listener, build_acceptor},
    Server,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Smartproxy Server - TLS tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "smartproxy-server")]
#[command(about = "Smartproxy Server - authenticated TLS tunneling")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Shared password (at most 64 bytes)
    #[arg(short = 'w', long)]
    password: Option<String>,

    /// Listening port
    #[arg(short = 'p', long = "server_port")]
    server_port: Option<u16>,

    /// TLS certificate chain (PEM)
    #[arg(short = 'c', long)]
    cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(short = 'k', long = "private_key")]
    private_key: Option<PathBuf>,

    /// Log socket buffer sizes while relaying
    #[arg(long)]
    debug: bool,

    /// SO_SNDBUF for accepted sockets
    #[arg(long)]
    sndbuf: Option<u32>,

    /// SO_RCVBUF for the listening socket
    #[arg(long)]
    rcvbuf: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        let server = &mut config.server;
        if let Some(password) = self.password {
            server.password = password;
        }
        if let Some(port) = self.server_port {
            server.port = port;
        }
        if let Some(cert) = self.cert {
            server.cert = cert;
        }
        if let Some(private_key) = self.private_key {
            server.private_key = private_key;
        }
        if self.debug {
            server.debug = true;
        }
        if let Some(sndbuf) = self.sndbuf {
            server.send_buffer_size = sndbuf;
        }
        if let Some(rcvbuf) = self.rcvbuf {
            server.recv_buffer_size = rcvbuf;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&logging.level)
        .with_context(|| format!("Invalid log level: {}", logging.level))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format.as_str() {
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        "full" => builder.init(),
        other => return Err(anyhow!("Unknown log format: {}", other)),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to render example config")?;
        println!("{}", example);
        return Ok(());
    }

    // Load configuration, then let the command line override it
    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    args.apply(&mut config);

    init_logging(&config.logging)?;

    let server_config = config.server;
    server_config.validate().context("Invalid configuration")?;

    let acceptor = build_acceptor(&server_config.cert, &server_config.private_key)
        .context("Failed to set up TLS")?;
    info!("TLS enabled with cert: {}", server_config.cert.display());

    let listen_addr = server_config.listen_addr();
    let addr = tokio::net::lookup_host(&listen_addr)
        .await
        .with_context(|| format!("Failed to resolve listen address {}", listen_addr))?
        .next()
        .ok_or_else(|| anyhow!("No address for {}", listen_addr))?;
    let listener = bind_listener(addr, server_config.recv_buffer_size())
        .context("Failed to bind to address")?;

    let server = Arc::new(Server::new(&server_config).context("Failed to create server")?);

    info!("Running server v{}", smartproxy::VERSION);
    info!("Listening on {}", addr);
    let timeouts = server.timeouts();
    info!(
        "Timeouts: handshake {:?}, transfer {:?}, connect {:?}",
        timeouts.handshake, timeouts.transfer, timeouts.connect
    );
    if !server.connector().rejects_loopback() {
        warn!("Loopback destinations are allowed");
    }

    tokio::select! {
        _ = server.run(listener, acceptor) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
