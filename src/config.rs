use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// QUIC/HTTP3/WebTransport echo server.
#[derive(Debug, Parser)]
pub struct Args {
    /// Address to bind the UDP socket to.
    #[arg(long, default_value = "0.0.0.0:4433")]
    pub bind: SocketAddr,

    /// PEM certificate chain to use instead of the build-time embedded cert.
    #[arg(long, requires = "key")]
    pub cert: Option<PathBuf>,

    /// PEM private key to use instead of the build-time embedded key.
    #[arg(long, requires = "cert")]
    pub key: Option<PathBuf>,

    /// Idle timeout, in seconds, before an established connection is closed.
    #[arg(long, default_value_t = 30)]
    pub idle_timeout_secs: u64,

    /// Tracing filter passed to `EnvFilter`, e.g. "info" or "quic_echo_server=debug".
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }
}
