use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Command line for the broker binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "tokenbroker", version, about = "Streaming LLM request broker")]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short = 'c', long, env = "BROKER_CONFIG", default_value = "config.json")]
    pub config: PathBuf,

    /// Socket address the HTTP server listens on.
    #[arg(short = 'l', long, env = "BROKER_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,
}
