use std::path::PathBuf;

use clap::Parser;
use log::info;
use scribe_collab::config::{ModelOptions, ServerConfig, Transport};
use scribe_collab::server::SyncServer;

#[derive(Parser, Debug)]
#[command(name = "scribe-server")]
#[command(about = "Collaborative text editing server")]
#[command(version)]
/// Command-line arguments.
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:6633")]
    bind: String,

    /// Speak WebSocket instead of length-prefixed frames
    #[arg(long)]
    websocket: bool,

    /// RocksDB directory; documents are kept in memory when omitted
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Recent ops kept in memory per document
    #[arg(long, default_value_t = ModelOptions::default().num_cached_ops)]
    cached_ops: usize,

    /// How many versions behind an op's base may be
    #[arg(long, default_value_t = ModelOptions::default().maximum_age)]
    maximum_age: u64,

    /// Ops applied between snapshot writes
    #[arg(long, default_value_t = ModelOptions::default().ops_before_commit)]
    ops_before_commit: u64,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            transport: if self.websocket {
                Transport::WebSocket
            } else {
                Transport::Framed
            },
            storage_path: self.data_dir,
            model: ModelOptions {
                num_cached_ops: self.cached_ops,
                ops_before_commit: self.ops_before_commit,
                maximum_age: self.maximum_age,
            },
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config();
    info!("Starting scribe server with {config:?}");

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Could not open storage: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    let written = server.model().flush().await;
    info!("Committed {written} snapshots");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Cli::parse_from(["scribe-server"]).into_config();
        assert_eq!(config.bind_addr, "127.0.0.1:6633");
        assert_eq!(config.transport, Transport::Framed);
        assert!(config.storage_path.is_none());
        assert_eq!(config.model, ModelOptions::default());
    }

    #[test]
    fn test_flags() {
        let config = Cli::parse_from([
            "scribe-server",
            "--bind",
            "0.0.0.0:9000",
            "--websocket",
            "--data-dir",
            "/var/lib/scribe",
            "--cached-ops",
            "50",
            "--maximum-age",
            "100",
            "--ops-before-commit",
            "10",
        ])
        .into_config();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.transport, Transport::WebSocket);
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/scribe")));
        assert_eq!(config.model.num_cached_ops, 50);
        assert_eq!(config.model.maximum_age, 100);
        assert_eq!(config.model.ops_before_commit, 10);
    }
}
