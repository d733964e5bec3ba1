//! Timetable sync server.
//!
//! Serves `/sync/{schedule}` (binary CRDT sync) and `/presence` (JSON
//! presence) until interrupted.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;

use timetable_collab::{ServerConfig, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "timetable-server")]
#[command(about = "Real-time sync server for shared course schedules", version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "TIMETABLE_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Seconds an empty schedule session is kept before it is dropped
    #[arg(long, env = "TIMETABLE_IDLE_SECS", default_value_t = 60)]
    idle_secs: u64,

    /// Events buffered per connection before it has to resync
    #[arg(long, env = "TIMETABLE_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// Seconds between WebSocket pings
    #[arg(long, env = "TIMETABLE_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Largest inbound frame accepted, in bytes
    #[arg(long, env = "TIMETABLE_MAX_MESSAGE_BYTES", default_value_t = 1 << 20)]
    max_message_bytes: usize,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: args.bind,
            idle_timeout: Duration::from_secs(args.idle_secs),
            broadcast_capacity: args.broadcast_capacity,
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
            max_message_bytes: args.max_message_bytes,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    info!(
        "Starting timetable sync server on {} (idle timeout {:?})",
        config.bind_addr, config.idle_timeout
    );

    let server = Arc::new(SyncServer::new(config));
    let mut runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        result = &mut runner => result??,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, shutting down");
            server.shutdown();
            runner.await??;
        }
    }

    let stats = server.stats().await;
    info!(
        "Served {} connections, {} messages ({} dropped)",
        stats.total_connections, stats.total_messages, stats.dropped_messages
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults_match_config() {
        let args = Args::parse_from(["timetable-server"]);
        let config = ServerConfig::from(args);
        let default = ServerConfig::default();
        assert_eq!(config.bind_addr, default.bind_addr);
        assert_eq!(config.idle_timeout, default.idle_timeout);
        assert_eq!(config.broadcast_capacity, default.broadcast_capacity);
        assert_eq!(config.heartbeat_interval, default.heartbeat_interval);
        assert_eq!(config.max_message_bytes, default.max_message_bytes);
    }

    #[test]
    fn test_args_override() {
        let args = Args::parse_from([
            "timetable-server",
            "--bind",
            "0.0.0.0:8080",
            "--idle-secs",
            "5",
        ]);
        let config = ServerConfig::from(args);
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
    }
}
