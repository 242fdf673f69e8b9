//! Standalone host serving the demo resources over HTTP and WebSocket.
//!
//! Prints `HOST_PORT=<port>` on stdout once bound so a parent process can
//! connect its child sessions.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use hostlink_host::demo;
use hostlink_host::network::{NetworkConfig, NetworkModule};
use hostlink_host::service::{HostConfig, RetentionConfig};
use hostlink_host::HostBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "test-server")]
#[command(about = "hostlink host serving the demo scene resources")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0", env = "HOSTLINK_PORT")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1", env = "HOSTLINK_HOST")]
    host: String,

    /// Maximum concurrent requests before load shedding
    #[arg(long, default_value = "1000")]
    max_concurrent: u32,

    /// Compaction interval in milliseconds
    #[arg(long, default_value = "60000")]
    compaction_interval_ms: u64,

    /// Mutations always kept in the log
    #[arg(long, default_value = "1024")]
    min_retained: u64,

    /// Mutations kept before lagging sessions are forced onto snapshots
    #[arg(long, default_value = "65536")]
    max_retained: u64,

    /// Seconds to wait for sessions to drain on shutdown
    #[arg(long, default_value = "10")]
    drain_timeout_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "HOSTLINK_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = HostConfig {
        max_concurrent_requests: args.max_concurrent,
        compaction_interval_ms: args.compaction_interval_ms,
        retention: RetentionConfig {
            min_retained: args.min_retained,
            max_retained: args.max_retained,
        },
        ..HostConfig::default()
    };
    let host = demo::register(HostBuilder::new(demo::blueprint()))
        .config(config)
        .build();
    host.start_compaction().await;

    let network = NetworkConfig {
        host: args.host,
        port: args.port,
        drain_timeout: Duration::from_secs(args.drain_timeout_secs),
        ..NetworkConfig::default()
    };
    let mut module = NetworkModule::new(network, host.clone());
    let port = module.start().await?;

    // Read by the parent process; keep the format stable.
    println!("HOST_PORT={port}");
    info!(port, "host ready");

    module
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    host.shutdown().await
}
