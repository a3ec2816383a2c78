use std::net::SocketAddr;
use std::time::Duration;

use clap::Args;
use workshop::{RelayConfig, TrafficRelay};

use crate::cli::{GlobalFlags, init_stderr_logging};

#[derive(Args, Debug)]
pub struct RelayArgs {
    /// Address to accept connections on
    #[arg(long, default_value = "127.0.0.1:443")]
    pub listen: SocketAddr,

    /// Address every connection is forwarded to
    #[arg(long, default_value = "127.0.0.1:44452")]
    pub upstream: SocketAddr,

    /// Per-connection drain window on shutdown, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub drain_ms: u64,
}

pub async fn execute(args: RelayArgs, _global: &GlobalFlags) -> anyhow::Result<()> {
    init_stderr_logging();

    let relay = TrafficRelay::bind(RelayConfig {
        listen: args.listen,
        upstream: args.upstream,
        drain_grace: Duration::from_millis(args.drain_ms),
    })
    .await?;
    println!("{} -> {}", relay.local_addr(), relay.upstream());

    tokio::signal::ctrl_c().await?;

    let report = relay.shutdown().await?;
    println!(
        "relay closed: {} ended, {} destroyed",
        report.ended, report.destroyed
    );
    Ok(())
}
