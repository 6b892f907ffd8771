//! # Nycast Agent
//!
//! Reconciles an anycast route across a set of cloud route tables toward
//! whichever NAT instance in a failover pair is currently healthy.
//!
//! ## Usage
//!
//! ```bash
//! nycast-agent --config-file /etc/nycast.yaml
//! nycast-agent --debug --oneshot
//! nycast-agent --noop
//! ```

mod cloud_http;
mod daemon;
mod metadata_http;
mod probes;

use clap::Parser;
use daemon::Daemon;

/// Command line arguments for the nycast agent.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML route-table configuration.
    #[arg(short = 'f', long = "config-file", default_value = "/etc/nycast.yaml")]
    config_file: String,

    /// Enable debug-level healthcheck logging.
    #[arg(long)]
    debug: bool,

    /// Run one reconciliation pass and exit instead of entering the poll loop.
    #[arg(long)]
    oneshot: bool,

    /// Log the route changes that would be made without making them.
    #[arg(long)]
    noop: bool,

    /// Log to syslog instead of stdout.
    ///
    /// Accepted for compatibility with the original CLI surface; wiring a
    /// real syslog backend is left to a tracing subscriber layer set up
    /// outside this process.
    #[arg(long)]
    syslog: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    if args.syslog {
        tracing::warn!("syslog logging is not implemented, use a syslog-aware tracing subscriber layer externally");
    }

    let mut daemon = Daemon::new(args.config_file, env!("CARGO_PKG_VERSION"), args.debug, args.noop, args.oneshot);
    let code = daemon.run().await;
    std::process::exit(code);
}
