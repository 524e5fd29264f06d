//! criproxy binary.
//!
//! Serves the CRI on one unix socket and forwards each call to the
//! container runtime owning the objects it names.

use clap::Parser;
use criproxy_core::{
    cli::{init_logging, run_proxy},
    config::{Args, ProxyConfig},
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ProxyConfig::load(&args)?;

    let _guard = init_logging(&config.logging, args.verbose)?;
    info!("criproxy {} starting up", env!("CARGO_PKG_VERSION"));

    run_proxy(config).await
}
