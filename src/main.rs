use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use size::Size;

use crate::cache::{FsBlobStore, invalidation_channel};
use crate::config::Config;
use crate::speedtest::Speedtest;
use crate::transfer::PeerVerify;

mod cache;
mod config;
mod error;
mod feed;
mod geo;
mod meter;
mod speedtest;
mod transfer;
mod uri;

#[derive(Parser, Debug)]
#[command(name = "cellspeed")]
#[command(about = "Measures download and upload throughput against the nearest speedtest server")]
struct Args {
    /// Directory holding the cached server list
    #[arg(long, default_value = "cache")]
    cache_dir: PathBuf,

    /// PEM file with certificates trusted for HTTPS endpoints (repeatable)
    #[arg(long = "trust", value_name = "PEM")]
    trust: Vec<PathBuf>,

    /// Network interface the connections are bound to
    #[arg(long)]
    access_network: Option<String>,

    /// Host (and port) measured against when no server can be selected
    #[arg(long)]
    fallback_host: Option<String>,

    /// Erase the cached server list before the run
    #[arg(long)]
    invalidate_cache: bool,

    /// Prefer IPv6 addresses over IPv4
    #[arg(long)]
    ipv6: bool,

    #[arg(long)]
    config_url: Option<String>,

    #[arg(long)]
    servers_url: Option<String>,

    /// Download ceiling and upload size, in KiB
    #[arg(long, default_value_t = 50)]
    size_kib: u64,

    /// Accept any certificate from HTTPS endpoints
    #[arg(long)]
    no_verify: bool,

    /// Fragment buffer size in bytes, 0 for the default
    #[arg(long, default_value_t = 0)]
    fragment_size: usize,

    /// Resumptions allowed per download after a connection failure
    #[arg(long, default_value_t = 3)]
    max_retries: usize,

    /// Receive timeout in milliseconds
    #[arg(long, default_value_t = 4000)]
    receive_timeout_ms: u64,
}

impl Args {
    fn into_config(self) -> Config {
        let mut config = Config::new(self.cache_dir)
            .with_trust(self.trust)
            .with_access_network(self.access_network)
            .with_fallback_host(self.fallback_host)
            .with_prefer_ipv6(self.ipv6)
            .with_transfer_size(Size::from_kibibytes(self.size_kib))
            .with_max_retries(self.max_retries)
            .with_fragment_size(self.fragment_size)
            .with_receive_timeout(Duration::from_millis(self.receive_timeout_ms));
        if self.no_verify {
            config = config.with_peer_verify(PeerVerify::None);
        }
        if let Some(url) = self.config_url {
            config = config.with_config_url(url);
        }
        if let Some(url) = self.servers_url {
            config = config.with_servers_url(url);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let invalidate = args.invalidate_cache;
    let config = args.into_config();

    let (trigger, signal) = invalidation_channel();
    if invalidate {
        trigger.trigger();
    }
    info!("server list cache at {}", config.cache_path().display());
    let store = Arc::new(FsBlobStore::new(config.cache_dir.clone()));
    let mut speedtest = Speedtest::new(config, store, signal);

    info!("starting speedtest...");
    let result = speedtest.run().await;
    speedtest.shutdown().await;
    match result {
        Ok(report) => {
            println!("{report}");
            Ok(())
        }
        Err(err) => {
            match speedtest::error_code(&err) {
                Some(code) => error!("speedtest failed (error {code}): {err:#}"),
                None => error!("speedtest failed: {err:#}"),
            }
            Err(err)
        }
    }
}
