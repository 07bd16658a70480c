//! Peer-to-peer TCP bridge binary.
//!
//! Runs both relay roles over an in-process session pair: local clients
//! connecting to the printed port are bridged, stream by stream, to the
//! service listening on the configured service port.

use anyhow::Context;
use bridge_relay::{AdvertiserRelay, BrowserRelay, RelayState};
use bridge_session::MemorySession;
use bridge_socket::{metrics, MetricsReporter};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;

use config::BridgeConfig;
use logging::BridgeLogFormatter;

/// Loopback bridge between local TCP clients and a local service
#[derive(Parser, Debug)]
#[command(name = "p2p-bridge", version, about = "Bridge local TCP over peer-to-peer streams")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Local service port the advertiser side dials
    #[arg(long)]
    service_port: Option<u16>,

    /// Time to wait for the peer to answer a stream, e.g. 5s
    #[arg(long)]
    stream_timeout: Option<humantime::Duration>,

    /// Maximum concurrent virtual sockets on the browser side
    #[arg(long)]
    max_virtual_sockets: Option<usize>,

    /// Metrics reporting interval, e.g. 30s (0s disables reporting)
    #[arg(long)]
    metrics_interval: Option<humantime::Duration>,

    /// Generation of the remote peer
    #[arg(long, default_value_t = 1)]
    generation: u64,
}

impl Args {
    /// Command line values win over the config file.
    fn apply_to(&self, config: &mut BridgeConfig) -> anyhow::Result<()> {
        if let Some(port) = self.service_port {
            config.service_port = port;
        }
        if let Some(timeout) = &self.stream_timeout {
            let secs = whole_seconds("--stream-timeout", **timeout)?;
            if secs == 0 {
                anyhow::bail!("--stream-timeout must be at least 1s");
            }
            config.stream_timeout = secs;
        }
        if let Some(max) = self.max_virtual_sockets {
            config.max_virtual_sockets = max;
        }
        if let Some(interval) = &self.metrics_interval {
            config.metrics_interval = whole_seconds("--metrics-interval", **interval)?;
        }
        Ok(())
    }
}

/// Config durations are kept in seconds; refuse anything finer.
fn whole_seconds(flag: &str, duration: Duration) -> anyhow::Result<u64> {
    if duration.subsec_nanos() != 0 {
        anyhow::bail!(
            "{} must be a whole number of seconds, got {}",
            flag,
            humantime::format_duration(duration)
        );
    }
    Ok(duration.as_secs())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("p2p_bridge={}", args.log_level).parse()?)
        .add_directive(format!("bridge_session={}", args.log_level).parse()?)
        .add_directive(format!("bridge_socket={}", args.log_level).parse()?)
        .add_directive(format!("bridge_relay={}", args.log_level).parse()?);

    let formatter = BridgeLogFormatter::new("bridge".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(formatter)
        .init();

    component_info!("main", "Starting p2p bridge v{}", env!("CARGO_PKG_VERSION"));

    let mut bridge_config = BridgeConfig::load_from_file(&args.config)?;
    args.apply_to(&mut bridge_config)?;
    if bridge_config.max_virtual_sockets == 0 {
        anyhow::bail!("max_virtual_sockets must be at least 1");
    }
    let relay_config = bridge_config.relay_config();

    let (browser_side, advertiser_side) = MemorySession::pair("browser", "advertiser");
    let advertiser = AdvertiserRelay::with_config(
        advertiser_side,
        bridge_config.service_port,
        relay_config.clone(),
    );
    let browser = BrowserRelay::with_config(browser_side, args.generation, relay_config);
    let port = browser
        .open_relay()
        .context("Failed to open the browser relay listener")?;

    component_info!(
        "main",
        "Bridging 127.0.0.1:{} -> 127.0.0.1:{} (generation {})",
        port,
        advertiser.client_port(),
        browser.generation()
    );
    println!("{}", port);

    let reporter = (bridge_config.metrics_interval > 0).then(|| {
        MetricsReporter::new(Duration::from_secs(bridge_config.metrics_interval))
            .start_collection_task()
    });

    let mut watchdog = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    component_error!("main", "Failed to listen for Ctrl-C: {}", e);
                }
                component_info!("main", "Received shutdown signal");
                break;
            }
            _ = watchdog.tick() => {
                if browser.state() == RelayState::Disconnecting
                    || advertiser.state() == RelayState::Disconnecting
                {
                    component_warn!("main", "Relay session ended, shutting down");
                    break;
                }
            }
        }
    }

    browser.close_relay();
    advertiser.close_relay();
    if let Some(reporter) = reporter {
        reporter.abort();
    }

    let snapshot = metrics().snapshot();
    component_info!(
        "main",
        "Bridge stopped: {} sockets opened, {} bytes to peer, {} bytes from peer",
        snapshot.sockets_opened,
        snapshot.bytes_to_peer,
        snapshot.bytes_from_peer
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "p2p-bridge",
            "--service-port",
            "9000",
            "--stream-timeout",
            "10s",
            "--metrics-interval",
            "0s",
        ]);
        let mut config = BridgeConfig::default();
        args.apply_to(&mut config).unwrap();

        assert_eq!(config.service_port, 9000);
        assert_eq!(config.stream_timeout, 10);
        assert_eq!(config.metrics_interval, 0);
        assert_eq!(config.max_virtual_sockets, 16);
    }

    #[test]
    fn test_fractional_durations_are_rejected() {
        for timeout in ["500ms", "1500ms", "0s"] {
            let args = Args::parse_from(["p2p-bridge", "--stream-timeout", timeout]);
            let mut config = BridgeConfig::default();
            assert!(args.apply_to(&mut config).is_err(), "accepted {}", timeout);
            assert_eq!(config.stream_timeout, 5);
        }

        let args = Args::parse_from(["p2p-bridge", "--metrics-interval", "2500ms"]);
        let mut config = BridgeConfig::default();
        assert!(args.apply_to(&mut config).is_err());
        assert_eq!(config.metrics_interval, 30);
    }
}
