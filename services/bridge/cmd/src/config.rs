//! Configuration handling for the bridge service.
//!
//! This module reads the bridge section of the shared config file and
//! environment variable overrides into one [`BridgeConfig`].

use anyhow::Result;
use bridge_relay::RelayConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Bridge service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Local port the advertiser relay dials for every bridged stream
    pub service_port: u16,
    /// Time to wait for the peer to answer a stream (seconds)
    pub stream_timeout: u64,
    /// Maximum concurrent virtual sockets per browser relay
    pub max_virtual_sockets: usize,
    /// Bytes read from a peer stream at a time
    pub read_chunk_size: usize,
    /// Metrics reporting interval (seconds, 0 disables reporting)
    pub metrics_interval: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let relay = RelayConfig::default();
        Self {
            service_port: 8080,
            stream_timeout: relay.stream_timeout.as_secs(),
            max_virtual_sockets: relay.max_virtual_sockets,
            read_chunk_size: relay.read_chunk_size,
            metrics_interval: 30,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    bridge: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

impl BridgeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            if let Ok(root_config) = serde_yaml::from_str::<RootConfig>(&content) {
                config.apply_root_config(root_config);
                info!("Loaded configuration from {:?}", config_path.as_ref());
            } else {
                warn!("Failed to parse config file {:?}, using defaults", config_path.as_ref());
            }
        } else {
            warn!("Config file {:?} not found, using defaults", config_path.as_ref());
        }

        config.apply_environment_overrides();

        info!(
            "Final bridge configuration: service_port={}, stream_timeout={}s, max_virtual_sockets={}, read_chunk_size={}",
            config.service_port, config.stream_timeout, config.max_virtual_sockets, config.read_chunk_size
        );

        Ok(config)
    }

    /// Relay settings derived from this configuration
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            stream_timeout: Duration::from_secs(self.stream_timeout),
            max_virtual_sockets: self.max_virtual_sockets,
            read_chunk_size: self.read_chunk_size,
        }
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        if let Some(bridge) = root_config.services.and_then(|services| services.bridge) {
            self.apply_service_config(bridge);
        }
    }

    fn apply_service_config(&mut self, service_config: ServiceConfig) {
        if let Some(args) = service_config.args {
            for arg in args {
                if let Some(port) = arg.strip_prefix("--service-port=") {
                    if let Ok(port) = port.parse::<u16>() {
                        self.service_port = port;
                    }
                }
            }
        }

        if let Some(config_map) = service_config.config {
            for (key, value) in config_map {
                match key.as_str() {
                    "services.bridge.service_port" => {
                        if let Ok(port) = value.parse::<u16>() {
                            self.service_port = port;
                        }
                    }
                    "services.bridge.stream_timeout" => {
                        if let Ok(timeout) = value.parse::<u64>() {
                            self.stream_timeout = timeout;
                        }
                    }
                    "services.bridge.max_virtual_sockets" => {
                        if let Ok(max) = value.parse::<usize>() {
                            self.max_virtual_sockets = max;
                        }
                    }
                    "services.bridge.read_chunk_size" => {
                        if let Ok(size) = value.parse::<usize>() {
                            self.read_chunk_size = size;
                        }
                    }
                    "services.bridge.metrics_interval" => {
                        if let Ok(interval) = value.parse::<u64>() {
                            self.metrics_interval = interval;
                        }
                    }
                    _ => {
                        // Ignore unknown configuration keys
                    }
                }
            }
        }
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(service_port) = std::env::var("BRIDGE_SERVICE_PORT") {
            if let Ok(port) = service_port.parse::<u16>() {
                self.service_port = port;
                info!("Service port overridden by environment: {}", port);
            }
        }

        if let Ok(stream_timeout) = std::env::var("BRIDGE_STREAM_TIMEOUT_SECS") {
            if let Ok(timeout) = stream_timeout.parse::<u64>() {
                self.stream_timeout = timeout;
                info!("Stream timeout overridden by environment: {}s", timeout);
            }
        }

        if let Ok(max_virtual_sockets) = std::env::var("BRIDGE_MAX_VIRTUAL_SOCKETS") {
            if let Ok(max) = max_virtual_sockets.parse::<usize>() {
                self.max_virtual_sockets = max;
                info!("Max virtual sockets overridden by environment: {}", max);
            }
        }

        if let Ok(read_chunk_size) = std::env::var("BRIDGE_READ_CHUNK_SIZE") {
            if let Ok(size) = read_chunk_size.parse::<usize>() {
                self.read_chunk_size = size;
                info!("Read chunk size overridden by environment: {}", size);
            }
        }
    }
}
