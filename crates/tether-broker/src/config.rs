use crate::error::BrokerError;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tether::protocol::{LIVENESS_WINDOW, MAX_FRAME_BYTES};

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address the broker listens on.
    pub listen: SocketAddr,
    /// Silence after which a session is evicted.
    pub liveness_window_ms: u64,
    /// How often the management loop looks for silent sessions.
    pub sweep_interval_ms: u64,
    pub max_frame_bytes: usize,
    /// Whether ownership requests are granted right after `start`.
    pub accept_on_start: bool,
    /// Resource names to seed the in-memory registry with.
    pub resources: Vec<String>,
}

impl BrokerConfig {
    /// Load from a TOML file, falling back to defaults when it doesn't exist.
    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| BrokerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| BrokerError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 13000)),
            liveness_window_ms: LIVENESS_WINDOW.as_millis() as u64,
            sweep_interval_ms: 250,
            max_frame_bytes: MAX_FRAME_BYTES,
            accept_on_start: true,
            resources: Vec::new(),
        }
    }
}
