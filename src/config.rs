//! Gateway configuration loaded from YAML.
//!
//! This config is intentionally small and focused on batching limits and safe defaults.

use std::{net::SocketAddr, path::PathBuf};

use serde::Deserialize;

fn default_max_inflight_batches() -> usize {
    256
}

fn default_max_subrequests() -> usize {
    32
}

fn default_batch_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize, Default)]
/// Allow/deny lists controlling which caller headers are forwarded into sub-requests.
///
/// An empty allow list means "forward everything not denied". Hop-by-hop headers are always
/// stripped regardless of this config.
pub struct ForwardHeadersConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
/// Top-level gateway configuration.
pub struct GatewayConfig {
    /// Address the gateway listens on (e.g. `127.0.0.1:3000`).
    pub listen_addr: SocketAddr,
    /// Path to the route table YAML file.
    pub routes_path: PathBuf,

    #[serde(default = "default_max_inflight_batches")]
    /// Maximum number of concurrently admitted batch requests. When saturated, `/batch` replies 429.
    pub max_inflight_batches: usize,

    #[serde(default = "default_max_subrequests")]
    /// Maximum number of labels accepted in one batch request.
    pub max_subrequests: usize,

    #[serde(default = "default_batch_timeout_ms")]
    /// Overall deadline for one batch. Outstanding sub-invocations are aborted when it elapses.
    pub batch_timeout_ms: u64,

    #[serde(default)]
    /// Which caller headers are copied into synthetic sub-requests.
    pub forward_headers: ForwardHeadersConfig,
}

impl GatewayConfig {
    /// Parse a YAML gateway config from bytes.
    pub fn from_yaml_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_slice(bytes)?)
    }
}
