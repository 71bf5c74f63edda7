//! Metrics engine configuration

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics on every device at driver init
    pub enable_metrics: bool,

    /// Record activation requests and push them to hardware on the first GPU operation
    pub deferred_activation: bool,

    /// Root devices with several subdevices expose multi-device metric groups
    pub implicit_scaling: bool,

    /// Subdevice sources report workload-partitioned execution to the counter library
    pub workload_partition: bool,

    /// Allow more than one library configuration to stay cached per source
    pub configuration_caching: bool,

    /// Counter-context library name (reported in logs)
    pub library_name: String,

    /// Hardware-description library name (reported in logs)
    pub discovery_name: String,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|s| match s.trim() {
            "1" | "true" | "TRUE" | "on" => Some(true),
            "0" | "false" | "FALSE" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable_metrics: env_flag("ZET_ENABLE_METRICS", false),
            deferred_activation: env_flag("LZ_METRICS_DEFERRED_ACTIVATION", true),
            implicit_scaling: env_flag("LZ_METRICS_IMPLICIT_SCALING", true),
            workload_partition: env_flag("LZ_METRICS_WORKLOAD_PARTITION", false),
            configuration_caching: false,
            library_name: std::env::var("LZ_METRICS_LIBRARY")
                .unwrap_or_else(|_| "libigdml.so.1".to_string()),
            discovery_name: std::env::var("LZ_METRICS_DISCOVERY")
                .unwrap_or_else(|_| "libigdmd.so.1".to_string()),
        }
    }
}

impl MetricsConfig {
    /// Reject combinations the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.workload_partition && !self.implicit_scaling {
            bail!("workload_partition requires implicit_scaling");
        }
        if self.library_name.trim().is_empty() {
            bail!("library_name must not be empty");
        }
        if self.discovery_name.trim().is_empty() {
            bail!("discovery_name must not be empty");
        }
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: MetricsConfig = toml::from_str(s).context("parsing metrics config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&text)
    }
}
