//! Process-wide driver state
//!
//! `init` builds the device list once per process and returns the cached
//! list on later calls. A forked child sees a different pid and rebuilds.
//! `teardown` drops everything and is meant to run once at unload.

use crate::config::MetricsConfig;
use crate::device::Device;
use anyhow::{Context as _, Result};
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// Produces the device trees of one platform
pub trait Platform: Send + Sync {
    fn create_devices(&self, config: &MetricsConfig) -> Result<Vec<Arc<Device>>>;
}

struct DriverState {
    pid: u32,
    config: MetricsConfig,
    devices: Vec<Arc<Device>>,
}

static DRIVER: Lazy<Mutex<Option<DriverState>>> = Lazy::new(|| Mutex::new(None));

fn driver() -> MutexGuard<'static, Option<DriverState>> {
    DRIVER.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn init(platform: &dyn Platform, config: MetricsConfig) -> Result<Vec<Arc<Device>>> {
    config.validate()?;
    let pid = std::process::id();

    let mut state = driver();
    if let Some(existing) = state.as_ref() {
        if existing.pid == pid {
            return Ok(existing.devices.clone());
        }
        info!(old_pid = existing.pid, pid, "process changed, reinitialising driver");
    }

    let devices = platform
        .create_devices(&config)
        .context("Failed to create devices")?;

    if config.enable_metrics {
        for device in &devices {
            if let Err(e) = device.metric_context().enable_metrics() {
                warn!(device = device.name(), error = %e, "metrics not enabled at init");
            }
        }
    }

    info!(
        devices = devices.len(),
        library = %config.library_name,
        discovery = %config.discovery_name,
        "driver initialised"
    );
    *state = Some(DriverState {
        pid,
        config,
        devices: devices.clone(),
    });
    Ok(devices)
}

pub fn is_initialized() -> bool {
    driver().is_some()
}

pub fn devices() -> Vec<Arc<Device>> {
    driver().as_ref().map(|s| s.devices.clone()).unwrap_or_default()
}

pub fn config() -> Option<MetricsConfig> {
    driver().as_ref().map(|s| s.config.clone())
}

pub fn teardown() {
    if let Some(state) = driver().take() {
        info!(devices = state.devices.len(), "driver torn down");
    }
}

/// A set of devices API calls may address
#[derive(Debug, Clone, Default)]
pub struct Context {
    devices: Vec<Arc<Device>>,
}

impl Context {
    pub fn new(devices: Vec<Arc<Device>>) -> Self {
        Self { devices }
    }

    /// Context over every device of the initialised driver
    pub fn from_driver() -> Self {
        Self::new(devices())
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// `device` is one of the context's devices or one of their subdevices
    pub fn contains(&self, device: &Arc<Device>) -> bool {
        self.devices.iter().any(|d| {
            Arc::ptr_eq(d, device) || d.sub_devices().iter().any(|sub| Arc::ptr_eq(sub, device))
        })
    }
}
