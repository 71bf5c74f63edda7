//! Software platform
//!
//! Plays the external collaborators of the engine: the hardware description
//! library, the counter-context library, the OS layer and command lists.
//! Every failure the engine must handle can be injected through
//! `SimControls`.

pub mod cmdlist;
pub mod device;
pub mod discovery;
pub mod ip_sampling;
pub mod library;
pub mod source;

use crate::config::MetricsConfig;
use crate::device::{Device, DeviceBuilder};
use crate::discovery::ApiVersion;
use crate::driver::Platform;
use crate::hw::HardwareGeneration;
use device::{SimDeviceServices, SimServicesSetup};
use source::MockSourceOptions;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Reports available per OA stream read unless overridden
pub const DEFAULT_STREAM_REPORTS: u32 = 10;

/// Failure injection and tuning shared by every simulated device of a platform
#[derive(Debug)]
pub struct SimControls {
    pub fail_io_open: AtomicBool,
    pub fail_io_read: AtomicBool,
    pub fail_io_close: AtomicBool,
    /// The next stream read reports lost data
    pub overflow_next_read: AtomicBool,
    pub fail_command_buffer: AtomicBool,
    pub fail_context_create: AtomicBool,
    pub fail_configuration_activate: AtomicBool,
    pub invalid_os_handle: AtomicBool,
    pub report_gpu_size_zero: AtomicBool,
    pub fail_metric_set_create: AtomicBool,
    short_metric_sets_on: Mutex<Option<u32>>,
    discovery_version: Mutex<ApiVersion>,
    oa_buffer_size: Mutex<Option<u32>>,
    stream_reports: Mutex<Vec<u32>>,
}

impl Default for SimControls {
    fn default() -> Self {
        Self {
            fail_io_open: AtomicBool::new(false),
            fail_io_read: AtomicBool::new(false),
            fail_io_close: AtomicBool::new(false),
            overflow_next_read: AtomicBool::new(false),
            fail_command_buffer: AtomicBool::new(false),
            fail_context_create: AtomicBool::new(false),
            fail_configuration_activate: AtomicBool::new(false),
            invalid_os_handle: AtomicBool::new(false),
            report_gpu_size_zero: AtomicBool::new(false),
            fail_metric_set_create: AtomicBool::new(false),
            short_metric_sets_on: Mutex::new(None),
            discovery_version: Mutex::new(ApiVersion { major: 1, minor: 13 }),
            oa_buffer_size: Mutex::new(None),
            stream_reports: Mutex::new(Vec::new()),
        }
    }
}

impl SimControls {
    /// Read an injection flag
    pub fn on(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }

    /// Flip an injection flag
    pub fn toggle(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }

    pub fn discovery_version(&self) -> ApiVersion {
        *self.discovery_version.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_discovery_version(&self, version: ApiVersion) {
        *self.discovery_version.lock().unwrap_or_else(|e| e.into_inner()) = version;
    }

    /// OA buffer size the OS reports back on stream open; `None` grants the request
    pub fn oa_buffer_size(&self) -> Option<u32> {
        *self.oa_buffer_size.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_oa_buffer_size(&self, size: Option<u32>) {
        *self.oa_buffer_size.lock().unwrap_or_else(|e| e.into_inner()) = size;
    }

    /// Subdevice whose created metric sets leave out the last requested symbol
    pub fn short_metric_sets_on(&self) -> Option<u32> {
        *self.short_metric_sets_on.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_short_metric_sets_on(&self, sub_device: Option<u32>) {
        *self.short_metric_sets_on.lock().unwrap_or_else(|e| e.into_inner()) = sub_device;
    }

    /// Reports each stream read can return, indexed by subdevice
    pub fn set_stream_reports(&self, per_sub_device: &[u32]) {
        *self.stream_reports.lock().unwrap_or_else(|e| e.into_inner()) = per_sub_device.to_vec();
    }

    pub fn stream_reports(&self, sub_device: u32) -> u32 {
        self.stream_reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(sub_device as usize)
            .copied()
            .unwrap_or(DEFAULT_STREAM_REPORTS)
    }
}

/// Builds simulated devices
pub struct SimPlatform {
    generation: HardwareGeneration,
    sub_devices: u32,
    counter_library: bool,
    discovery: bool,
    ip_sampling: Option<bool>,
    mock_sources: Vec<MockSourceOptions>,
    controls: Arc<SimControls>,
    services: Mutex<Vec<Arc<SimDeviceServices>>>,
}

impl SimPlatform {
    pub fn new(generation: HardwareGeneration) -> Self {
        Self {
            generation,
            sub_devices: 0,
            counter_library: true,
            discovery: true,
            ip_sampling: None,
            mock_sources: Vec::new(),
            controls: Arc::new(SimControls::default()),
            services: Mutex::new(Vec::new()),
        }
    }

    pub fn with_sub_devices(mut self, count: u32) -> Self {
        self.sub_devices = count;
        self
    }

    /// Register a mock source on every device
    pub fn with_mock_source(self, available: bool) -> Self {
        self.with_mock_source_options(MockSourceOptions {
            available,
            ..MockSourceOptions::default()
        })
    }

    pub fn with_mock_source_options(mut self, options: MockSourceOptions) -> Self {
        self.mock_sources.push(options);
        self
    }

    /// Give every device an EU stall sampling unit
    pub fn with_ip_sampling(mut self, available: bool) -> Self {
        self.ip_sampling = Some(available);
        self
    }

    pub fn without_counter_library(mut self) -> Self {
        self.counter_library = false;
        self
    }

    pub fn without_discovery(mut self) -> Self {
        self.discovery = false;
        self
    }

    pub fn controls(&self) -> &Arc<SimControls> {
        &self.controls
    }

    fn services(&self, name: String, sub_device: Option<u32>) -> Arc<SimDeviceServices> {
        let setup = SimServicesSetup {
            generation: self.generation,
            counter_library: self.counter_library,
            discovery: self.discovery,
            ip_sampling: self.ip_sampling,
            mock_sources: self.mock_sources.clone(),
        };
        let services = Arc::new(SimDeviceServices::new(name, sub_device, self.controls.clone(), setup));
        self.services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(services.clone());
        services
    }

    /// Services backing `device`
    pub fn services_for(&self, device: &Device) -> Option<Arc<SimDeviceServices>> {
        self.services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|s| s.name() == device.name())
            .cloned()
    }

    pub fn build(&self, config: &MetricsConfig) -> Arc<Device> {
        let name = format!("sim-{}", self.generation);
        let mut builder = DeviceBuilder::new(name.clone(), self.generation, self.services(name.clone(), None));
        for index in 0..self.sub_devices {
            builder = builder.sub_device(self.services(format!("{}.{}", name, index), Some(index)));
        }
        builder.build(config)
    }
}

impl Platform for SimPlatform {
    fn create_devices(&self, config: &MetricsConfig) -> anyhow::Result<Vec<Arc<Device>>> {
        Ok(vec![self.build(config)])
    }
}
