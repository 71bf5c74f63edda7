//! Simulated driver services for one device

use super::discovery::SimDiscoveryDevice;
use super::library::SimCounterLibrary;
use super::ip_sampling::SimIpSamplingOs;
use super::source::{MockMetricSource, MockSourceOptions};
use super::SimControls;
use crate::device::{Device, DeviceServices, GraphicsAllocation};
use crate::discovery::MetricsDiscoveryDevice;
use crate::hw::HardwareGeneration;
use crate::library::api::CounterLibraryApi;
use crate::source::ip_sampling::IpSamplingOsInterface;
use crate::source::MetricSource;
use lzmetrics_shared::{MetricsError, Result};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;

const GPU_VA_BASE: u64 = 0x1_0000_0000;

/// What a simulated device carries besides its OA hardware
#[derive(Debug, Clone)]
pub struct SimServicesSetup {
    pub generation: HardwareGeneration,
    pub counter_library: bool,
    pub discovery: bool,
    /// Stall sampling unit and whether its kernel driver support is present
    pub ip_sampling: Option<bool>,
    pub mock_sources: Vec<MockSourceOptions>,
}

pub struct SimDeviceServices {
    name: String,
    sub_device: Option<u32>,
    controls: Arc<SimControls>,
    discovery: Option<Arc<SimDiscoveryDevice>>,
    library: Option<Arc<SimCounterLibrary>>,
    ip_sampling: Option<Arc<SimIpSamplingOs>>,
    mock_sources: Vec<MockSourceOptions>,
    created_sources: Mutex<Vec<Arc<MockMetricSource>>>,
    next_address: AtomicU64,
    live_allocations: AtomicU32,
    cache_flushes: AtomicU32,
}

impl SimDeviceServices {
    pub fn new(name: String, sub_device: Option<u32>, controls: Arc<SimControls>, setup: SimServicesSetup) -> Self {
        let discovery = setup.discovery.then(|| {
            Arc::new(SimDiscoveryDevice::new(
                controls.clone(),
                setup.generation,
                sub_device.unwrap_or(0),
            ))
        });
        let library = setup
            .counter_library
            .then(|| Arc::new(SimCounterLibrary::new(controls.clone())));

        Self {
            name,
            sub_device,
            controls,
            discovery,
            library,
            ip_sampling: setup.ip_sampling.map(|available| Arc::new(SimIpSamplingOs::new(available))),
            mock_sources: setup.mock_sources,
            created_sources: Mutex::new(Vec::new()),
            next_address: AtomicU64::new(GPU_VA_BASE),
            live_allocations: AtomicU32::new(0),
            cache_flushes: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn discovery(&self) -> Option<&Arc<SimDiscoveryDevice>> {
        self.discovery.as_ref()
    }

    pub fn library(&self) -> Option<&Arc<SimCounterLibrary>> {
        self.library.as_ref()
    }

    pub fn ip_sampling(&self) -> Option<&Arc<SimIpSamplingOs>> {
        self.ip_sampling.as_ref()
    }

    /// Mock sources handed to the device, in registration order
    pub fn mock_sources(&self) -> Vec<Arc<MockMetricSource>> {
        self.created_sources.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn cache_flushes(&self) -> u32 {
        self.cache_flushes.load(Ordering::SeqCst)
    }

    pub fn live_allocations(&self) -> u32 {
        self.live_allocations.load(Ordering::SeqCst)
    }
}

impl DeviceServices for SimDeviceServices {
    fn os_handle(&self) -> Option<i32> {
        if SimControls::on(&self.controls.invalid_os_handle) {
            return Some(-1);
        }
        Some(3 + self.sub_device.map(|i| i as i32 + 1).unwrap_or(0))
    }

    fn has_async_compute(&self) -> bool {
        true
    }

    fn uses_compute_engine(&self) -> bool {
        true
    }

    fn allocate_graphics_memory(&self, size: usize) -> Result<GraphicsAllocation> {
        if size == 0 {
            return Err(MetricsError::invalid_argument("zero-sized graphics allocation"));
        }
        let aligned = (size as u64 + 0xFFF) & !0xFFF;
        let gpu_address = self.next_address.fetch_add(aligned, Ordering::SeqCst);
        self.live_allocations.fetch_add(1, Ordering::SeqCst);
        trace!(device = %self.name, size, gpu_address, "graphics memory allocated");
        Ok(GraphicsAllocation {
            id: gpu_address,
            gpu_address,
            size,
        })
    }

    fn free_graphics_memory(&self, allocation: &GraphicsAllocation) {
        trace!(device = %self.name, id = allocation.id, "graphics memory freed");
        self.live_allocations.fetch_sub(1, Ordering::SeqCst);
    }

    fn notify_instruction_cache_flush(&self) {
        self.cache_flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn metrics_discovery(&self) -> Option<Arc<dyn MetricsDiscoveryDevice>> {
        self.discovery
            .clone()
            .map(|d| d as Arc<dyn MetricsDiscoveryDevice>)
    }

    fn counter_library(&self) -> Option<Arc<dyn CounterLibraryApi>> {
        self.library.clone().map(|l| l as Arc<dyn CounterLibraryApi>)
    }

    fn ip_sampling_os(&self) -> Option<Arc<dyn IpSamplingOsInterface>> {
        self.ip_sampling
            .clone()
            .map(|os| os as Arc<dyn IpSamplingOsInterface>)
    }

    fn additional_metric_sources(&self, device: &Weak<Device>) -> Vec<Arc<dyn MetricSource>> {
        let mut created = self.created_sources.lock().unwrap_or_else(|e| e.into_inner());
        self.mock_sources
            .iter()
            .map(|options| {
                let source = MockMetricSource::new(device, *options);
                created.push(source.clone());
                source as Arc<dyn MetricSource>
            })
            .collect()
    }
}
