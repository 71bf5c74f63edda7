//! Device tree and the services the metrics engine consumes from the driver
//!
//! A root device owns its subdevices; subdevices hold a weak link back to the
//! root. Every device owns one `MetricDeviceContext`. The tree is built once
//! by `DeviceBuilder` and never re-linked.

use crate::config::MetricsConfig;
use crate::context::MetricDeviceContext;
use crate::discovery::MetricsDiscoveryDevice;
use crate::hw::HardwareGeneration;
use crate::library::api::CounterLibraryApi;
use crate::source::ip_sampling::IpSamplingOsInterface;
use crate::source::MetricSource;
use lzmetrics_shared::Result;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

/// GPU-visible memory handed out by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsAllocation {
    pub id: u64,
    pub gpu_address: u64,
    pub size: usize,
}

/// Position of a device inside a flattened subdevice hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubDeviceHierarchy {
    pub index: u32,
    pub count: u32,
}

/// Driver-side services backing a device: OS handle, memory manager,
/// command-stream receiver and the two external metrics libraries
pub trait DeviceServices: Send + Sync {
    /// OS handle used to identify the device to the counter library
    fn os_handle(&self) -> Option<i32>;

    /// The device exposes an asynchronous compute engine
    fn has_async_compute(&self) -> bool;

    /// The default engine is a compute engine
    fn uses_compute_engine(&self) -> bool;

    fn sub_device_hierarchy(&self) -> Option<SubDeviceHierarchy> {
        None
    }

    fn allocate_graphics_memory(&self, size: usize) -> Result<GraphicsAllocation>;
    fn free_graphics_memory(&self, allocation: &GraphicsAllocation);

    /// Tell the command-stream receiver that cached instructions may reference
    /// a torn-down counter context and must be flushed before reuse
    fn notify_instruction_cache_flush(&self);

    fn metrics_discovery(&self) -> Option<Arc<dyn MetricsDiscoveryDevice>>;
    fn counter_library(&self) -> Option<Arc<dyn CounterLibraryApi>>;

    /// EU stall sampling unit of this device, if the OS exposes one
    fn ip_sampling_os(&self) -> Option<Arc<dyn IpSamplingOsInterface>> {
        None
    }

    /// Metric sources beyond the OA and stall sampling sources this device carries
    fn additional_metric_sources(&self, _device: &Weak<Device>) -> Vec<Arc<dyn MetricSource>> {
        Vec::new()
    }
}

pub struct Device {
    name: String,
    generation: HardwareGeneration,
    physical_sub_device_id: u32,
    is_sub_device: bool,
    sub_devices: Vec<Arc<Device>>,
    parent: OnceLock<Weak<Device>>,
    services: Arc<dyn DeviceServices>,
    metric_context: MetricDeviceContext,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("sub_device", &self.is_sub_device)
            .field("sub_devices", &self.sub_devices.len())
            .finish()
    }
}

impl Device {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> HardwareGeneration {
        self.generation
    }

    pub fn is_sub_device(&self) -> bool {
        self.is_sub_device
    }

    pub fn physical_sub_device_id(&self) -> u32 {
        self.physical_sub_device_id
    }

    pub fn sub_devices(&self) -> &[Arc<Device>] {
        &self.sub_devices
    }

    pub fn num_sub_devices(&self) -> u32 {
        self.sub_devices.len() as u32
    }

    pub fn parent(&self) -> Option<Arc<Device>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    /// Number of subdevices of the root this device belongs to
    pub fn root_num_sub_devices(&self) -> u32 {
        match self.parent() {
            Some(parent) => parent.num_sub_devices(),
            None => self.num_sub_devices(),
        }
    }

    pub fn services(&self) -> &Arc<dyn DeviceServices> {
        &self.services
    }

    pub fn metric_context(&self) -> &MetricDeviceContext {
        &self.metric_context
    }

    /// Commit activation requests that were deferred on this device
    pub fn activate_metric_groups(&self) -> Result<()> {
        self.metric_context.activate_already_deferred()
    }

    /// `other` is this device, one of its subdevices or its parent
    pub fn is_related(self: &Arc<Self>, other: &Arc<Device>) -> bool {
        if Arc::ptr_eq(self, other) {
            return true;
        }
        if self.sub_devices.iter().any(|sub| Arc::ptr_eq(sub, other)) {
            return true;
        }
        matches!(self.parent(), Some(parent) if Arc::ptr_eq(&parent, other))
    }
}

/// Builds a root device and its subdevices
pub struct DeviceBuilder {
    name: String,
    generation: HardwareGeneration,
    services: Arc<dyn DeviceServices>,
    sub_devices: Vec<Arc<dyn DeviceServices>>,
}

impl DeviceBuilder {
    pub fn new(
        name: impl Into<String>,
        generation: HardwareGeneration,
        services: Arc<dyn DeviceServices>,
    ) -> Self {
        Self {
            name: name.into(),
            generation,
            services,
            sub_devices: Vec::new(),
        }
    }

    pub fn sub_device(mut self, services: Arc<dyn DeviceServices>) -> Self {
        self.sub_devices.push(services);
        self
    }

    pub fn build(self, config: &MetricsConfig) -> Arc<Device> {
        let generation = self.generation;
        let sub_count = self.sub_devices.len();

        let sub_devices: Vec<Arc<Device>> = self
            .sub_devices
            .into_iter()
            .enumerate()
            .map(|(index, services)| {
                let name = format!("{}.{}", self.name, index);
                Arc::new_cyclic(|weak: &Weak<Device>| Device {
                    metric_context: MetricDeviceContext::new(
                        weak.clone(),
                        &services,
                        config,
                        false,
                        true,
                    ),
                    name,
                    generation,
                    physical_sub_device_id: index as u32,
                    is_sub_device: true,
                    sub_devices: Vec::new(),
                    parent: OnceLock::new(),
                    services,
                })
            })
            .collect();

        let implicit_scaling = config.implicit_scaling && sub_count > 1;
        let services = self.services;
        let root = Arc::new_cyclic(|weak: &Weak<Device>| Device {
            metric_context: MetricDeviceContext::new(weak.clone(), &services, config, implicit_scaling, false),
            name: self.name,
            generation,
            physical_sub_device_id: 0,
            is_sub_device: false,
            sub_devices,
            parent: OnceLock::new(),
            services,
        });

        for sub in root.sub_devices() {
            let _ = sub.parent.set(Arc::downgrade(&root));
        }

        root
    }
}
