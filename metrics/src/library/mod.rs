//! Adapter over the counter-context library
//!
//! One `MetricsLibrary` belongs to one OA source and lives inside that
//! source's lock. The context is created lazily on first use and released
//! when the last pool using it is gone and no configuration is active.

pub mod api;

use crate::device::Device;
use crate::discovery::MetricSet;
use crate::group::GroupId;
use crate::telemetry;
use api::{
    ClientOptions, CommandBufferKind, CommandBufferRequest, ConfigurationHandle, ContextCreateData,
    ContextHandle, CounterLibraryApi, GpuCommandBufferType, ParameterType, QueryHandle, StatusCode,
    SubDeviceClientOptions,
};
use lzmetrics_shared::ResultCode;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the library needs to know about its surroundings to create a context
pub struct LibraryEnv<'a> {
    pub device: &'a Device,
    /// The hardware description was enumerated successfully
    pub enumeration_ready: bool,
    /// A streamer is open on the owning source
    pub tbs_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    Uninitialized,
    Ready(ContextHandle),
    Failed,
}

pub struct MetricsLibrary {
    api: Option<Arc<dyn CounterLibraryApi>>,
    state: InitState,
    queries: Vec<QueryHandle>,
    configurations: Vec<(GroupId, ConfigurationHandle)>,
    configuration_caching: bool,
    workload_partition: bool,
}

impl MetricsLibrary {
    pub fn new(api: Option<Arc<dyn CounterLibraryApi>>, configuration_caching: bool) -> Self {
        Self {
            api,
            state: InitState::Uninitialized,
            queries: Vec::new(),
            configurations: Vec::new(),
            configuration_caching,
            workload_partition: false,
        }
    }

    /// The library binary could be loaded
    pub fn is_loaded(&self) -> bool {
        self.api.is_some()
    }

    pub fn initialization_state(&self) -> ResultCode {
        match self.state {
            InitState::Uninitialized => ResultCode::ErrorUninitialized,
            InitState::Ready(_) => ResultCode::Success,
            InitState::Failed => ResultCode::ErrorUnknown,
        }
    }

    /// Initialize once; later calls report the outcome of the first attempt
    pub fn is_initialized(&mut self, env: &LibraryEnv<'_>) -> bool {
        if self.state == InitState::Uninitialized {
            self.initialize(env);
        }
        matches!(self.state, InitState::Ready(_))
    }

    fn initialize(&mut self, env: &LibraryEnv<'_>) {
        let context = if env.enumeration_ready {
            self.create_context(env)
        } else {
            debug!(device = env.device.name(), "hardware description not ready, library not initialized");
            None
        };

        self.state = match context {
            Some(context) => {
                telemetry::LIBRARY_CONTEXTS_CREATED.inc();
                info!(device = env.device.name(), context = context.0, "counter library context created");
                InitState::Ready(context)
            }
            None => InitState::Failed,
        };
    }

    fn create_context(&self, env: &LibraryEnv<'_>) -> Option<ContextHandle> {
        let api = self.api.as_ref()?;
        let data = self.context_data(env)?;
        match api.context_create(&data) {
            Ok(context) => Some(context),
            Err(status) => {
                warn!(device = env.device.name(), ?status, "counter library context creation failed");
                None
            }
        }
    }

    /// Client data for context creation; `None` when the OS handle is invalid
    pub fn context_data(&self, env: &LibraryEnv<'_>) -> Option<ContextCreateData> {
        let services = env.device.services();
        let os_handle = services.os_handle().filter(|fd| *fd >= 0)?;
        Some(ContextCreateData {
            client_gen: env.device.generation().metrics_library_gen_id(),
            os_handle,
            options: ClientOptions {
                compute_async: services.has_async_compute(),
                tbs_enabled: env.tbs_enabled,
                sub_device: self.sub_device_client_options(env.device),
            },
        })
    }

    pub fn sub_device_client_options(&self, device: &Device) -> SubDeviceClientOptions {
        let hierarchy = device.services().sub_device_hierarchy();
        let is_sub_device = device.is_sub_device() || hierarchy.is_some();
        let root_count = device.root_num_sub_devices().max(1);

        if !is_sub_device {
            return SubDeviceClientOptions {
                sub_device: false,
                sub_device_index: device.physical_sub_device_id() as u8,
                sub_device_count: root_count,
                workload_partition: false,
            };
        }

        match hierarchy {
            Some(h) => SubDeviceClientOptions {
                sub_device: true,
                sub_device_index: h.index as u8,
                sub_device_count: h.count,
                workload_partition: self.workload_partition,
            },
            None => SubDeviceClientOptions {
                sub_device: true,
                sub_device_index: device.physical_sub_device_id() as u8,
                sub_device_count: root_count,
                workload_partition: self.workload_partition,
            },
        }
    }

    /// Survives `release`
    pub fn enable_workload_partition(&mut self) {
        self.workload_partition = true;
    }

    pub fn is_workload_partition_enabled(&self) -> bool {
        self.workload_partition
    }

    fn ready(&mut self, env: &LibraryEnv<'_>) -> Option<(Arc<dyn CounterLibraryApi>, ContextHandle)> {
        if !self.is_initialized(env) {
            return None;
        }
        match (&self.api, self.state) {
            (Some(api), InitState::Ready(context)) => Some((api.clone(), context)),
            _ => None,
        }
    }

    /// Size of one query slot in GPU memory; 0 when unavailable
    pub fn query_report_gpu_size(&mut self, env: &LibraryEnv<'_>) -> u32 {
        let Some((api, context)) = self.ready(env) else {
            return 0;
        };
        api.get_parameter(context, ParameterType::QueryHwCountersReportGpuSize)
            .unwrap_or(0)
    }

    /// Size of one query report as returned to callers
    pub fn query_report_api_size(&mut self, env: &LibraryEnv<'_>) -> Option<u32> {
        let (api, context) = self.ready(env)?;
        api.get_parameter(context, ParameterType::QueryHwCountersReportApiSize)
            .ok()
            .filter(|size| *size > 0)
    }

    pub fn create_query(&mut self, env: &LibraryEnv<'_>, slots: u32) -> Option<QueryHandle> {
        let (api, context) = self.ready(env)?;
        match api.query_create(context, slots) {
            Ok(query) => {
                self.queries.push(query);
                Some(query)
            }
            Err(status) => {
                warn!(?status, slots, "library query creation failed");
                None
            }
        }
    }

    pub fn destroy_query(&mut self, query: QueryHandle) -> bool {
        let deleted = match (&self.api, self.state) {
            (Some(api), InitState::Ready(_)) => api.query_delete(query) == StatusCode::Success,
            _ => false,
        };
        self.queries.retain(|q| *q != query);
        deleted
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    pub fn query_report(
        &mut self,
        env: &LibraryEnv<'_>,
        query: QueryHandle,
        slot: u32,
        out: &mut [u8],
    ) -> StatusCode {
        match self.ready(env) {
            Some((api, _)) => api.get_data(query, slot, out),
            None => StatusCode::NotInitialized,
        }
    }

    /// Produce a GPU command fragment; `None` if the library cannot
    pub fn gpu_commands(
        &mut self,
        env: &LibraryEnv<'_>,
        kind: CommandBufferKind,
        engine: GpuCommandBufferType,
        gpu_address: u64,
    ) -> Option<Vec<u8>> {
        let (api, context) = self.ready(env)?;
        let request = CommandBufferRequest {
            context,
            kind,
            engine,
            gpu_address,
        };

        let size = api.command_buffer_get_size(&request).unwrap_or(0);
        if size == 0 {
            warn!(?kind, "library reported no command buffer size");
            return None;
        }

        let mut buffer = vec![0u8; size as usize];
        (api.command_buffer_get(&request, &mut buffer) == StatusCode::Success).then_some(buffer)
    }

    /// Cached configuration for a group, created on first use
    pub fn configuration(
        &mut self,
        env: &LibraryEnv<'_>,
        group: GroupId,
        metric_set: &dyn MetricSet,
    ) -> Option<ConfigurationHandle> {
        if let Some(handle) = self.cached_configuration(group) {
            return Some(handle);
        }

        let (api, context) = self.ready(env)?;
        if !metric_set.activate().is_ok() {
            warn!(?group, "metric set activation in kernel driver failed");
            return None;
        }
        let created = api.configuration_create(context);
        metric_set.deactivate();

        let handle = created.ok()?;
        self.cache_configuration(group, handle);
        Some(handle)
    }

    /// Configuration already cached for `group`
    pub fn cached_configuration(&self, group: GroupId) -> Option<ConfigurationHandle> {
        self.configurations
            .iter()
            .find(|(g, _)| *g == group)
            .map(|(_, handle)| *handle)
    }

    /// Without configuration caching only one configuration stays cached
    fn cache_configuration(&mut self, group: GroupId, handle: ConfigurationHandle) {
        if !self.configuration_caching {
            self.delete_all_configurations();
        }
        self.configurations.push((group, handle));
    }

    pub fn activate_configuration(&mut self, handle: ConfigurationHandle) -> bool {
        match self.cached_api(handle) {
            Some(api) => api.configuration_activate(handle) == StatusCode::Success,
            None => false,
        }
    }

    pub fn deactivate_configuration(&mut self, handle: ConfigurationHandle) -> bool {
        match self.cached_api(handle) {
            Some(api) => api.configuration_deactivate(handle) == StatusCode::Success,
            None => false,
        }
    }

    fn cached_api(&self, handle: ConfigurationHandle) -> Option<Arc<dyn CounterLibraryApi>> {
        if !matches!(self.state, InitState::Ready(_)) {
            return None;
        }
        if !self.configurations.iter().any(|(_, h)| *h == handle) {
            return None;
        }
        self.api.clone()
    }

    fn delete_all_configurations(&mut self) {
        if let Some(api) = &self.api {
            for (_, handle) in self.configurations.drain(..) {
                api.configuration_delete(handle);
            }
        }
        self.configurations.clear();
    }

    /// Delete configurations and the context; returns whether a context existed
    pub fn release(&mut self) -> bool {
        self.delete_all_configurations();

        let released = match (&self.api, self.state) {
            (Some(api), InitState::Ready(context)) => {
                api.context_delete(context);
                true
            }
            _ => false,
        };
        // A failed first attempt stays failed
        if released {
            telemetry::LIBRARY_CONTEXTS_RELEASED.inc();
            info!("counter library context released");
            self.state = InitState::Uninitialized;
        }
        released
    }
}
