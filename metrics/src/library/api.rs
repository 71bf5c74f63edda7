//! Interface of the counter-context library
//!
//! The library owns an opaque context per device, creates hardware-counter
//! queries and configurations inside it, and emits the GPU command fragments
//! that capture counter snapshots.

/// Status codes reported by the library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    Failed,
    IncorrectParameter,
    IncorrectObject,
    NotInitialized,
    /// The end snapshot of a query slot has not been written yet
    ReportNotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigurationHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    /// Size of a query report as returned to the API caller
    QueryHwCountersReportApiSize,
    /// Size of a query report slot in GPU memory
    QueryHwCountersReportGpuSize,
}

/// The four subdevice-related client options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubDeviceClientOptions {
    pub sub_device: bool,
    pub sub_device_index: u8,
    pub sub_device_count: u32,
    pub workload_partition: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientOptions {
    /// An asynchronous compute engine exists on the device
    pub compute_async: bool,
    /// Time-based sampling is in use
    pub tbs_enabled: bool,
    pub sub_device: SubDeviceClientOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextCreateData {
    pub client_gen: u32,
    /// OS handle identifying the device (a DRM file descriptor on Linux)
    pub os_handle: i32,
    pub options: ClientOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuCommandBufferType {
    Render,
    Compute,
}

/// Which fragment the library should emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferKind {
    QueryHwCounters { query: QueryHandle, slot: u32, begin: bool },
    Marker { value: u32 },
    /// Flush caches so counter snapshots are visible
    OverrideFlushCaches,
    /// Toggle null-hardware execution around measured work
    OverrideNullHardware { enable: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBufferRequest {
    pub context: ContextHandle,
    pub kind: CommandBufferKind,
    pub engine: GpuCommandBufferType,
    /// Report storage the fragment writes into, if any
    pub gpu_address: u64,
}

pub trait CounterLibraryApi: Send + Sync {
    fn context_create(&self, data: &ContextCreateData) -> Result<ContextHandle, StatusCode>;
    fn context_delete(&self, context: ContextHandle) -> StatusCode;

    fn get_parameter(&self, context: ContextHandle, parameter: ParameterType) -> Result<u32, StatusCode>;

    fn query_create(&self, context: ContextHandle, slots: u32) -> Result<QueryHandle, StatusCode>;
    fn query_delete(&self, query: QueryHandle) -> StatusCode;
    fn get_data(&self, query: QueryHandle, slot: u32, out: &mut [u8]) -> StatusCode;

    /// Create a configuration for the metric set currently activated in the kernel driver
    fn configuration_create(&self, context: ContextHandle) -> Result<ConfigurationHandle, StatusCode>;
    fn configuration_activate(&self, configuration: ConfigurationHandle) -> StatusCode;
    fn configuration_deactivate(&self, configuration: ConfigurationHandle) -> StatusCode;
    fn configuration_delete(&self, configuration: ConfigurationHandle) -> StatusCode;

    fn command_buffer_get_size(&self, request: &CommandBufferRequest) -> Result<u32, StatusCode>;
    fn command_buffer_get(&self, request: &CommandBufferRequest, out: &mut [u8]) -> StatusCode;
}
