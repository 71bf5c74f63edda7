//! Interface of the hardware-description library
//!
//! The library describes the counter hardware of a device: concurrent groups,
//! the metric sets they contain and the metrics in each set. It also owns the
//! OA I/O stream used by streamers and decodes raw reports into values. The
//! engine only consumes this interface; `sim` provides a software version.

use lzmetrics_shared::TypedValue;
use std::sync::Arc;

/// API masks a metric set can be filtered by
pub mod api_mask {
    pub const OGL: u32 = 0x0000_0001;
    pub const OCL: u32 = 0x0000_0002;
    pub const OGL4_X: u32 = 0x0000_0040;
    pub const IOSTREAM: u32 = 0x0000_8000;
    pub const ALL: u32 = 0xFFFF_FFFF;
}

/// Usage flags carried by metric params
pub mod usage_flag {
    pub const TIER_1: u32 = 0x0000_0400;
    pub const TIER_2: u32 = 0x0000_0800;
    pub const TIER_3: u32 = 0x0000_1000;
    pub const TIER_4: u32 = 0x0000_2000;
}

/// Name of the concurrent group exposing OA metric sets
pub const OA_CONCURRENT_GROUP: &str = "OA";

/// Status codes reported by the library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCode {
    Ok,
    ReadPending,
    /// Read succeeded but the hardware buffer wrapped and reports were lost
    ReportsLost,
    WaitTimeout,
    InvalidParameter,
    Error,
}

impl CompletionCode {
    pub fn is_ok(self) -> bool {
        matches!(self, CompletionCode::Ok)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    /// Oldest version the engine can enumerate with
    pub const REQUIRED: ApiVersion = ApiVersion { major: 1, minor: 5 };

    pub fn is_supported(self) -> bool {
        self >= Self::REQUIRED
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSetParams {
    pub symbol_name: String,
    pub short_name: String,
    pub api_mask: u32,
    pub metrics_count: u32,
    pub information_count: u32,
    pub raw_report_size: u32,
    pub query_report_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMetricType {
    Duration,
    Event,
    EventWithRange,
    Throughput,
    Timestamp,
    Flag,
    Ratio,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryResultType {
    Uint32,
    Uint64,
    Bool,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformationType {
    ReportReason,
    Value,
    Flag,
    Timestamp,
    ContextIdTag,
    SamplePhase,
    GpuNode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricParams {
    pub symbol_name: String,
    pub long_name: String,
    pub group_name: String,
    pub units: String,
    pub usage_flags: u32,
    pub metric_type: DiscoveryMetricType,
    pub result_type: DiscoveryResultType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformationParams {
    pub symbol_name: String,
    pub long_name: String,
    pub group_name: String,
    pub units: String,
    pub info_type: InformationType,
}

/// Result of a raw-report calculation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalculatedReports {
    pub report_count: u32,
    /// `report_count` rows of metrics followed by information entries
    pub values: Vec<TypedValue>,
    pub max_values: Vec<TypedValue>,
}

/// Outcome of one I/O stream read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStreamRead {
    pub code: CompletionCode,
    pub report_count: u32,
}

pub trait MetricSet: Send + Sync {
    /// Parameters as seen through the current API filter
    fn params(&self) -> MetricSetParams;
    fn metric(&self, index: u32) -> Option<MetricParams>;
    fn information(&self, index: u32) -> Option<InformationParams>;
    fn set_api_filtering(&self, api_mask: u32) -> CompletionCode;

    /// Push this set's configuration to the kernel driver
    fn activate(&self) -> CompletionCode;
    fn deactivate(&self) -> CompletionCode;

    fn calculate_metrics(&self, raw: &[u8]) -> Result<CalculatedReports, CompletionCode>;
}

pub trait ConcurrentGroup: Send + Sync {
    fn symbol_name(&self) -> String;
    fn metric_set_count(&self) -> u32;
    fn metric_set(&self, index: u32) -> Option<Arc<dyn MetricSet>>;

    /// Build a metric set from metrics and information entries of this
    /// group's sets, named by symbol, visible through `api_mask`
    fn add_metric_set(
        &self,
        symbol_name: &str,
        api_mask: u32,
        symbols: &[String],
    ) -> Result<Arc<dyn MetricSet>, CompletionCode>;

    /// Open the OA stream; `oa_buffer_size` holds the requested size on entry
    /// and the size actually allocated on return
    fn open_io_stream(
        &self,
        metric_set: &dyn MetricSet,
        sampling_period_ns: u32,
        oa_buffer_size: &mut u32,
    ) -> CompletionCode;

    /// Read up to `max_reports` reports into `out`
    fn read_io_stream(&self, max_reports: u32, out: &mut [u8]) -> IoStreamRead;
    fn close_io_stream(&self) -> CompletionCode;

    /// `Ok` once the notification threshold is reached, `WaitTimeout` otherwise
    fn wait_for_reports(&self, timeout_ms: u32) -> CompletionCode;
}

/// Per-device entry point of the library
pub trait MetricsDiscoveryDevice: Send + Sync {
    fn version(&self) -> ApiVersion;
    fn concurrent_group_count(&self) -> u32;
    fn concurrent_group(&self, index: u32) -> Option<Arc<dyn ConcurrentGroup>>;
}
