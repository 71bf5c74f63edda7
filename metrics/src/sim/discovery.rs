//! Simulated hardware description library

use super::SimControls;
use crate::discovery::{
    api_mask, usage_flag, ApiVersion, CalculatedReports, CompletionCode, ConcurrentGroup,
    DiscoveryMetricType, DiscoveryResultType, InformationParams, InformationType, IoStreamRead,
    MetricParams, MetricSet, MetricSetParams, MetricsDiscoveryDevice, OA_CONCURRENT_GROUP,
};
use crate::hw::HardwareGeneration;
use lzmetrics_shared::TypedValue;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Size of one query report in the simulated libraries
pub const QUERY_REPORT_SIZE: u32 = 256;

/// Write a report whose counters are derived from `seed`
pub fn write_report(out: &mut [u8], seed: u64) {
    out.fill(0);
    let n = out.len().min(8);
    out[..n].copy_from_slice(&seed.to_le_bytes()[..n]);
}

fn report_seed(report: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let n = report.len().min(8);
    bytes[..n].copy_from_slice(&report[..n]);
    u64::from_le_bytes(bytes)
}

fn metric(
    name: &str,
    metric_type: DiscoveryMetricType,
    result_type: DiscoveryResultType,
    units: &str,
    tier: u32,
) -> MetricParams {
    MetricParams {
        symbol_name: name.to_string(),
        long_name: format!("{} (simulated)", name),
        group_name: "GPU".to_string(),
        units: units.to_string(),
        usage_flags: tier,
        metric_type,
        result_type,
    }
}

fn information(name: &str, info_type: InformationType) -> InformationParams {
    InformationParams {
        symbol_name: name.to_string(),
        long_name: name.to_string(),
        group_name: "Report".to_string(),
        units: String::new(),
        info_type,
    }
}

pub struct SimMetricSet {
    symbol_name: String,
    short_name: String,
    api_mask: u32,
    raw_report_size: u32,
    metrics: Vec<MetricParams>,
    information: Vec<InformationParams>,
    filter: AtomicU32,
    active: AtomicBool,
}

impl SimMetricSet {
    fn new(
        symbol_name: &str,
        short_name: &str,
        api_mask: u32,
        raw_report_size: u32,
        metrics: Vec<MetricParams>,
    ) -> Self {
        Self {
            symbol_name: symbol_name.to_string(),
            short_name: short_name.to_string(),
            api_mask,
            raw_report_size,
            metrics,
            information: vec![
                information("QueryBeginTime", InformationType::Timestamp),
                information("ReportReason", InformationType::ReportReason),
            ],
            filter: AtomicU32::new(api_mask::ALL),
            active: AtomicBool::new(false),
        }
    }

    fn custom(
        symbol_name: &str,
        api_mask: u32,
        raw_report_size: u32,
        metrics: Vec<MetricParams>,
        information: Vec<InformationParams>,
    ) -> Self {
        Self {
            symbol_name: symbol_name.to_string(),
            short_name: symbol_name.to_string(),
            api_mask,
            raw_report_size,
            metrics,
            information,
            filter: AtomicU32::new(api_mask::ALL),
            active: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn visible(&self) -> bool {
        self.filter.load(Ordering::SeqCst) & self.api_mask != 0
    }

    fn report_size(&self) -> u32 {
        if self.filter.load(Ordering::SeqCst) == api_mask::IOSTREAM {
            self.raw_report_size
        } else {
            QUERY_REPORT_SIZE
        }
    }

    fn report_values(&self, seed: u64) -> (Vec<TypedValue>, Vec<TypedValue>) {
        let mut values = Vec::new();
        let mut max = Vec::new();
        for (j, m) in self.metrics.iter().enumerate() {
            let v = seed + j as u64;
            let (value, top) = match m.result_type {
                DiscoveryResultType::Uint32 => (TypedValue::Uint32(v as u32), TypedValue::Uint32(u32::MAX)),
                DiscoveryResultType::Uint64 => (TypedValue::Uint64(v), TypedValue::Uint64(u64::MAX)),
                DiscoveryResultType::Float => (TypedValue::Float32((v % 100) as f32), TypedValue::Float32(100.0)),
                DiscoveryResultType::Bool => (TypedValue::Bool8(v % 2 == 0), TypedValue::Bool8(true)),
            };
            values.push(value);
            max.push(top);
        }
        for info in &self.information {
            let value = match info.info_type {
                InformationType::Timestamp => TypedValue::Uint64(seed * 10),
                InformationType::ReportReason => TypedValue::Uint64(1),
                InformationType::Flag => TypedValue::Bool8(true),
                _ => TypedValue::Uint64(seed),
            };
            values.push(value);
            max.push(value);
        }
        (values, max)
    }
}

impl MetricSet for SimMetricSet {
    fn params(&self) -> MetricSetParams {
        let visible = self.visible();
        MetricSetParams {
            symbol_name: self.symbol_name.clone(),
            short_name: self.short_name.clone(),
            api_mask: self.api_mask,
            metrics_count: if visible { self.metrics.len() as u32 } else { 0 },
            information_count: if visible { self.information.len() as u32 } else { 0 },
            raw_report_size: self.raw_report_size,
            query_report_size: QUERY_REPORT_SIZE,
        }
    }

    fn metric(&self, index: u32) -> Option<MetricParams> {
        self.metrics.get(index as usize).cloned()
    }

    fn information(&self, index: u32) -> Option<InformationParams> {
        self.information.get(index as usize).cloned()
    }

    fn set_api_filtering(&self, api_mask: u32) -> CompletionCode {
        self.filter.store(api_mask, Ordering::SeqCst);
        CompletionCode::Ok
    }

    fn activate(&self) -> CompletionCode {
        self.active.store(true, Ordering::SeqCst);
        CompletionCode::Ok
    }

    fn deactivate(&self) -> CompletionCode {
        self.active.store(false, Ordering::SeqCst);
        CompletionCode::Ok
    }

    fn calculate_metrics(&self, raw: &[u8]) -> Result<CalculatedReports, CompletionCode> {
        let report_size = self.report_size() as usize;
        if report_size == 0 || raw.len() % report_size != 0 {
            return Err(CompletionCode::InvalidParameter);
        }

        let mut calculated = CalculatedReports::default();
        for report in raw.chunks(report_size) {
            let (values, max) = self.report_values(report_seed(report));
            calculated.values.extend(values);
            calculated.max_values.extend(max);
            calculated.report_count += 1;
        }
        Ok(calculated)
    }
}

#[derive(Debug, Default)]
struct SimStream {
    open: bool,
    raw_report_size: u32,
    sequence: u64,
}

pub struct SimConcurrentGroup {
    symbol_name: String,
    sets: Vec<Arc<SimMetricSet>>,
    controls: Arc<SimControls>,
    sub_device: u32,
    stream: Mutex<SimStream>,
}

impl SimConcurrentGroup {
    fn new(symbol_name: &str, sets: Vec<Arc<SimMetricSet>>, controls: Arc<SimControls>, sub_device: u32) -> Self {
        Self {
            symbol_name: symbol_name.to_string(),
            sets,
            controls,
            sub_device,
            stream: Mutex::new(SimStream::default()),
        }
    }

    pub fn metric_sets(&self) -> &[Arc<SimMetricSet>] {
        &self.sets
    }

    pub fn is_stream_open(&self) -> bool {
        self.stream.lock().unwrap_or_else(|e| e.into_inner()).open
    }
}

impl ConcurrentGroup for SimConcurrentGroup {
    fn symbol_name(&self) -> String {
        self.symbol_name.clone()
    }

    fn metric_set_count(&self) -> u32 {
        self.sets.len() as u32
    }

    fn metric_set(&self, index: u32) -> Option<Arc<dyn MetricSet>> {
        self.sets.get(index as usize).map(|s| s.clone() as Arc<dyn MetricSet>)
    }

    fn add_metric_set(
        &self,
        symbol_name: &str,
        api_mask: u32,
        symbols: &[String],
    ) -> Result<Arc<dyn MetricSet>, CompletionCode> {
        if SimControls::on(&self.controls.fail_metric_set_create) {
            return Err(CompletionCode::Error);
        }
        let symbols = match self.controls.short_metric_sets_on() {
            Some(sub_device) if sub_device == self.sub_device => &symbols[..symbols.len().saturating_sub(1)],
            _ => symbols,
        };

        let mut metrics = Vec::new();
        let mut information = Vec::new();
        let mut raw_report_size = 0;
        for symbol in symbols {
            let metric = self
                .sets
                .iter()
                .find_map(|set| set.metrics.iter().find(|m| &m.symbol_name == symbol).map(|m| (set, m)));
            if let Some((set, metric)) = metric {
                raw_report_size = set.raw_report_size;
                metrics.push(metric.clone());
                continue;
            }
            let info = self
                .sets
                .iter()
                .find_map(|set| set.information.iter().find(|i| &i.symbol_name == symbol));
            match info {
                Some(info) => information.push(info.clone()),
                None => return Err(CompletionCode::InvalidParameter),
            }
        }
        if raw_report_size == 0 {
            raw_report_size = self.sets.first().map_or(0, |set| set.raw_report_size);
        }

        Ok(Arc::new(SimMetricSet::custom(
            symbol_name,
            api_mask,
            raw_report_size,
            metrics,
            information,
        )))
    }

    fn open_io_stream(&self, metric_set: &dyn MetricSet, _sampling_period_ns: u32, oa_buffer_size: &mut u32) -> CompletionCode {
        if SimControls::on(&self.controls.fail_io_open) {
            return CompletionCode::Error;
        }
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        if stream.open {
            return CompletionCode::Error;
        }
        if let Some(granted) = self.controls.oa_buffer_size() {
            *oa_buffer_size = granted;
        }
        stream.open = true;
        stream.raw_report_size = metric_set.params().raw_report_size;
        CompletionCode::Ok
    }

    fn read_io_stream(&self, max_reports: u32, out: &mut [u8]) -> IoStreamRead {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        let raw = stream.raw_report_size as usize;
        if !stream.open || raw == 0 || SimControls::on(&self.controls.fail_io_read) {
            return IoStreamRead {
                code: CompletionCode::Error,
                report_count: 0,
            };
        }

        let available = self.controls.stream_reports(self.sub_device);
        let count = max_reports.min(available).min((out.len() / raw) as u32);
        for report in out.chunks_mut(raw).take(count as usize) {
            stream.sequence += 1;
            write_report(report, stream.sequence);
        }

        let code = if self.controls.overflow_next_read.swap(false, Ordering::SeqCst) {
            CompletionCode::ReportsLost
        } else {
            CompletionCode::Ok
        };
        IoStreamRead {
            code,
            report_count: count,
        }
    }

    fn close_io_stream(&self) -> CompletionCode {
        self.stream.lock().unwrap_or_else(|e| e.into_inner()).open = false;
        if SimControls::on(&self.controls.fail_io_close) {
            CompletionCode::Error
        } else {
            CompletionCode::Ok
        }
    }

    fn wait_for_reports(&self, _timeout_ms: u32) -> CompletionCode {
        if !self.is_stream_open() {
            return CompletionCode::Error;
        }
        if self.controls.stream_reports(self.sub_device) > 0 {
            CompletionCode::Ok
        } else {
            CompletionCode::WaitTimeout
        }
    }
}

pub struct SimDiscoveryDevice {
    controls: Arc<SimControls>,
    groups: Vec<Arc<SimConcurrentGroup>>,
}

impl SimDiscoveryDevice {
    /// A pipeline-statistics group the engine must skip, then the OA group
    pub fn new(controls: Arc<SimControls>, generation: HardwareGeneration, sub_device: u32) -> Self {
        use DiscoveryMetricType as T;
        use DiscoveryResultType as R;

        let raw = generation.oa_report_size();
        let gpu_time = || metric("GpuTime", T::Duration, R::Uint64, "ns", usage_flag::TIER_1);
        let gpu_busy = || metric("GpuBusy", T::Ratio, R::Float, "percent", usage_flag::TIER_1);

        let oa_sets = vec![
            Arc::new(SimMetricSet::new(
                "ComputeBasic",
                "Compute Metrics Basic set",
                api_mask::OCL | api_mask::IOSTREAM,
                raw,
                vec![
                    gpu_time(),
                    gpu_busy(),
                    metric("EuActive", T::Ratio, R::Float, "percent", usage_flag::TIER_2),
                ],
            )),
            Arc::new(SimMetricSet::new(
                "RenderBasic",
                "Render Metrics Basic set",
                api_mask::OGL4_X | api_mask::IOSTREAM,
                raw,
                vec![
                    gpu_time(),
                    gpu_busy(),
                    metric("SamplerBusy", T::Ratio, R::Float, "percent", usage_flag::TIER_3),
                ],
            )),
            Arc::new(SimMetricSet::new(
                "MemoryProfile",
                "Memory profile set",
                api_mask::IOSTREAM,
                raw,
                vec![
                    gpu_time(),
                    metric("GpuMemoryReadBytes", T::Throughput, R::Uint64, "bytes", usage_flag::TIER_2),
                    metric("GpuMemoryWriteBytes", T::Throughput, R::Uint64, "bytes", usage_flag::TIER_2),
                ],
            )),
        ];
        let pipeline_sets = vec![Arc::new(SimMetricSet::new(
            "PipelineStats",
            "Pipeline statistics",
            api_mask::OCL,
            raw,
            vec![metric("VertexCount", T::Event, R::Uint64, "vertices", usage_flag::TIER_4)],
        ))];

        let groups = vec![
            Arc::new(SimConcurrentGroup::new("PipelineStatistics", pipeline_sets, controls.clone(), sub_device)),
            Arc::new(SimConcurrentGroup::new(OA_CONCURRENT_GROUP, oa_sets, controls.clone(), sub_device)),
        ];
        Self { controls, groups }
    }

    pub fn oa_group(&self) -> &Arc<SimConcurrentGroup> {
        &self.groups[1]
    }
}

impl MetricsDiscoveryDevice for SimDiscoveryDevice {
    fn version(&self) -> ApiVersion {
        self.controls.discovery_version()
    }

    fn concurrent_group_count(&self) -> u32 {
        self.groups.len() as u32
    }

    fn concurrent_group(&self, index: u32) -> Option<Arc<dyn ConcurrentGroup>> {
        self.groups.get(index as usize).map(|g| g.clone() as Arc<dyn ConcurrentGroup>)
    }
}
