//! EU stall sampling source
//!
//! Samples the instruction pointer of stalled EU threads through the OS
//! layer. Every device exposes one time-based group. Raw reports are 64
//! bytes; calculation sums the stall counters per unique instruction
//! pointer, one result set per pointer. A root device under implicit scaling
//! samples through its subdevices and packs their reads with the calculate
//! header.

use super::activation::{ActivationEvent, ActivationTracker};
use super::{ActivationSnapshot, MetricSource, SourceId, SourceType};
use crate::cmdlist::{CommandList, EventHandle};
use crate::device::{Device, DeviceServices};
use crate::group::{CalculationCounts, GroupId, MetricGroup, MetricGroupHandle};
use crate::metric::{Metric, MetricHandle};
use crate::streamer::{MetricStreamer, StreamerBackend};
use crate::telemetry;
use bincode::Options;
use lzmetrics_shared::protocol::calculate::{
    pack_with, packed_capacity, MetricGroupCalculateHeader, PackedRawData,
};
use lzmetrics_shared::{
    CalculatedValues, CalculationType, MetricGroupProperties, MetricProperties, MetricStreamerDesc, MetricType,
    MetricsError, Result, SamplingType, TypedValue, ValueType,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};

/// Size of one raw stall report
pub const IP_SAMPLING_REPORT_SIZE: u32 = 64;

pub const IP_SAMPLING_DOMAIN: u32 = 100;

pub const IP_SAMPLING_GROUP_NAME: &str = "EuStallSampling";

/// Stall counters following the instruction pointer, in report order
pub const STALL_COUNTERS: [&str; 9] = [
    "Active",
    "ControlStall",
    "PipeStall",
    "SendStall",
    "DistStall",
    "SbidStall",
    "SyncStall",
    "InstrFetchStall",
    "OtherStall",
];

/// Metrics per result set: the instruction pointer and every stall counter
pub const IP_SAMPLING_METRIC_COUNT: u32 = 1 + STALL_COUNTERS.len() as u32;

/// OS access to the EU stall sampling unit of one device
pub trait IpSamplingOsInterface: Send + Sync {
    /// Start sampling; both values may be lowered to what the unit grants
    fn start_measurement(&self, notify_every_n_reports: &mut u32, sampling_period_ns: &mut u32) -> Result<()>;
    fn stop_measurement(&self) -> Result<()>;

    /// Copy whole reports into `out`; returns the bytes written
    fn read_data(&self, out: &mut [u8]) -> Result<usize>;

    /// Bytes a read of up to `max_reports` reports needs
    fn required_buffer_size(&self, max_reports: u32) -> u32;
    fn unit_report_size(&self) -> u32;

    /// The notification threshold was reached
    fn is_n_reports_available(&self) -> bool;

    /// The kernel driver exposes EU stall sampling
    fn is_dependency_available(&self) -> bool;
}

fn report_bincode() -> impl bincode::config::Options {
    bincode::config::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
}

/// Leading fields of one raw stall report; the rest of the report is reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StallReport {
    pub ip: u64,
    pub counters: [u16; 9],
}

impl StallReport {
    pub fn decode(raw: &[u8]) -> Result<Self> {
        report_bincode()
            .deserialize(raw)
            .map_err(|e| MetricsError::invalid_argument(format!("stall report decode: {}", e)))
    }

    /// Write the report into a zeroed `IP_SAMPLING_REPORT_SIZE` slot
    pub fn encode_into(&self, out: &mut [u8]) -> Result<()> {
        let provided = out.len();
        let slot = out
            .get_mut(..IP_SAMPLING_REPORT_SIZE as usize)
            .ok_or_else(|| MetricsError::InvalidSize {
                required: IP_SAMPLING_REPORT_SIZE as usize,
                provided,
            })?;
        slot.fill(0);
        report_bincode()
            .serialize_into(slot, self)
            .map_err(|e| MetricsError::unknown(format!("stall report encode: {}", e)))
    }
}

/// Stall totals of one instruction pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IpTotals {
    ip: u64,
    counters: [u64; 9],
}

impl IpTotals {
    fn values(&self) -> Vec<TypedValue> {
        std::iter::once(self.ip)
            .chain(self.counters.iter().copied())
            .map(TypedValue::Uint64)
            .collect()
    }
}

/// Sum the counters of every report per instruction pointer, in order of
/// first appearance
fn aggregate(raw: &[u8]) -> Result<Vec<IpTotals>> {
    let unit = IP_SAMPLING_REPORT_SIZE as usize;
    if raw.len() % unit != 0 {
        return Err(MetricsError::InvalidSize {
            required: raw.len().div_ceil(unit) * unit,
            provided: raw.len(),
        });
    }

    let mut totals: Vec<IpTotals> = Vec::new();
    let mut index: HashMap<u64, usize> = HashMap::new();
    for chunk in raw.chunks_exact(unit) {
        let report = StallReport::decode(chunk)?;
        let slot = *index.entry(report.ip).or_insert_with(|| {
            totals.push(IpTotals {
                ip: report.ip,
                counters: [0; 9],
            });
            totals.len() - 1
        });
        for (total, value) in totals[slot].counters.iter_mut().zip(report.counters) {
            *total += u64::from(value);
        }
    }
    Ok(totals)
}

#[derive(Debug)]
pub struct IpSamplingMetric {
    properties: MetricProperties,
    source_id: SourceId,
    device: Weak<Device>,
}

impl Metric for IpSamplingMetric {
    fn properties(&self) -> MetricProperties {
        self.properties.clone()
    }

    fn source_id(&self) -> SourceId {
        self.source_id
    }

    fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }
}

fn stall_metrics(source_id: SourceId, device: &Weak<Device>) -> Vec<MetricHandle> {
    let ip = MetricProperties {
        name: "IP".to_string(),
        description: "IP address".to_string(),
        component: "XVE".to_string(),
        tier_number: 4,
        metric_type: MetricType::Raw,
        result_type: ValueType::Uint64,
        result_units: "Address".to_string(),
    };
    let counters = STALL_COUNTERS.iter().map(|name| MetricProperties {
        name: name.to_string(),
        description: format!("{} cycles", name),
        component: "XVE".to_string(),
        tier_number: 4,
        metric_type: MetricType::Event,
        result_type: ValueType::Uint64,
        result_units: "Events".to_string(),
    });

    std::iter::once(ip)
        .chain(counters)
        .map(|properties| {
            Arc::new(IpSamplingMetric {
                properties,
                source_id,
                device: device.clone(),
            }) as MetricHandle
        })
        .collect()
}

pub struct IpSamplingMetricGroup {
    id: GroupId,
    properties: MetricGroupProperties,
    metrics: Vec<MetricHandle>,
    source: Weak<IpSamplingMetricSource>,
    source_id: SourceId,
    device: Weak<Device>,
    multi_device: bool,
}

impl fmt::Debug for IpSamplingMetricGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpSamplingMetricGroup")
            .field("id", &self.id)
            .field("multi_device", &self.multi_device)
            .finish()
    }
}

impl IpSamplingMetricGroup {
    fn new(source: Weak<IpSamplingMetricSource>, source_id: SourceId, device: Weak<Device>, multi_device: bool) -> Self {
        let metrics = stall_metrics(source_id, &device);
        Self {
            id: GroupId::next(),
            properties: MetricGroupProperties {
                name: IP_SAMPLING_GROUP_NAME.to_string(),
                description: "EU stall sampling".to_string(),
                sampling_type: SamplingType::TimeBased,
                domain: IP_SAMPLING_DOMAIN,
                metric_count: metrics.len() as u32,
            },
            metrics,
            source,
            source_id,
            device,
            multi_device,
        }
    }

    fn source(&self) -> Result<Arc<IpSamplingMetricSource>> {
        self.source
            .upgrade()
            .ok_or_else(|| MetricsError::Uninitialized("metric source is gone".into()))
    }
}

fn only_metric_values(calculation: CalculationType) -> Result<()> {
    match calculation {
        CalculationType::MetricValues => Ok(()),
        CalculationType::MaxMetricValues => Err(MetricsError::unsupported(
            "EU stall sampling has no maximum metric values",
        )),
    }
}

impl MetricGroup for IpSamplingMetricGroup {
    fn id(&self) -> GroupId {
        self.id
    }

    fn properties(&self) -> MetricGroupProperties {
        self.properties.clone()
    }

    fn metrics(&self) -> Vec<MetricHandle> {
        self.metrics.clone()
    }

    fn source_id(&self) -> SourceId {
        self.source_id
    }

    fn source_type(&self) -> SourceType {
        SourceType::IpSampling
    }

    fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    fn is_multi_device(&self) -> bool {
        self.multi_device
    }

    fn calculate_metric_values(
        &self,
        calculation: CalculationType,
        raw: &[u8],
        out: Option<&mut Vec<TypedValue>>,
    ) -> Result<u32> {
        only_metric_values(calculation)?;
        if MetricGroupCalculateHeader::is_packed(raw) {
            return Err(MetricsError::unknown(
                "packed multi-subdevice data needs calculate_multiple_metric_values",
            ));
        }

        let totals = aggregate(raw)?;
        let count = totals.len() as u32 * IP_SAMPLING_METRIC_COUNT;
        if let Some(out) = out {
            out.extend(totals.iter().flat_map(IpTotals::values));
        }
        Ok(count)
    }

    fn calculate_multiple_metric_values(
        &self,
        calculation: CalculationType,
        raw: &[u8],
        mut out: Option<&mut CalculatedValues>,
    ) -> Result<CalculationCounts> {
        only_metric_values(calculation)?;

        let parts: Vec<&[u8]> = if MetricGroupCalculateHeader::is_packed(raw) {
            PackedRawData::parse(raw)?.parts().collect()
        } else if self.multi_device {
            return Err(MetricsError::unknown("multi-device metric groups expect packed raw data"));
        } else {
            vec![raw]
        };

        let mut counts = CalculationCounts::default();
        for part in parts {
            let totals = aggregate(part)?;
            counts.data_count += totals.len() as u32;
            counts.total_metric_count += totals.len() as u32 * IP_SAMPLING_METRIC_COUNT;
            if let Some(out) = out.as_deref_mut() {
                for totals in &totals {
                    out.push_set(totals.values());
                }
            }
        }
        Ok(counts)
    }

    fn metric_streamer_open(
        self: Arc<Self>,
        device: &Arc<Device>,
        desc: &mut MetricStreamerDesc,
        event: Option<EventHandle>,
    ) -> Result<MetricStreamer> {
        open_streamer(device, self, desc, event)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
struct IpSamplingState {
    activation: ActivationTracker,
    streamer_open: bool,
}

pub struct IpSamplingMetricSource {
    id: SourceId,
    device: Weak<Device>,
    os: Option<Arc<dyn IpSamplingOsInterface>>,
    implicit_scaling: bool,
    enabled: AtomicBool,
    group: Arc<IpSamplingMetricGroup>,
    state: Mutex<IpSamplingState>,
}

impl IpSamplingMetricSource {
    pub(crate) fn new(device: Weak<Device>, services: &Arc<dyn DeviceServices>, implicit_scaling: bool) -> Arc<Self> {
        Arc::new_cyclic(|this| {
            let id = SourceId::next();
            Self {
                id,
                device: device.clone(),
                os: services.ip_sampling_os(),
                implicit_scaling,
                enabled: AtomicBool::new(false),
                group: Arc::new(IpSamplingMetricGroup::new(this.clone(), id, device, implicit_scaling)),
                state: Mutex::new(IpSamplingState::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, IpSamplingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Root device sampling through its subdevices
    pub fn is_implicit_scaling_root(&self) -> bool {
        self.implicit_scaling
    }

    pub fn sub_sources(&self) -> Vec<Arc<IpSamplingMetricSource>> {
        match self.device.upgrade() {
            Some(device) => device
                .sub_devices()
                .iter()
                .filter_map(|sub| sub.metric_context().metric_source::<IpSamplingMetricSource>())
                .collect(),
            None => Vec::new(),
        }
    }

    fn os(&self) -> Result<Arc<dyn IpSamplingOsInterface>> {
        self.os
            .clone()
            .ok_or_else(|| MetricsError::DependencyUnavailable("no EU stall sampling interface".into()))
    }

    pub fn is_group_activated(&self, group: GroupId) -> bool {
        self.lock().activation.is_requested(group)
    }

    pub fn is_streamer_open(&self) -> bool {
        self.lock().streamer_open
    }

    fn claim_streamer(&self) -> Result<()> {
        let mut state = self.lock();
        if state.streamer_open {
            return Err(MetricsError::HandleObjectInUse(
                "an EU stall sampling streamer is already open on this device".into(),
            ));
        }
        state.streamer_open = true;
        Ok(())
    }

    fn release_streamer(&self) {
        self.lock().streamer_open = false;
    }
}

impl MetricSource for IpSamplingMetricSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn source_type(&self) -> SourceType {
        SourceType::IpSampling
    }

    fn enable(&self) -> Result<()> {
        if !self.is_available() {
            return Err(MetricsError::DependencyUnavailable(
                "EU stall sampling is not available".into(),
            ));
        }
        self.enabled.store(true, Ordering::Release);
        debug!(source = ?self.id, "IP sampling source enabled");
        Ok(())
    }

    fn is_available(&self) -> bool {
        if self.implicit_scaling {
            let subs = self.sub_sources();
            return !subs.is_empty() && subs.iter().all(|s| s.is_available());
        }
        self.os.as_ref().is_some_and(|os| os.is_dependency_available())
    }

    fn metric_group_get(&self) -> Result<Vec<MetricGroupHandle>> {
        Ok(vec![self.group.clone() as MetricGroupHandle])
    }

    fn append_metric_memory_barrier(&self, _cmd: &mut dyn CommandList) -> Result<()> {
        Err(MetricsError::unsupported("EU stall sampling has no memory barrier"))
    }

    fn activate(&self, groups: &[MetricGroupHandle], deferred: bool) -> Result<()> {
        if let Some(foreign) = groups.iter().find(|g| g.source_id() != self.id) {
            return Err(MetricsError::invalid_argument(format!(
                "metric group {} belongs to another source",
                foreign.properties().name
            )));
        }
        // Sampling is configured when the streamer opens; nothing to program here
        self.lock().activation.transition(ActivationEvent::Request {
            groups: groups.to_vec(),
            deferred,
        })?;
        Ok(())
    }

    fn activate_already_deferred(&self) -> Result<()> {
        self.lock().activation.transition(ActivationEvent::Trigger)?;
        Ok(())
    }

    fn snapshot_activation(&self) -> ActivationSnapshot {
        self.lock().activation.snapshot()
    }

    fn restore_activation(&self, snapshot: ActivationSnapshot) -> Result<()> {
        self.lock().activation.restore(snapshot);
        Ok(())
    }

    fn supports_calculation_operations(&self) -> bool {
        true
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct StallStreamPart {
    source: Arc<IpSamplingMetricSource>,
    os: Arc<dyn IpSamplingOsInterface>,
}

impl StallStreamPart {
    fn read_capacity(&self, max_reports: u32) -> usize {
        self.os.required_buffer_size(max_reports) as usize
    }

    fn read(&self, max_reports: u32, out: &mut [u8]) -> Result<usize> {
        let size = self.read_capacity(max_reports).min(out.len());
        let bytes = self.os.read_data(&mut out[..size])?;
        let unit = self.os.unit_report_size().max(1) as usize;
        telemetry::REPORTS_READ.inc_by((bytes / unit) as f64);
        Ok(bytes)
    }
}

/// Stop sampling and release claims of parts started so far
fn abandon(parts: &[StallStreamPart]) {
    for part in parts {
        if let Err(e) = part.os.stop_measurement() {
            warn!(error = %e, "stopping EU stall sampling failed");
        }
        part.source.release_streamer();
    }
}

struct IpSamplingStreamer {
    group: Arc<IpSamplingMetricGroup>,
    parts: Vec<StallStreamPart>,
}

/// Open a stall sampling streamer. A buffer size extension in `desc` is
/// answered with the largest buffer the sampling unit could need.
fn open_streamer(
    device: &Arc<Device>,
    group: Arc<IpSamplingMetricGroup>,
    desc: &mut MetricStreamerDesc,
    event: Option<EventHandle>,
) -> Result<MetricStreamer> {
    if !matches!(group.device(), Some(d) if Arc::ptr_eq(&d, device)) {
        return Err(MetricsError::invalid_argument("metric group belongs to another device"));
    }

    let owner = group.source()?;
    if !owner.is_group_activated(group.id) {
        return Err(MetricsError::NotReady(format!("{} is not activated", group.properties.name)));
    }
    owner.activate_already_deferred()?;

    let sources = if owner.is_implicit_scaling_root() {
        owner.sub_sources()
    } else {
        vec![owner]
    };
    if sources.is_empty() {
        return Err(MetricsError::unknown("implicit scaling device without subdevices"));
    }

    let mut parts: Vec<StallStreamPart> = Vec::with_capacity(sources.len());
    for source in sources {
        source.claim_streamer().inspect_err(|_| abandon(&parts))?;
        let started = source.os().and_then(|os| {
            let mut notify = desc.notify_every_n_reports;
            let mut period = desc.sampling_period;
            os.start_measurement(&mut notify, &mut period)?;
            desc.notify_every_n_reports = notify;
            desc.sampling_period = period;
            Ok(os)
        });
        match started {
            Ok(os) => parts.push(StallStreamPart { source, os }),
            Err(e) => {
                warn!(sub_device = parts.len(), error = %e, "EU stall sampling did not start");
                source.release_streamer();
                abandon(&parts);
                return Err(e);
            }
        }
    }

    if let Some(hint) = desc.buffer_size.as_mut() {
        hint.size_in_bytes = u64::from(IP_SAMPLING_REPORT_SIZE) * u64::from(u32::MAX) * parts.len() as u64;
    }

    info!(
        parts = parts.len(),
        notify_every_n_reports = desc.notify_every_n_reports,
        sampling_period = desc.sampling_period,
        "EU stall sampling started"
    );
    Ok(MetricStreamer::new(
        device.clone(),
        Box::new(IpSamplingStreamer { group, parts }),
        desc.notify_every_n_reports,
        event,
    ))
}

impl StreamerBackend for IpSamplingStreamer {
    fn group(&self) -> MetricGroupHandle {
        self.group.clone()
    }

    fn hw_buffer_sizes(&self) -> Vec<u32> {
        self.parts.iter().map(|p| p.os.required_buffer_size(u32::MAX)).collect()
    }

    fn read_data(&self, max_reports: u32, out: Option<&mut [u8]>) -> Result<(usize, bool)> {
        if let [part] = self.parts.as_slice() {
            return match out {
                None => Ok((part.read_capacity(max_reports), false)),
                Some(out) => Ok((part.read(max_reports, out)?, false)),
            };
        }

        match out {
            None => {
                let largest = self
                    .parts
                    .iter()
                    .map(|p| p.read_capacity(max_reports))
                    .max()
                    .unwrap_or(0);
                Ok((packed_capacity(self.parts.len(), largest), false))
            }
            Some(out) => {
                let bytes = pack_with(out, self.parts.len(), |i, region| self.parts[i].read(max_reports, region))?;
                Ok((bytes, false))
            }
        }
    }

    fn append_marker(&self, _device: &Arc<Device>, _cmd: &mut dyn CommandList, _value: u32) -> Result<()> {
        Err(MetricsError::unsupported("EU stall sampling streamers take no markers"))
    }

    fn wait_for_reports(&self, _timeout_ms: u32) -> Result<bool> {
        Ok(self.parts.iter().any(|p| p.os.is_n_reports_available()))
    }

    fn close(&mut self) -> Result<()> {
        let mut result = Ok(());
        for (i, part) in self.parts.iter().enumerate() {
            let stopped = part.os.stop_measurement();
            part.source.release_streamer();
            if let Err(e) = stopped {
                warn!(sub_device = i, error = %e, "stopping EU stall sampling failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}
