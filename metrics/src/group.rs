//! Metric groups
//!
//! `OaMetricGroup` wraps one metric set of one device. `MultiDeviceMetricGroup`
//! is the root-device view under implicit scaling: it owns the per-subdevice
//! groups in subdevice order and fans calculation out to them, but never
//! touches hardware itself.

use crate::cmdlist::EventHandle;
use crate::device::Device;
use crate::discovery::{api_mask, ConcurrentGroup, MetricSet};
use crate::metric::{Metric, MetricHandle, MultiDeviceMetric, OaMetric};
use crate::query::{self, MetricQueryPool};
use crate::source::oa::OaMetricSource;
use crate::source::{SourceId, SourceType};
use crate::streamer::{self, MetricStreamer};
use lzmetrics_shared::protocol::calculate::{MetricGroupCalculateHeader, PackedRawData};
use lzmetrics_shared::protocol::export::{ExportData, ExportedMetricSet};
use lzmetrics_shared::{
    CalculatedValues, CalculationType, MetricGroupProperties, MetricQueryPoolDesc, MetricStreamerDesc,
    MetricsError, Result, SamplingType, TypedValue,
};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u64);

impl GroupId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        GroupId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Sizes reported by the counting pass of a multiple-value calculation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalculationCounts {
    pub data_count: u32,
    pub total_metric_count: u32,
}

pub trait MetricGroup: Send + Sync + fmt::Debug {
    fn id(&self) -> GroupId;
    fn properties(&self) -> MetricGroupProperties;
    fn metrics(&self) -> Vec<MetricHandle>;
    fn source_id(&self) -> SourceId;
    fn source_type(&self) -> SourceType;
    fn device(&self) -> Option<Arc<Device>>;

    fn is_multi_device(&self) -> bool {
        false
    }

    /// Single result set calculation; with `out == None` only the value count is computed
    fn calculate_metric_values(
        &self,
        calculation: CalculationType,
        raw: &[u8],
        out: Option<&mut Vec<TypedValue>>,
    ) -> Result<u32>;

    /// Calculation over plain or packed raw data; with `out == None` only the counts are computed
    fn calculate_multiple_metric_values(
        &self,
        calculation: CalculationType,
        raw: &[u8],
        out: Option<&mut CalculatedValues>,
    ) -> Result<CalculationCounts>;

    /// Export envelope size (`out == None`) or encode it into `out`
    fn get_export_data(&self, _raw: &[u8], _out: Option<&mut [u8]>) -> Result<usize> {
        Err(MetricsError::unsupported("export data is not available for this metric group"))
    }

    fn metric_query_pool_create(
        self: Arc<Self>,
        _device: &Arc<Device>,
        _desc: &MetricQueryPoolDesc,
    ) -> Result<MetricQueryPool> {
        Err(MetricsError::unsupported("metric group does not support query pools"))
    }

    fn metric_streamer_open(
        self: Arc<Self>,
        _device: &Arc<Device>,
        _desc: &mut MetricStreamerDesc,
        _event: Option<EventHandle>,
    ) -> Result<MetricStreamer> {
        Err(MetricsError::unsupported("metric group does not support streamers"))
    }

    fn as_any(&self) -> &dyn Any;
}

pub type MetricGroupHandle = Arc<dyn MetricGroup>;

/// API mask selecting the metric-set view for a sampling type
pub(crate) fn api_mask_for(sampling: SamplingType) -> u32 {
    match sampling {
        SamplingType::TimeBased => api_mask::IOSTREAM,
        SamplingType::EventBased => api_mask::OCL | api_mask::OGL4_X,
    }
}

fn same_object<T: Metric>(concrete: &Arc<T>, handle: &MetricHandle) -> bool {
    std::ptr::eq(Arc::as_ptr(concrete) as *const (), Arc::as_ptr(handle) as *const ())
}

/// An OA group in either shape
#[derive(Clone)]
pub(crate) enum OaGroupRef {
    Device(Arc<OaMetricGroup>),
    MultiDevice(Arc<MultiDeviceMetricGroup>),
}

impl OaGroupRef {
    pub fn handle(&self) -> MetricGroupHandle {
        match self {
            OaGroupRef::Device(g) => g.clone(),
            OaGroupRef::MultiDevice(g) => g.clone(),
        }
    }

    pub fn id(&self) -> GroupId {
        match self {
            OaGroupRef::Device(g) => g.id,
            OaGroupRef::MultiDevice(g) => g.id,
        }
    }

    pub fn properties(&self) -> &MetricGroupProperties {
        match self {
            OaGroupRef::Device(g) => &g.properties,
            OaGroupRef::MultiDevice(g) => &g.properties,
        }
    }

    pub fn device(&self) -> Option<Arc<Device>> {
        match self {
            OaGroupRef::Device(g) => g.device.upgrade(),
            OaGroupRef::MultiDevice(g) => g.device.upgrade(),
        }
    }

    pub fn source(&self) -> Result<Arc<OaMetricSource>> {
        let source = match self {
            OaGroupRef::Device(g) => &g.source,
            OaGroupRef::MultiDevice(g) => &g.source,
        };
        source
            .upgrade()
            .ok_or_else(|| MetricsError::Uninitialized("metric source is gone".into()))
    }

    /// Device-level groups doing the hardware work, in subdevice order
    pub fn parts(&self) -> Vec<Arc<OaMetricGroup>> {
        match self {
            OaGroupRef::Device(g) => vec![g.clone()],
            OaGroupRef::MultiDevice(g) => g.sub_groups.clone(),
        }
    }

    pub fn is_multi_device(&self) -> bool {
        matches!(self, OaGroupRef::MultiDevice(_))
    }
}

/// Decode packed parts, each with its own group
fn calculate_packed(
    groups: &[&OaMetricGroup],
    packed: &PackedRawData<'_>,
    calculation: CalculationType,
    mut out: Option<&mut CalculatedValues>,
) -> Result<CalculationCounts> {
    let mut counts = CalculationCounts::default();
    for (i, group) in groups.iter().enumerate() {
        let part = packed
            .part(i)
            .ok_or_else(|| MetricsError::invalid_argument(format!("packed data has no part {}", i)))?;
        let reports = group.report_count(part.len())?;
        counts.data_count += reports;
        counts.total_metric_count += reports * group.properties.metric_count;

        if let Some(out) = out.as_deref_mut() {
            group.decode_sets(calculation, part, out)?;
        }
    }
    Ok(counts)
}

pub struct OaMetricGroup {
    id: GroupId,
    properties: MetricGroupProperties,
    metrics: Vec<Arc<OaMetric>>,
    metric_set: Arc<dyn MetricSet>,
    concurrent_group: Arc<dyn ConcurrentGroup>,
    raw_report_size: u32,
    query_report_size: u32,
    source: Weak<OaMetricSource>,
    source_id: SourceId,
    device: Weak<Device>,
}

impl fmt::Debug for OaMetricGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OaMetricGroup")
            .field("id", &self.id)
            .field("name", &self.properties.name)
            .field("sampling", &self.properties.sampling_type)
            .finish()
    }
}

impl OaMetricGroup {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        properties: MetricGroupProperties,
        metrics: Vec<Arc<OaMetric>>,
        metric_set: Arc<dyn MetricSet>,
        concurrent_group: Arc<dyn ConcurrentGroup>,
        raw_report_size: u32,
        query_report_size: u32,
        source: Weak<OaMetricSource>,
        source_id: SourceId,
        device: Weak<Device>,
    ) -> Self {
        Self {
            id: GroupId::next(),
            properties,
            metrics,
            metric_set,
            concurrent_group,
            raw_report_size,
            query_report_size,
            source,
            source_id,
            device,
        }
    }

    pub fn metric_set(&self) -> &Arc<dyn MetricSet> {
        &self.metric_set
    }

    pub fn concurrent_group(&self) -> &Arc<dyn ConcurrentGroup> {
        &self.concurrent_group
    }

    /// Size of one raw report as produced for this group's sampling type
    pub fn raw_report_size(&self) -> u32 {
        self.raw_report_size
    }

    pub(crate) fn source(&self) -> Result<Arc<OaMetricSource>> {
        self.source
            .upgrade()
            .ok_or_else(|| MetricsError::Uninitialized("metric source is gone".into()))
    }

    pub(crate) fn holds_metric(&self, metric: &MetricHandle) -> bool {
        self.metrics.iter().any(|m| same_object(m, metric))
    }

    fn report_count(&self, raw_size: usize) -> Result<u32> {
        let report_size = self.raw_report_size as usize;
        if report_size == 0 || raw_size % report_size != 0 {
            return Err(MetricsError::unknown(format!(
                "{} bytes of raw data is not a whole number of {} byte reports",
                raw_size, report_size
            )));
        }
        Ok((raw_size / report_size) as u32)
    }

    fn decode(&self, calculation: CalculationType, raw: &[u8]) -> Result<Vec<TypedValue>> {
        let expected = self.report_count(raw.len())? * self.properties.metric_count;

        self.metric_set
            .set_api_filtering(api_mask_for(self.properties.sampling_type));
        let calculated = self
            .metric_set
            .calculate_metrics(raw)
            .map_err(|code| MetricsError::unknown(format!("metric calculation failed: {:?}", code)))?;

        let produced = (calculated.report_count * self.properties.metric_count).min(expected);
        let mut values = match calculation {
            CalculationType::MetricValues => calculated.values,
            CalculationType::MaxMetricValues => calculated.max_values,
        };
        values.truncate(produced as usize);
        Ok(values)
    }

    /// Append one result set per report
    fn decode_sets(&self, calculation: CalculationType, raw: &[u8], out: &mut CalculatedValues) -> Result<()> {
        let metric_count = self.properties.metric_count as usize;
        if metric_count == 0 {
            return Ok(());
        }
        let values = self.decode(calculation, raw)?;
        for report in values.chunks(metric_count) {
            out.push_set(report.to_vec());
        }
        Ok(())
    }

    fn export_data(&self, raw: &[u8]) -> Result<ExportData> {
        let device = self
            .device
            .upgrade()
            .ok_or_else(|| MetricsError::Uninitialized("device is gone".into()))?;
        let metric_set = ExportedMetricSet {
            group: self.properties.clone(),
            metrics: self.metrics.iter().map(|m| m.properties()).collect(),
            raw_report_size: self.raw_report_size,
            query_report_size: self.query_report_size,
        };
        Ok(ExportData::new(
            device.generation().metrics_library_gen_id(),
            metric_set,
            raw.to_vec(),
        ))
    }
}

impl MetricGroup for OaMetricGroup {
    fn id(&self) -> GroupId {
        self.id
    }

    fn properties(&self) -> MetricGroupProperties {
        self.properties.clone()
    }

    fn metrics(&self) -> Vec<MetricHandle> {
        self.metrics.iter().map(|m| m.clone() as MetricHandle).collect()
    }

    fn source_id(&self) -> SourceId {
        self.source_id
    }

    fn source_type(&self) -> SourceType {
        SourceType::Oa
    }

    fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    fn calculate_metric_values(
        &self,
        calculation: CalculationType,
        raw: &[u8],
        out: Option<&mut Vec<TypedValue>>,
    ) -> Result<u32> {
        if MetricGroupCalculateHeader::is_packed(raw) {
            return Err(MetricsError::unknown(
                "packed multi-subdevice data needs calculate_multiple_metric_values",
            ));
        }

        let count = self.report_count(raw.len())? * self.properties.metric_count;
        match out {
            None => Ok(count),
            Some(out) => {
                let values = self.decode(calculation, raw)?;
                let produced = values.len() as u32;
                out.extend(values);
                Ok(produced)
            }
        }
    }

    fn calculate_multiple_metric_values(
        &self,
        calculation: CalculationType,
        raw: &[u8],
        out: Option<&mut CalculatedValues>,
    ) -> Result<CalculationCounts> {
        if MetricGroupCalculateHeader::is_packed(raw) {
            let packed = PackedRawData::parse(raw)?;
            let groups = vec![self; packed.data_count()];
            return calculate_packed(&groups, &packed, calculation, out);
        }

        let total = self.calculate_metric_values(calculation, raw, None)?;
        if let Some(out) = out {
            let values = self.decode(calculation, raw)?;
            out.push_set(values);
        }
        Ok(CalculationCounts {
            data_count: 1,
            total_metric_count: total,
        })
    }

    fn get_export_data(&self, raw: &[u8], out: Option<&mut [u8]>) -> Result<usize> {
        let data = self.export_data(raw)?;
        match out {
            None => data.encoded_size(),
            Some(out) => data.write_into(out),
        }
    }

    fn metric_query_pool_create(
        self: Arc<Self>,
        device: &Arc<Device>,
        desc: &MetricQueryPoolDesc,
    ) -> Result<MetricQueryPool> {
        query::create_performance_pool(device, OaGroupRef::Device(self), desc)
    }

    fn metric_streamer_open(
        self: Arc<Self>,
        device: &Arc<Device>,
        desc: &mut MetricStreamerDesc,
        event: Option<EventHandle>,
    ) -> Result<MetricStreamer> {
        streamer::open_oa(device, OaGroupRef::Device(self), desc, event)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct MultiDeviceMetricGroup {
    id: GroupId,
    properties: MetricGroupProperties,
    metrics: Vec<Arc<MultiDeviceMetric>>,
    sub_groups: Vec<Arc<OaMetricGroup>>,
    source: Weak<OaMetricSource>,
    source_id: SourceId,
    device: Weak<Device>,
}

impl fmt::Debug for MultiDeviceMetricGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiDeviceMetricGroup")
            .field("id", &self.id)
            .field("name", &self.properties.name)
            .field("sub_groups", &self.sub_groups.len())
            .finish()
    }
}

impl MultiDeviceMetricGroup {
    /// Aggregate the groups found at the same index on every subdevice
    pub(crate) fn new(
        sub_groups: Vec<Arc<OaMetricGroup>>,
        source: Weak<OaMetricSource>,
        source_id: SourceId,
        device: Weak<Device>,
    ) -> Option<Self> {
        let first = sub_groups.first()?;
        let properties = first.properties.clone();

        let metrics = (0..first.metrics.len())
            .map(|j| {
                let sub_metrics: Vec<Weak<dyn Metric>> = sub_groups
                    .iter()
                    .filter_map(|g| g.metrics.get(j))
                    .map(|m| {
                        let handle: MetricHandle = m.clone();
                        Arc::downgrade(&handle)
                    })
                    .collect();
                Arc::new(MultiDeviceMetric::new(
                    first.metrics[j].properties(),
                    source_id,
                    device.clone(),
                    sub_metrics,
                ))
            })
            .collect();

        Some(Self {
            id: GroupId::next(),
            properties,
            metrics,
            sub_groups,
            source,
            source_id,
            device,
        })
    }

    pub fn sub_groups(&self) -> &[Arc<OaMetricGroup>] {
        &self.sub_groups
    }

    pub(crate) fn multi_device_metric(&self, metric: &MetricHandle) -> Option<Arc<MultiDeviceMetric>> {
        self.metrics.iter().find(|m| same_object(m, metric)).cloned()
    }
}

impl MetricGroup for MultiDeviceMetricGroup {
    fn id(&self) -> GroupId {
        self.id
    }

    fn properties(&self) -> MetricGroupProperties {
        self.properties.clone()
    }

    fn metrics(&self) -> Vec<MetricHandle> {
        self.metrics.iter().map(|m| m.clone() as MetricHandle).collect()
    }

    fn source_id(&self) -> SourceId {
        self.source_id
    }

    fn source_type(&self) -> SourceType {
        SourceType::Oa
    }

    fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    fn is_multi_device(&self) -> bool {
        true
    }

    fn calculate_metric_values(
        &self,
        _calculation: CalculationType,
        _raw: &[u8],
        _out: Option<&mut Vec<TypedValue>>,
    ) -> Result<u32> {
        Err(MetricsError::unknown(
            "multi-device metric groups need calculate_multiple_metric_values",
        ))
    }

    fn calculate_multiple_metric_values(
        &self,
        calculation: CalculationType,
        raw: &[u8],
        out: Option<&mut CalculatedValues>,
    ) -> Result<CalculationCounts> {
        if !MetricGroupCalculateHeader::is_packed(raw) {
            return Err(MetricsError::unknown(
                "multi-device metric groups expect packed raw data",
            ));
        }
        let packed = PackedRawData::parse(raw)?;
        if packed.data_count() != self.sub_groups.len() {
            return Err(MetricsError::invalid_argument(format!(
                "packed data has {} parts for {} subdevices",
                packed.data_count(),
                self.sub_groups.len()
            )));
        }

        let groups: Vec<&OaMetricGroup> = self.sub_groups.iter().map(|g| g.as_ref()).collect();
        calculate_packed(&groups, &packed, calculation, out)
    }

    fn get_export_data(&self, raw: &[u8], out: Option<&mut [u8]>) -> Result<usize> {
        match self.sub_groups.first() {
            Some(first) => first.get_export_data(raw, out),
            None => Err(MetricsError::unknown("multi-device group without subdevice groups")),
        }
    }

    fn metric_query_pool_create(
        self: Arc<Self>,
        device: &Arc<Device>,
        desc: &MetricQueryPoolDesc,
    ) -> Result<MetricQueryPool> {
        query::create_performance_pool(device, OaGroupRef::MultiDevice(self), desc)
    }

    fn metric_streamer_open(
        self: Arc<Self>,
        device: &Arc<Device>,
        desc: &mut MetricStreamerDesc,
        event: Option<EventHandle>,
    ) -> Result<MetricStreamer> {
        streamer::open_oa(device, OaGroupRef::MultiDevice(self), desc, event)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
