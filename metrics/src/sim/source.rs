//! Mock metric source
//!
//! Mock sources register through `DeviceServices::additional_metric_sources`
//! like any real secondary provider. Their raw data is a flat array of
//! little-endian u64 values, one per metric per result set.

use crate::cmdlist::CommandList;
use crate::device::Device;
use crate::group::{CalculationCounts, GroupId, MetricGroup, MetricGroupHandle};
use crate::metric::{Metric, MetricHandle};
use crate::source::activation::{ActivationEvent, ActivationTracker};
use crate::source::{ActivationSnapshot, MetricSource, SourceId, SourceType};
use lzmetrics_shared::{
    CalculatedValues, CalculationType, MetricGroupProperties, MetricProperties, MetricType, MetricsError,
    Result, SamplingType, TypedValue, ValueType,
};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::debug;

/// Domain used by mock groups
pub const MOCK_DOMAIN: u32 = 8;

#[derive(Debug)]
pub struct MockMetric {
    properties: MetricProperties,
    source_id: SourceId,
    device: Weak<Device>,
}

impl MockMetric {
    pub fn new(name: &str, source_id: SourceId, device: Weak<Device>) -> Self {
        Self {
            properties: MetricProperties {
                name: name.to_string(),
                description: format!("{} (mock)", name),
                component: "Mock".to_string(),
                tier_number: 1,
                metric_type: MetricType::Event,
                result_type: ValueType::Uint64,
                result_units: "events".to_string(),
            },
            source_id,
            device,
        }
    }
}

impl Metric for MockMetric {
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

pub struct MockMetricGroup {
    id: GroupId,
    properties: MetricGroupProperties,
    metrics: Vec<MetricHandle>,
    source_id: SourceId,
    source_type: SourceType,
    device: Weak<Device>,
}

impl fmt::Debug for MockMetricGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockMetricGroup")
            .field("id", &self.id)
            .field("name", &self.properties.name)
            .finish()
    }
}

impl MockMetricGroup {
    /// Detached group with two metrics
    pub fn new(name: &str, domain: u32, source_id: SourceId) -> Self {
        Self::on_device(name, domain, SourceType::Mock, source_id, Weak::new(), SamplingType::EventBased)
    }

    pub fn on_device(
        name: &str,
        domain: u32,
        source_type: SourceType,
        source_id: SourceId,
        device: Weak<Device>,
        sampling_type: SamplingType,
    ) -> Self {
        let metrics: Vec<MetricHandle> = ["Count", "Cycles"]
            .iter()
            .map(|m| Arc::new(MockMetric::new(&format!("{}{}", name, m), source_id, device.clone())) as MetricHandle)
            .collect();
        Self::with_metrics(name, domain, source_type, source_id, device, sampling_type, metrics)
    }

    fn with_metrics(
        name: &str,
        domain: u32,
        source_type: SourceType,
        source_id: SourceId,
        device: Weak<Device>,
        sampling_type: SamplingType,
        metrics: Vec<MetricHandle>,
    ) -> Self {
        Self {
            id: GroupId::next(),
            properties: MetricGroupProperties {
                name: name.to_string(),
                description: format!("{} ({})", name, source_type),
                sampling_type,
                domain,
                metric_count: metrics.len() as u32,
            },
            metrics,
            source_id,
            source_type,
            device,
        }
    }

    fn decode(&self, raw: &[u8]) -> Result<Vec<Vec<TypedValue>>> {
        let per_set = self.metrics.len() * 8;
        if per_set == 0 || raw.len() % per_set != 0 {
            return Err(MetricsError::invalid_argument(format!(
                "{} bytes is not a whole number of {} byte result sets",
                raw.len(),
                per_set
            )));
        }
        Ok(raw
            .chunks_exact(per_set)
            .map(|set| {
                set.chunks_exact(8)
                    .map(|v| {
                        let mut bytes = [0u8; 8];
                        bytes.copy_from_slice(v);
                        TypedValue::Uint64(u64::from_le_bytes(bytes))
                    })
                    .collect()
            })
            .collect())
    }
}

impl MetricGroup for MockMetricGroup {
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
        self.source_type
    }

    fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    fn calculate_metric_values(
        &self,
        _calculation: CalculationType,
        raw: &[u8],
        out: Option<&mut Vec<TypedValue>>,
    ) -> Result<u32> {
        let sets = self.decode(raw)?;
        let count = sets.iter().map(Vec::len).sum::<usize>() as u32;
        if let Some(out) = out {
            out.clear();
            out.extend(sets.into_iter().flatten());
        }
        Ok(count)
    }

    fn calculate_multiple_metric_values(
        &self,
        _calculation: CalculationType,
        raw: &[u8],
        out: Option<&mut CalculatedValues>,
    ) -> Result<CalculationCounts> {
        let sets = self.decode(raw)?;
        let counts = CalculationCounts {
            data_count: sets.len() as u32,
            total_metric_count: sets.iter().map(Vec::len).sum::<usize>() as u32,
        };
        if let Some(out) = out {
            for set in sets {
                out.push_set(set);
            }
        }
        Ok(counts)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// How a mock source behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockSourceOptions {
    pub available: bool,
    /// Groups can feed calculation operations
    pub calculation_operations: bool,
    /// Groups cannot be active together with groups of another source
    pub exclusive: bool,
}

impl Default for MockSourceOptions {
    fn default() -> Self {
        Self {
            available: true,
            calculation_operations: true,
            exclusive: false,
        }
    }
}

pub struct MockMetricSource {
    id: SourceId,
    options: MockSourceOptions,
    device: Weak<Device>,
    groups: Vec<MetricGroupHandle>,
    tracker: Mutex<ActivationTracker>,
    enable_calls: AtomicU32,
    barrier_calls: AtomicU32,
}

impl MockMetricSource {
    pub fn new(device: &Weak<Device>, options: MockSourceOptions) -> Arc<Self> {
        let id = SourceId::next();
        let group: MetricGroupHandle = Arc::new(MockMetricGroup::on_device(
            "MockCounters",
            MOCK_DOMAIN,
            SourceType::Mock,
            id,
            device.clone(),
            SamplingType::EventBased,
        ));

        Arc::new(Self {
            id,
            options,
            device: device.clone(),
            groups: vec![group],
            tracker: Mutex::new(ActivationTracker::default()),
            enable_calls: AtomicU32::new(0),
            barrier_calls: AtomicU32::new(0),
        })
    }

    fn tracker(&self) -> MutexGuard<'_, ActivationTracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enable_calls(&self) -> u32 {
        self.enable_calls.load(Ordering::SeqCst)
    }

    pub fn barrier_calls(&self) -> u32 {
        self.barrier_calls.load(Ordering::SeqCst)
    }

    /// Groups committed to the (pretend) hardware
    pub fn committed(&self) -> Vec<MetricGroupHandle> {
        self.tracker().committed().to_vec()
    }
}

impl MetricSource for MockMetricSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn source_type(&self) -> SourceType {
        SourceType::Mock
    }

    fn enable(&self) -> Result<()> {
        if !self.options.available {
            return Err(MetricsError::DependencyUnavailable("mock source".into()));
        }
        self.enable_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.options.available
    }

    fn metric_group_get(&self) -> Result<Vec<MetricGroupHandle>> {
        Ok(self.groups.clone())
    }

    fn append_metric_memory_barrier(&self, _cmd: &mut dyn CommandList) -> Result<()> {
        self.barrier_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn activate(&self, groups: &[MetricGroupHandle], deferred: bool) -> Result<()> {
        if let Some(foreign) = groups.iter().find(|g| g.source_id() != self.id) {
            return Err(MetricsError::invalid_argument(format!(
                "metric group {} is not from this mock source",
                foreign.properties().name
            )));
        }
        let commit = self.tracker().transition(ActivationEvent::Request {
            groups: groups.to_vec(),
            deferred,
        })?;
        debug!(source = ?self.id, committed = commit.is_some(), "mock activation");
        Ok(())
    }

    fn activate_already_deferred(&self) -> Result<()> {
        self.tracker().transition(ActivationEvent::Trigger)?;
        Ok(())
    }

    fn snapshot_activation(&self) -> ActivationSnapshot {
        self.tracker().snapshot()
    }

    fn restore_activation(&self, snapshot: ActivationSnapshot) -> Result<()> {
        self.tracker().restore(snapshot);
        Ok(())
    }

    fn create_group_from_metrics(&self, name: &str, metrics: &[MetricHandle]) -> Result<MetricGroupHandle> {
        if metrics.is_empty() {
            return Err(MetricsError::invalid_argument("a metric group needs at least one metric"));
        }
        if metrics.iter().any(|m| m.source_id() != self.id) {
            return Err(MetricsError::invalid_argument(
                "metrics of a new group must come from one source",
            ));
        }
        let sampling = self.groups[0].properties().sampling_type;
        Ok(Arc::new(MockMetricGroup::with_metrics(
            name,
            MOCK_DOMAIN,
            SourceType::Mock,
            self.id,
            self.device.clone(),
            sampling,
            metrics.to_vec(),
        )))
    }

    fn supports_calculation_operations(&self) -> bool {
        self.options.calculation_operations
    }

    fn can_activate_with(&self, other: SourceType) -> bool {
        !self.options.exclusive || other == SourceType::Mock
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
