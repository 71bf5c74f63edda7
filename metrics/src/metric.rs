//! Metrics: one named counter or derived value inside a metric group

use crate::device::Device;
use crate::source::SourceId;
use lzmetrics_shared::MetricProperties;
use std::fmt;
use std::sync::{Arc, Weak};

pub trait Metric: Send + Sync + fmt::Debug {
    fn properties(&self) -> MetricProperties;
    fn source_id(&self) -> SourceId;
    fn device(&self) -> Option<Arc<Device>>;

    fn is_multi_device(&self) -> bool {
        false
    }
}

pub type MetricHandle = Arc<dyn Metric>;

/// Identity comparison for metric handles
pub fn same_metric(a: &MetricHandle, b: &MetricHandle) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

pub struct OaMetric {
    properties: MetricProperties,
    source_id: SourceId,
    device: Weak<Device>,
}

impl OaMetric {
    pub fn new(properties: MetricProperties, source_id: SourceId, device: Weak<Device>) -> Self {
        Self {
            properties,
            source_id,
            device,
        }
    }
}

impl fmt::Debug for OaMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OaMetric")
            .field("name", &self.properties.name)
            .field("source", &self.source_id)
            .finish()
    }
}

impl Metric for OaMetric {
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

/// Root-device view of one metric present on every subdevice
///
/// The subdevice metrics are owned by their subdevice groups; only weak
/// references are kept here.
pub struct MultiDeviceMetric {
    properties: MetricProperties,
    source_id: SourceId,
    device: Weak<Device>,
    sub_metrics: Vec<Weak<dyn Metric>>,
}

impl MultiDeviceMetric {
    pub fn new(
        properties: MetricProperties,
        source_id: SourceId,
        device: Weak<Device>,
        sub_metrics: Vec<Weak<dyn Metric>>,
    ) -> Self {
        Self {
            properties,
            source_id,
            device,
            sub_metrics,
        }
    }

    /// Subdevice metrics still alive, in subdevice order
    pub fn sub_metrics(&self) -> Vec<MetricHandle> {
        self.sub_metrics.iter().filter_map(Weak::upgrade).collect()
    }
}

impl fmt::Debug for MultiDeviceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiDeviceMetric")
            .field("name", &self.properties.name)
            .field("sub_metrics", &self.sub_metrics.len())
            .finish()
    }
}

impl Metric for MultiDeviceMetric {
    fn properties(&self) -> MetricProperties {
        self.properties.clone()
    }

    fn source_id(&self) -> SourceId {
        self.source_id
    }

    fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    fn is_multi_device(&self) -> bool {
        true
    }
}
