//! Metric sources
//!
//! A source is one provider of metric groups on one device. The OA source
//! wraps the counter hardware; other providers plug in through the
//! `MetricSource` trait and are registered by `DeviceServices`.

pub mod activation;
pub mod ip_sampling;
pub mod oa;

use crate::cmdlist::CommandList;
use crate::group::MetricGroupHandle;
use crate::metric::MetricHandle;
use lzmetrics_shared::{MetricsError, Result};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use activation::{ActivationSnapshot, ActivationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    Oa,
    IpSampling,
    Mock,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Oa => write!(f, "Oa"),
            SourceType::IpSampling => write!(f, "IpSampling"),
            SourceType::Mock => write!(f, "Mock"),
        }
    }
}

/// Identity of one source instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SourceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub trait MetricSource: Send + Sync {
    fn id(&self) -> SourceId;
    fn source_type(&self) -> SourceType;

    /// Load whatever the source depends on
    fn enable(&self) -> Result<()>;
    fn is_available(&self) -> bool;

    fn metric_group_get(&self) -> Result<Vec<MetricGroupHandle>>;
    fn append_metric_memory_barrier(&self, cmd: &mut dyn CommandList) -> Result<()>;

    /// Replace the activated groups of this source; an empty list deactivates all
    fn activate(&self, groups: &[MetricGroupHandle], deferred: bool) -> Result<()>;

    /// Push a pending activation to hardware
    fn activate_already_deferred(&self) -> Result<()>;

    fn snapshot_activation(&self) -> ActivationSnapshot;
    fn restore_activation(&self, snapshot: ActivationSnapshot) -> Result<()>;

    fn create_group_from_metrics(&self, _name: &str, _metrics: &[MetricHandle]) -> Result<MetricGroupHandle> {
        Err(MetricsError::unsupported(format!(
            "{} source cannot build metric groups from metrics",
            self.source_type()
        )))
    }

    fn supports_calculation_operations(&self) -> bool {
        false
    }

    /// Whether groups of this source may be active while groups of a
    /// source of type `other` are
    fn can_activate_with(&self, _other: SourceType) -> bool {
        true
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub type MetricSourceHandle = Arc<dyn MetricSource>;
