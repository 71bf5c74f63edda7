//! Calculation operations
//!
//! A calculation operation fixes a set of metric groups from one source and
//! one device, optionally minus some of their metrics, and turns raw data
//! for each group into result sets.

use crate::device::Device;
use crate::group::MetricGroupHandle;
use crate::metric::{same_metric, MetricHandle};
use lzmetrics_shared::{CalculatedValues, CalculationType, MetricsError, Result};
use std::sync::Arc;
use tracing::debug;

pub struct MetricCalculateOperation {
    groups: Vec<MetricGroupHandle>,
    /// Per group, whether each metric is reported
    included: Vec<Vec<bool>>,
    report_metrics: Vec<MetricHandle>,
}

impl std::fmt::Debug for MetricCalculateOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricCalculateOperation")
            .field("groups", &self.groups.len())
            .field("report_metrics", &self.report_metrics.len())
            .finish()
    }
}

impl MetricCalculateOperation {
    pub fn create(
        device: &Arc<Device>,
        groups: &[MetricGroupHandle],
        excluded: &[MetricHandle],
    ) -> Result<Self> {
        let first = groups
            .first()
            .ok_or_else(|| MetricsError::invalid_argument("calculation needs at least one metric group"))?;

        for group in groups {
            if group.source_id() != first.source_id() {
                return Err(MetricsError::invalid_argument(
                    "metric groups of a calculation must come from one source",
                ));
            }
            if !matches!(group.device(), Some(d) if Arc::ptr_eq(&d, device)) {
                return Err(MetricsError::invalid_argument(
                    "metric groups of a calculation must belong to the calculating device",
                ));
            }
        }

        let source = device
            .metric_context()
            .source_by_id(first.source_id())
            .ok_or_else(|| MetricsError::invalid_argument("metric group source is not on this device"))?;
        if !source.supports_calculation_operations() {
            return Err(MetricsError::unsupported(format!(
                "{} source does not support calculation operations",
                source.source_type()
            )));
        }

        let group_metrics: Vec<Vec<MetricHandle>> = groups.iter().map(|g| g.metrics()).collect();
        for metric in excluded {
            let member = group_metrics.iter().flatten().any(|m| same_metric(m, metric));
            if !member {
                return Err(MetricsError::invalid_argument(format!(
                    "excluded metric {} is not in any calculated group",
                    metric.properties().name
                )));
            }
        }

        let included: Vec<Vec<bool>> = group_metrics
            .iter()
            .map(|metrics| {
                metrics
                    .iter()
                    .map(|m| !excluded.iter().any(|e| same_metric(m, e)))
                    .collect()
            })
            .collect();
        let report_metrics = group_metrics
            .iter()
            .zip(&included)
            .flat_map(|(metrics, keep)| {
                metrics
                    .iter()
                    .zip(keep)
                    .filter(|(_, keep)| **keep)
                    .map(|(m, _)| m.clone())
            })
            .collect();

        debug!(groups = groups.len(), excluded = excluded.len(), "calculation operation created");
        Ok(Self {
            groups: groups.to_vec(),
            included,
            report_metrics,
        })
    }

    pub fn groups(&self) -> &[MetricGroupHandle] {
        &self.groups
    }

    /// Metrics present in every result set, in group order
    pub fn report_metrics(&self) -> &[MetricHandle] {
        &self.report_metrics
    }

    /// Calculate `raw[i]` with `groups[i]`; result sets of all groups are concatenated.
    /// A set holding several reports back to back is filtered report by report.
    pub fn calculate(&self, raw: &[&[u8]]) -> Result<CalculatedValues> {
        if raw.len() != self.groups.len() {
            return Err(MetricsError::invalid_argument(format!(
                "{} raw buffers for {} metric groups",
                raw.len(),
                self.groups.len()
            )));
        }

        let mut out = CalculatedValues::default();
        for ((group, data), keep) in self.groups.iter().zip(raw).zip(&self.included) {
            let mut values = CalculatedValues::default();
            group.calculate_multiple_metric_values(CalculationType::MetricValues, data, Some(&mut values))?;

            for set in values.sets() {
                let filtered = set
                    .iter()
                    .zip(keep.iter().cycle())
                    .filter(|(_, keep)| **keep)
                    .map(|(v, _)| *v)
                    .collect();
                out.push_set(filtered);
            }
        }
        Ok(out)
    }

    pub fn destroy(self) -> Result<()> {
        Ok(())
    }
}
