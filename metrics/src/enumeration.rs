//! Metric group discovery
//!
//! Walks the hardware description once per source and caches the resulting
//! groups. Root sources under implicit scaling do not read hardware
//! themselves; they aggregate the groups their subdevices found.

use crate::discovery::{
    api_mask, usage_flag, DiscoveryMetricType, DiscoveryResultType, InformationParams, InformationType,
    MetricParams, MetricSet, MetricsDiscoveryDevice, OA_CONCURRENT_GROUP, ConcurrentGroup,
};
use crate::group::{api_mask_for, MultiDeviceMetricGroup, OaMetricGroup};
use crate::metric::OaMetric;
use crate::source::oa::OaMetricSource;
use crate::source::MetricSource;
use lzmetrics_shared::{
    MetricGroupProperties, MetricProperties, MetricType, MetricsError, Result, SamplingType, ValueType,
};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub(crate) enum EnumeratedGroups {
    Device(Vec<Arc<OaMetricGroup>>),
    MultiDevice(Vec<Arc<MultiDeviceMetricGroup>>),
}

enum EnumerationState {
    Uninitialized,
    Ready(EnumeratedGroups),
    Failed,
}

pub struct MetricEnumeration {
    discovery: Option<Arc<dyn MetricsDiscoveryDevice>>,
    state: Mutex<EnumerationState>,
}

impl MetricEnumeration {
    pub fn new(discovery: Option<Arc<dyn MetricsDiscoveryDevice>>) -> Self {
        Self {
            discovery,
            state: Mutex::new(EnumerationState::Uninitialized),
        }
    }

    /// The hardware-description library is present
    pub fn is_loaded(&self) -> bool {
        self.discovery.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, EnumerationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enumerate on first use; a failed attempt is not retried
    pub(crate) fn is_initialized(&self, source: &OaMetricSource) -> bool {
        self.groups(source).is_ok()
    }

    pub(crate) fn groups(&self, source: &OaMetricSource) -> Result<EnumeratedGroups> {
        let mut state = self.lock();
        match &*state {
            EnumerationState::Ready(groups) => return Ok(groups.clone()),
            EnumerationState::Failed => {
                return Err(MetricsError::unsupported("metric enumeration failed on this device"))
            }
            EnumerationState::Uninitialized => {}
        }

        match self.enumerate(source) {
            Ok(groups) => {
                *state = EnumerationState::Ready(groups.clone());
                Ok(groups)
            }
            Err(e) => {
                warn!(error = %e, "metric enumeration failed");
                *state = EnumerationState::Failed;
                Err(MetricsError::unsupported(e.to_string()))
            }
        }
    }

    /// Device-level groups; empty for an implicit-scaling root
    pub(crate) fn device_groups(&self, source: &OaMetricSource) -> Result<Vec<Arc<OaMetricGroup>>> {
        match self.groups(source)? {
            EnumeratedGroups::Device(groups) => Ok(groups),
            EnumeratedGroups::MultiDevice(_) => Ok(Vec::new()),
        }
    }

    fn enumerate(&self, source: &OaMetricSource) -> Result<EnumeratedGroups> {
        if source.is_implicit_scaling_root() {
            return self.aggregate_sub_devices(source);
        }

        let discovery = self
            .discovery
            .as_ref()
            .ok_or_else(|| MetricsError::DependencyUnavailable("hardware description library not loaded".into()))?;

        let version = discovery.version();
        if !version.is_supported() {
            return Err(MetricsError::unsupported(format!(
                "hardware description API {}.{} is older than required {}.{}",
                version.major,
                version.minor,
                crate::discovery::ApiVersion::REQUIRED.major,
                crate::discovery::ApiVersion::REQUIRED.minor
            )));
        }

        let mut groups = Vec::new();
        for domain in 0..discovery.concurrent_group_count() {
            let Some(concurrent_group) = discovery.concurrent_group(domain) else {
                continue;
            };
            if concurrent_group.symbol_name() != OA_CONCURRENT_GROUP {
                continue;
            }

            for index in 0..concurrent_group.metric_set_count() {
                let Some(metric_set) = concurrent_group.metric_set(index) else {
                    continue;
                };
                let mask = metric_set.params().api_mask;

                if mask & api_mask::IOSTREAM != 0 {
                    groups.push(cache_group(source, &concurrent_group, &metric_set, domain, SamplingType::TimeBased));
                }
                if mask & (api_mask::OCL | api_mask::OGL4_X) != 0 {
                    groups.push(cache_group(source, &concurrent_group, &metric_set, domain, SamplingType::EventBased));
                }
            }
        }

        info!(groups = groups.len(), "metric groups enumerated");
        Ok(EnumeratedGroups::Device(groups))
    }

    fn aggregate_sub_devices(&self, source: &OaMetricSource) -> Result<EnumeratedGroups> {
        let per_sub_device = source
            .sub_sources()
            .iter()
            .map(|sub| sub.enumeration().device_groups(sub))
            .collect::<Result<Vec<_>>>()?;

        let count = per_sub_device.iter().map(Vec::len).min().unwrap_or(0);
        let groups: Vec<Arc<MultiDeviceMetricGroup>> = (0..count)
            .filter_map(|i| {
                let sub_groups = per_sub_device.iter().map(|groups| groups[i].clone()).collect();
                MultiDeviceMetricGroup::new(sub_groups, source.weak(), source.id(), source.device_weak())
                    .map(Arc::new)
            })
            .collect();

        debug!(groups = groups.len(), sub_devices = per_sub_device.len(), "multi-device metric groups built");
        Ok(EnumeratedGroups::MultiDevice(groups))
    }
}

/// Read one metric set through the API filter of `sampling`
pub(crate) fn cache_group(
    source: &OaMetricSource,
    concurrent_group: &Arc<dyn ConcurrentGroup>,
    metric_set: &Arc<dyn MetricSet>,
    domain: u32,
    sampling: SamplingType,
) -> Arc<OaMetricGroup> {
    metric_set.set_api_filtering(api_mask_for(sampling));
    let params = metric_set.params();

    let mut metrics = Vec::with_capacity((params.metrics_count + params.information_count) as usize);
    metrics.extend(
        (0..params.metrics_count)
            .filter_map(|i| metric_set.metric(i))
            .map(|p| metric_properties(&p)),
    );
    metrics.extend(
        (0..params.information_count)
            .filter_map(|i| metric_set.information(i))
            .map(|p| information_properties(&p)),
    );
    metric_set.set_api_filtering(api_mask::ALL);

    let properties = MetricGroupProperties {
        name: params.symbol_name.clone(),
        description: params.short_name.clone(),
        sampling_type: sampling,
        domain,
        metric_count: metrics.len() as u32,
    };
    let raw_report_size = match sampling {
        SamplingType::TimeBased => params.raw_report_size,
        SamplingType::EventBased => params.query_report_size,
    };

    let metrics = metrics
        .into_iter()
        .map(|props| Arc::new(OaMetric::new(props, source.id(), source.device_weak())))
        .collect();

    Arc::new(OaMetricGroup::new(
        properties,
        metrics,
        metric_set.clone(),
        concurrent_group.clone(),
        raw_report_size,
        params.query_report_size,
        source.weak(),
        source.id(),
        source.device_weak(),
    ))
}

pub(crate) fn tier_number(usage_flags: u32) -> u32 {
    if usage_flags & usage_flag::TIER_1 != 0 {
        1
    } else if usage_flags & usage_flag::TIER_2 != 0 {
        2
    } else if usage_flags & usage_flag::TIER_3 != 0 {
        3
    } else if usage_flags & usage_flag::TIER_4 != 0 {
        4
    } else {
        0
    }
}

fn metric_type(t: DiscoveryMetricType) -> MetricType {
    match t {
        DiscoveryMetricType::Duration => MetricType::Duration,
        DiscoveryMetricType::Event => MetricType::Event,
        DiscoveryMetricType::EventWithRange => MetricType::EventWithRange,
        DiscoveryMetricType::Throughput => MetricType::Throughput,
        DiscoveryMetricType::Timestamp => MetricType::Timestamp,
        DiscoveryMetricType::Flag => MetricType::Flag,
        DiscoveryMetricType::Ratio => MetricType::Ratio,
        DiscoveryMetricType::Raw => MetricType::Raw,
    }
}

fn result_type(t: DiscoveryResultType) -> ValueType {
    match t {
        DiscoveryResultType::Uint32 => ValueType::Uint32,
        DiscoveryResultType::Uint64 => ValueType::Uint64,
        DiscoveryResultType::Bool => ValueType::Bool8,
        DiscoveryResultType::Float => ValueType::Float32,
    }
}

pub(crate) fn metric_properties(params: &MetricParams) -> MetricProperties {
    MetricProperties {
        name: params.symbol_name.clone(),
        description: params.long_name.clone(),
        component: params.group_name.clone(),
        tier_number: tier_number(params.usage_flags),
        metric_type: metric_type(params.metric_type),
        result_type: result_type(params.result_type),
        result_units: params.units.clone(),
    }
}

pub(crate) fn information_properties(params: &InformationParams) -> MetricProperties {
    let metric_type = match params.info_type {
        InformationType::ReportReason => MetricType::Event,
        InformationType::Value
        | InformationType::ContextIdTag
        | InformationType::SamplePhase
        | InformationType::GpuNode => MetricType::Raw,
        InformationType::Flag => MetricType::Flag,
        InformationType::Timestamp => MetricType::Timestamp,
    };
    let result_type = if params.info_type == InformationType::Flag {
        ValueType::Bool8
    } else {
        ValueType::Uint64
    };

    MetricProperties {
        name: params.symbol_name.clone(),
        description: params.long_name.clone(),
        component: params.group_name.clone(),
        tier_number: 1,
        metric_type,
        result_type,
        result_units: params.units.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_number_prefers_lowest_tier() {
        assert_eq!(tier_number(usage_flag::TIER_1 | usage_flag::TIER_3), 1);
        assert_eq!(tier_number(usage_flag::TIER_2), 2);
        assert_eq!(tier_number(usage_flag::TIER_3 | usage_flag::TIER_4), 3);
        assert_eq!(tier_number(usage_flag::TIER_4), 4);
        assert_eq!(tier_number(0), 0);
    }

    #[test]
    fn test_information_mapping() {
        let info = |info_type| InformationParams {
            symbol_name: "QueryBeginTime".into(),
            long_name: "Query begin timestamp".into(),
            group_name: "GPU".into(),
            units: "ns".into(),
            info_type,
        };

        let flag = information_properties(&info(InformationType::Flag));
        assert_eq!(flag.metric_type, MetricType::Flag);
        assert_eq!(flag.result_type, ValueType::Bool8);
        assert_eq!(flag.tier_number, 1);

        let reason = information_properties(&info(InformationType::ReportReason));
        assert_eq!(reason.metric_type, MetricType::Event);
        assert_eq!(reason.result_type, ValueType::Uint64);

        for raw in [
            InformationType::Value,
            InformationType::ContextIdTag,
            InformationType::SamplePhase,
            InformationType::GpuNode,
        ] {
            assert_eq!(information_properties(&info(raw)).metric_type, MetricType::Raw);
        }
        assert_eq!(
            information_properties(&info(InformationType::Timestamp)).metric_type,
            MetricType::Timestamp
        );
    }

    #[test]
    fn test_metric_mapping() {
        let params = MetricParams {
            symbol_name: "GpuBusy".into(),
            long_name: "GPU busy".into(),
            group_name: "GPU".into(),
            units: "percent".into(),
            usage_flags: usage_flag::TIER_2,
            metric_type: DiscoveryMetricType::Ratio,
            result_type: DiscoveryResultType::Float,
        };
        let props = metric_properties(&params);
        assert_eq!(props.name, "GpuBusy");
        assert_eq!(props.component, "GPU");
        assert_eq!(props.tier_number, 2);
        assert_eq!(props.metric_type, MetricType::Ratio);
        assert_eq!(props.result_type, ValueType::Float32);
    }
}
