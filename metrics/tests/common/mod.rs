#![allow(dead_code)]

use lzmetrics::device::Device;
use lzmetrics::sim::library::SimCounterLibrary;
use lzmetrics::sim::SimPlatform;
use lzmetrics::source::oa::OaMetricSource;
use lzmetrics::{MetricGroupHandle, MetricsConfig};
use lzmetrics_shared::SamplingType;
use std::sync::Arc;

pub fn config(deferred_activation: bool) -> MetricsConfig {
    MetricsConfig {
        enable_metrics: false,
        deferred_activation,
        implicit_scaling: true,
        workload_partition: false,
        configuration_caching: false,
        ..MetricsConfig::default()
    }
}

pub fn group(device: &Arc<Device>, name: &str, sampling: SamplingType) -> MetricGroupHandle {
    device
        .metric_context()
        .metric_group_get()
        .unwrap()
        .into_iter()
        .find(|g| {
            let props = g.properties();
            props.name == name && props.sampling_type == sampling
        })
        .unwrap_or_else(|| panic!("no {:?} group named {}", sampling, name))
}

pub fn oa_source(device: &Arc<Device>) -> Arc<OaMetricSource> {
    device
        .metric_context()
        .metric_source::<OaMetricSource>()
        .expect("device has an OA source")
}

pub fn library(platform: &SimPlatform, device: &Arc<Device>) -> Arc<SimCounterLibrary> {
    platform
        .services_for(device)
        .and_then(|s| s.library().cloned())
        .expect("device has a counter library")
}
