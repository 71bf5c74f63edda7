//! Per-device metric context
//!
//! Owns the metric sources of one device and routes calls to them. A root
//! context reaches subdevice contexts through the device tree.

use crate::cmdlist::CommandList;
use crate::config::MetricsConfig;
use crate::device::{Device, DeviceServices};
use crate::group::MetricGroupHandle;
use crate::source::ip_sampling::IpSamplingMetricSource;
use crate::source::oa::OaMetricSource;
use crate::source::{MetricSource, MetricSourceHandle, SourceId};
use lzmetrics_shared::{MetricsError, Result};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

pub struct MetricDeviceContext {
    device: Weak<Device>,
    sources: Vec<MetricSourceHandle>,
    deferred_activation: bool,
    enabled: Mutex<bool>,
    is_sub_device: bool,
}

impl MetricDeviceContext {
    pub(crate) fn new(
        device: Weak<Device>,
        services: &Arc<dyn DeviceServices>,
        config: &MetricsConfig,
        implicit_scaling: bool,
        is_sub_device: bool,
    ) -> Self {
        let oa: MetricSourceHandle =
            OaMetricSource::new(device.clone(), services, config, implicit_scaling, is_sub_device);
        let ip: MetricSourceHandle = IpSamplingMetricSource::new(device.clone(), services, implicit_scaling);
        let mut sources = vec![oa, ip];
        sources.extend(services.additional_metric_sources(&device));

        Self {
            device,
            sources,
            deferred_activation: config.deferred_activation,
            enabled: Mutex::new(false),
            is_sub_device,
        }
    }

    fn device(&self) -> Result<Arc<Device>> {
        self.device
            .upgrade()
            .ok_or_else(|| MetricsError::Uninitialized("device is gone".into()))
    }

    /// Source of concrete type `T`, if this device has one
    pub fn metric_source<T: MetricSource + 'static>(&self) -> Option<Arc<T>> {
        self.sources
            .iter()
            .find_map(|source| source.clone().into_any().downcast::<T>().ok())
    }

    pub fn sources(&self) -> &[MetricSourceHandle] {
        &self.sources
    }

    pub fn source_by_id(&self, id: SourceId) -> Option<MetricSourceHandle> {
        self.sources.iter().find(|s| s.id() == id).cloned()
    }

    pub fn is_sub_device(&self) -> bool {
        self.is_sub_device
    }

    pub fn is_metrics_enabled(&self) -> bool {
        *self.enabled.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enable every available source once; later calls are no-ops
    pub fn enable_metrics(&self) -> Result<()> {
        let mut enabled = self.enabled.lock().unwrap_or_else(|e| e.into_inner());
        if *enabled {
            return Ok(());
        }

        let available: Vec<&MetricSourceHandle> = self.sources.iter().filter(|s| s.is_available()).collect();
        if available.is_empty() {
            return Err(MetricsError::DependencyUnavailable(
                "no metric source is available on this device".into(),
            ));
        }
        for source in available {
            source.enable()?;
        }

        let device = self.device()?;
        for sub in device.sub_devices() {
            if let Err(e) = sub.metric_context().enable_metrics() {
                warn!(sub_device = sub.physical_sub_device_id(), error = %e, "metrics not enabled on subdevice");
            }
        }

        *enabled = true;
        info!(device = device.name(), "metrics enabled");
        Ok(())
    }

    pub fn metric_group_get(&self) -> Result<Vec<MetricGroupHandle>> {
        let mut groups = Vec::new();
        for source in self.sources.iter().filter(|s| s.is_available()) {
            groups.extend(source.metric_group_get()?);
        }
        Ok(groups)
    }

    /// Replace the activated groups of every source on this device
    pub fn activate_metric_groups(&self, groups: &[MetricGroupHandle]) -> Result<()> {
        let device = self.device()?;
        for group in groups {
            let owned = matches!(group.device(), Some(d) if Arc::ptr_eq(&d, &device));
            if !owned {
                return Err(MetricsError::invalid_argument(format!(
                    "metric group {} does not belong to device {}",
                    group.properties().name,
                    device.name()
                )));
            }
            if self.source_by_id(group.source_id()).is_none() {
                return Err(MetricsError::invalid_argument(format!(
                    "metric group {} has no source on device {}",
                    group.properties().name,
                    device.name()
                )));
            }
        }

        self.check_co_activation(groups)?;

        let mut done: Vec<(&MetricSourceHandle, _)> = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let requested: Vec<MetricGroupHandle> = groups
                .iter()
                .filter(|g| g.source_id() == source.id())
                .cloned()
                .collect();

            let snapshot = source.snapshot_activation();
            if let Err(e) = source.activate(&requested, self.deferred_activation) {
                warn!(source = %source.source_type(), error = %e, "activation failed, rolling back");
                for (previous, snapshot) in done.into_iter().rev() {
                    if let Err(rollback) = previous.restore_activation(snapshot) {
                        warn!(source = %previous.source_type(), error = %rollback, "activation rollback failed");
                    }
                }
                return Err(e);
            }
            done.push((source, snapshot));
        }

        debug!(
            device = device.name(),
            groups = groups.len(),
            deferred = self.deferred_activation,
            "metric groups activated"
        );
        Ok(())
    }

    /// Every pair of sources named by `groups` must agree to be active together
    fn check_co_activation(&self, groups: &[MetricGroupHandle]) -> Result<()> {
        let mut involved: Vec<&MetricSourceHandle> = Vec::new();
        for group in groups {
            if let Some(source) = self.sources.iter().find(|s| s.id() == group.source_id()) {
                if !involved.iter().any(|s| s.id() == source.id()) {
                    involved.push(source);
                }
            }
        }

        for (i, first) in involved.iter().enumerate() {
            for second in &involved[i + 1..] {
                if !first.can_activate_with(second.source_type()) || !second.can_activate_with(first.source_type()) {
                    return Err(MetricsError::unsupported(format!(
                        "{} and {} metric groups cannot be activated together",
                        first.source_type(),
                        second.source_type()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Push deferred activations of every source to hardware
    pub fn activate_already_deferred(&self) -> Result<()> {
        for source in &self.sources {
            source.activate_already_deferred()?;
        }
        Ok(())
    }

    pub fn append_metric_memory_barrier(&self, cmd: &mut dyn CommandList) -> Result<()> {
        let available: Vec<&MetricSourceHandle> = self.sources.iter().filter(|s| s.is_available()).collect();
        if available.is_empty() {
            return Err(MetricsError::unsupported("no metric source supports memory barriers here"));
        }
        let mut appended = 0;
        for source in available {
            match source.append_metric_memory_barrier(cmd) {
                Ok(()) => appended += 1,
                Err(MetricsError::UnsupportedFeature(reason)) => {
                    debug!(source = %source.source_type(), %reason, "source has no memory barrier");
                }
                Err(e) => return Err(e),
            }
        }
        if appended == 0 {
            return Err(MetricsError::unsupported("no metric source supports memory barriers here"));
        }
        Ok(())
    }
}
