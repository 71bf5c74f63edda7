//! OA metric source
//!
//! Binds the counter library and the hardware description of one device.
//! On a root device under implicit scaling the source owns no hardware of
//! its own: activation and barriers are forwarded to the subdevice sources
//! and its groups are multi-device aggregates.

use super::activation::{ActivationEvent, ActivationSnapshot, ActivationTracker, Commit};
use super::{MetricSource, SourceId, SourceType};
use crate::cmdlist::CommandList;
use crate::config::MetricsConfig;
use crate::device::{Device, DeviceServices};
use crate::enumeration::{cache_group, EnumeratedGroups, MetricEnumeration};
use crate::group::{api_mask_for, GroupId, MetricGroup, MetricGroupHandle, MultiDeviceMetricGroup, OaMetricGroup};
use crate::library::api::{CommandBufferKind, GpuCommandBufferType, QueryHandle, StatusCode, SubDeviceClientOptions};
use crate::library::{LibraryEnv, MetricsLibrary};
use crate::metric::MetricHandle;
use crate::telemetry;
use lzmetrics_shared::{MetricsError, Result, ResultCode};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};

struct OaSourceState {
    library: MetricsLibrary,
    activation: ActivationTracker,
    streamer_open: bool,
    lease: Weak<LibraryLease>,
}

pub struct OaMetricSource {
    id: SourceId,
    this: Weak<OaMetricSource>,
    device: Weak<Device>,
    services: Arc<dyn DeviceServices>,
    implicit_scaling: bool,
    enabled: AtomicBool,
    enumeration: MetricEnumeration,
    state: Mutex<OaSourceState>,
}

/// Shared claim on the library context held by query pools
///
/// When the last lease goes away the context is released, provided no
/// library query is left and no configuration is active in hardware.
pub struct LibraryLease {
    source: Arc<OaMetricSource>,
}

impl Drop for LibraryLease {
    fn drop(&mut self) {
        self.source.release_library_if_idle();
    }
}

impl OaMetricSource {
    pub(crate) fn new(
        device: Weak<Device>,
        services: &Arc<dyn DeviceServices>,
        config: &MetricsConfig,
        implicit_scaling: bool,
        is_sub_device: bool,
    ) -> Arc<Self> {
        let mut library = MetricsLibrary::new(services.counter_library(), config.configuration_caching);
        if is_sub_device && config.workload_partition {
            library.enable_workload_partition();
        }

        Arc::new_cyclic(|this| Self {
            id: SourceId::next(),
            this: this.clone(),
            device,
            services: services.clone(),
            implicit_scaling,
            enabled: AtomicBool::new(false),
            enumeration: MetricEnumeration::new(services.metrics_discovery()),
            state: Mutex::new(OaSourceState {
                library,
                activation: ActivationTracker::default(),
                streamer_open: false,
                lease: Weak::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, OaSourceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn weak(&self) -> Weak<OaMetricSource> {
        self.this.clone()
    }

    pub(crate) fn device_weak(&self) -> Weak<Device> {
        self.device.clone()
    }

    pub fn device(&self) -> Result<Arc<Device>> {
        self.device
            .upgrade()
            .ok_or_else(|| MetricsError::Uninitialized("device is gone".into()))
    }

    pub(crate) fn enumeration(&self) -> &MetricEnumeration {
        &self.enumeration
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Root device whose groups and activations span its subdevices
    pub fn is_implicit_scaling_root(&self) -> bool {
        self.implicit_scaling
    }

    pub fn sub_sources(&self) -> Vec<Arc<OaMetricSource>> {
        match self.device.upgrade() {
            Some(device) => device
                .sub_devices()
                .iter()
                .filter_map(|sub| sub.metric_context().metric_source::<OaMetricSource>())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Run `f` with the library state locked and its environment built
    fn with_state<R>(&self, f: impl FnOnce(&mut OaSourceState, &LibraryEnv<'_>) -> Result<R>) -> Result<R> {
        let device = self.device()?;
        let enumeration_ready = self.enumeration.is_initialized(self);

        let mut state = self.lock();
        let env = LibraryEnv {
            device: &device,
            enumeration_ready,
            tbs_enabled: state.streamer_open,
        };
        f(&mut state, &env)
    }

    fn engine(&self) -> GpuCommandBufferType {
        if self.services.uses_compute_engine() {
            GpuCommandBufferType::Compute
        } else {
            GpuCommandBufferType::Render
        }
    }

    /// Outcome of the library's lazy initialization
    pub fn library_initialization_state(&self) -> ResultCode {
        self.lock().library.initialization_state()
    }

    pub fn library_query_count(&self) -> usize {
        self.lock().library.query_count()
    }

    pub fn enable_workload_partition(&self) {
        self.lock().library.enable_workload_partition();
    }

    pub fn is_workload_partition_enabled(&self) -> bool {
        self.lock().library.is_workload_partition_enabled()
    }

    pub fn sub_device_client_options(&self) -> Result<SubDeviceClientOptions> {
        let device = self.device()?;
        Ok(self.lock().library.sub_device_client_options(&device))
    }

    pub(crate) fn acquire_lease(&self) -> Result<Arc<LibraryLease>> {
        let source = self
            .this
            .upgrade()
            .ok_or_else(|| MetricsError::Uninitialized("metric source is gone".into()))?;

        let mut state = self.lock();
        if let Some(lease) = state.lease.upgrade() {
            return Ok(lease);
        }
        let lease = Arc::new(LibraryLease { source });
        state.lease = Arc::downgrade(&lease);
        Ok(lease)
    }

    fn release_library_if_idle(&self) {
        let mut state = self.lock();
        self.release_if_idle_locked(&mut state);
    }

    /// Release the context once no pool, query, streamer or hardware
    /// configuration needs it
    fn release_if_idle_locked(&self, state: &mut OaSourceState) {
        if state.library.query_count() > 0
            || state.activation.is_active_in_hw()
            || state.streamer_open
            || state.lease.strong_count() > 0
        {
            return;
        }
        if state.library.release() {
            debug!(source = ?self.id, "library context released, flushing instruction cache");
            self.services.notify_instruction_cache_flush();
        }
    }

    /// Create a library query for a performance pool; returns it with the
    /// per-slot GPU report size
    pub(crate) fn reserve_query(&self, slots: u32) -> Result<(QueryHandle, u32)> {
        self.with_state(|state, env| {
            if state.streamer_open {
                return Err(MetricsError::not_available("a metric streamer is open on this source"));
            }
            let gpu_size = state.library.query_report_gpu_size(env);
            if gpu_size == 0 {
                return Err(MetricsError::invalid_argument("counter library reports no query report size"));
            }
            let query = state
                .library
                .create_query(env, slots)
                .ok_or_else(|| MetricsError::invalid_argument("counter library could not create a query"))?;
            Ok((query, gpu_size))
        })
    }

    pub(crate) fn destroy_query(&self, query: QueryHandle) {
        if !self.lock().library.destroy_query(query) {
            warn!(?query, "library query deletion failed");
        }
    }

    pub(crate) fn query_report_api_size(&self) -> Result<u32> {
        self.with_state(|state, env| {
            state
                .library
                .query_report_api_size(env)
                .ok_or_else(|| MetricsError::unknown("counter library reports no query report size"))
        })
    }

    pub(crate) fn query_report(&self, query: QueryHandle, slot: u32, out: &mut [u8]) -> Result<()> {
        let status = self.with_state(|state, env| Ok(state.library.query_report(env, query, slot, out)))?;
        match status {
            StatusCode::Success => Ok(()),
            StatusCode::ReportNotReady => Err(MetricsError::NotReady(format!("query slot {} has no end report yet", slot))),
            status => Err(MetricsError::unknown(format!("query report read failed: {:?}", status))),
        }
    }

    /// Command fragment for `kind`; `Unknown` when the library cannot produce one
    pub(crate) fn gpu_commands(&self, kind: CommandBufferKind, gpu_address: u64) -> Result<Vec<u8>> {
        let engine = self.engine();
        self.with_state(|state, env| {
            state
                .library
                .gpu_commands(env, kind, engine, gpu_address)
                .ok_or_else(|| MetricsError::unknown(format!("counter library produced no {:?} commands", kind)))
        })
    }

    /// Take the source's sampling resource for a streamer
    pub(crate) fn claim_streamer(&self) -> Result<()> {
        let mut state = self.lock();
        if state.streamer_open {
            return Err(MetricsError::not_available("a metric streamer is already open on this source"));
        }
        if state.library.query_count() > 0 {
            return Err(MetricsError::not_available("metric query pools are using this source"));
        }
        state.streamer_open = true;
        Ok(())
    }

    pub(crate) fn release_streamer(&self) {
        self.lock().streamer_open = false;
    }

    pub fn is_streamer_open(&self) -> bool {
        self.lock().streamer_open
    }

    /// Requested on this source, committed or not
    pub fn is_group_activated(&self, group: GroupId) -> bool {
        self.lock().activation.is_requested(group)
    }

    pub fn is_active_in_hw(&self) -> bool {
        self.lock().activation.is_active_in_hw()
    }

    fn apply_commit(library: &mut MetricsLibrary, env: &LibraryEnv<'_>, commit: &Commit) -> Result<()> {
        for group in &commit.deactivate {
            if let Some(handle) = library.cached_configuration(group.id()) {
                if !library.deactivate_configuration(handle) {
                    warn!(group = %group.properties().name, "configuration deactivation failed");
                }
            }
        }

        for group in &commit.activate {
            let oa = group
                .as_any()
                .downcast_ref::<OaMetricGroup>()
                .ok_or_else(|| MetricsError::invalid_argument("group does not belong to an OA device source"))?;
            let handle = library
                .configuration(env, group.id(), oa.metric_set().as_ref())
                .ok_or_else(|| MetricsError::unknown(format!("no configuration for {}", oa.properties().name)))?;
            if !library.activate_configuration(handle) {
                return Err(MetricsError::unknown(format!(
                    "configuration activation failed for {}",
                    oa.properties().name
                )));
            }
            info!(group = %oa.properties().name, domain = oa.properties().domain, "metric group active in hardware");
        }
        Ok(())
    }

    fn step(&self, event: ActivationEvent, mode: &str) -> Result<()> {
        self.with_state(|state, env| {
            let snapshot = state.activation.snapshot();
            let Some(commit) = state.activation.transition(event)? else {
                return Ok(());
            };
            if commit.is_empty() {
                return Ok(());
            }

            if let Err(e) = Self::apply_commit(&mut state.library, env, &commit) {
                warn!(error = %e, "activation commit failed, restoring previous state");
                let undo = state.activation.restore(snapshot);
                if let Err(rollback) = Self::apply_commit(&mut state.library, env, &undo) {
                    warn!(error = %rollback, "activation rollback failed");
                }
                return Err(e);
            }
            telemetry::ACTIVATION_COMMITS.with_label_values(&[mode]).inc();
            self.release_if_idle_locked(state);
            Ok(())
        })
    }

    /// Build a group on this device from metrics of its enumerated groups.
    /// The metrics must share one domain and sampling type; the library
    /// creates the metric set.
    fn device_group_from_metrics(&self, name: &str, metrics: &[MetricHandle]) -> Result<Arc<OaMetricGroup>> {
        let groups = self.enumeration.device_groups(self)?;

        let mut origin: Option<&Arc<OaMetricGroup>> = None;
        let mut symbols: Vec<String> = Vec::with_capacity(metrics.len());
        for metric in metrics {
            let symbol = metric.properties().name;
            let group = groups.iter().find(|g| g.holds_metric(metric)).ok_or_else(|| {
                MetricsError::invalid_argument(format!("metric {} is not in a metric group of this device", symbol))
            })?;

            let props = group.properties();
            if let Some(first) = origin.map(|g| g.properties()) {
                if first.domain != props.domain || first.sampling_type != props.sampling_type {
                    return Err(MetricsError::invalid_argument(format!(
                        "metric {} is not in the domain and sampling type of {}",
                        symbol, first.name
                    )));
                }
            }
            origin.get_or_insert(group);

            if symbols.contains(&symbol) {
                return Err(MetricsError::invalid_argument(format!("metric {} is given twice", symbol)));
            }
            symbols.push(symbol);
        }

        let origin = origin.ok_or_else(|| MetricsError::invalid_argument("a metric group needs at least one metric"))?;
        let props = origin.properties();
        let metric_set = origin
            .concurrent_group()
            .add_metric_set(name, api_mask_for(props.sampling_type), &symbols)
            .map_err(|code| MetricsError::unknown(format!("metric set {} could not be created: {:?}", name, code)))?;

        let group = cache_group(self, origin.concurrent_group(), &metric_set, props.domain, props.sampling_type);
        info!(group = name, metrics = group.properties().metric_count, "metric group created from metrics");
        Ok(group)
    }

    /// Fan a root-device request out to every subdevice and aggregate the
    /// resulting groups
    fn multi_device_group_from_metrics(&self, name: &str, metrics: &[MetricHandle]) -> Result<MetricGroupHandle> {
        let EnumeratedGroups::MultiDevice(groups) = self.enumeration.groups(self)? else {
            return Err(MetricsError::unknown("implicit scaling root without multi-device groups"));
        };
        let subs = self.sub_sources();

        let mut per_sub: Vec<Vec<MetricHandle>> = vec![Vec::with_capacity(metrics.len()); subs.len()];
        for metric in metrics {
            let multi = groups
                .iter()
                .find_map(|g| g.multi_device_metric(metric))
                .ok_or_else(|| {
                    MetricsError::invalid_argument(format!(
                        "metric {} is not in a multi-device metric group",
                        metric.properties().name
                    ))
                })?;
            let sub_metrics = multi.sub_metrics();
            if sub_metrics.len() != subs.len() {
                return Err(MetricsError::unknown(format!(
                    "metric {} is missing on some subdevices",
                    metric.properties().name
                )));
            }
            for (sub_list, sub_metric) in per_sub.iter_mut().zip(sub_metrics) {
                sub_list.push(sub_metric);
            }
        }

        let mut sub_groups = Vec::with_capacity(subs.len());
        for (i, (sub, sub_metrics)) in subs.iter().zip(&per_sub).enumerate() {
            let group = sub.device_group_from_metrics(name, sub_metrics).map_err(|e| {
                warn!(sub_device = i, error = %e, "metric group creation failed on subdevice");
                MetricsError::invalid_argument(format!("subdevice {} could not create {}: {}", i, name, e))
            })?;
            sub_groups.push(group);
        }

        let counts: Vec<u32> = sub_groups.iter().map(|g| g.properties().metric_count).collect();
        if counts.windows(2).any(|pair| pair[0] != pair[1]) {
            return Err(MetricsError::unknown(format!(
                "subdevices disagree on the metrics of {}: {:?}",
                name, counts
            )));
        }

        MultiDeviceMetricGroup::new(sub_groups, self.weak(), self.id, self.device_weak())
            .map(|group| Arc::new(group) as MetricGroupHandle)
            .ok_or_else(|| MetricsError::unknown("implicit scaling root without subdevices"))
    }

    fn split_for_sub_devices(&self, groups: &[MetricGroupHandle], sub_count: usize) -> Result<Vec<Vec<MetricGroupHandle>>> {
        let mut per_sub = vec![Vec::with_capacity(groups.len()); sub_count];
        for group in groups {
            let multi = group
                .as_any()
                .downcast_ref::<MultiDeviceMetricGroup>()
                .ok_or_else(|| MetricsError::invalid_argument("root device expects multi-device metric groups"))?;
            for (i, sub_group) in multi.sub_groups().iter().enumerate().take(sub_count) {
                per_sub[i].push(sub_group.clone() as MetricGroupHandle);
            }
        }
        Ok(per_sub)
    }

    fn activate_sub_devices(&self, groups: &[MetricGroupHandle], deferred: bool) -> Result<()> {
        let subs = self.sub_sources();
        let per_sub = self.split_for_sub_devices(groups, subs.len())?;

        let snapshot = self.snapshot_activation();
        self.lock().activation.transition(ActivationEvent::Request {
            groups: groups.to_vec(),
            deferred,
        })?;

        for (i, (sub, sub_groups)) in subs.iter().zip(per_sub.iter()).enumerate() {
            if let Err(e) = sub.activate(sub_groups, deferred) {
                warn!(sub_device = i, error = %e, "subdevice activation failed, rolling back");
                self.restore_activation(snapshot)?;
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for OaMetricSource {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if state.library.release() {
            debug!(source = ?self.id, "library context released with its source, flushing instruction cache");
            self.services.notify_instruction_cache_flush();
        }
    }
}

impl MetricSource for OaMetricSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn source_type(&self) -> SourceType {
        SourceType::Oa
    }

    fn enable(&self) -> Result<()> {
        if !self.is_available() {
            return Err(MetricsError::DependencyUnavailable(
                "OA metrics libraries are not available".into(),
            ));
        }
        self.enabled.store(true, Ordering::Release);
        debug!(source = ?self.id, "OA metric source enabled");
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.enumeration.is_loaded() && self.lock().library.is_loaded()
    }

    fn metric_group_get(&self) -> Result<Vec<MetricGroupHandle>> {
        Ok(match self.enumeration.groups(self)? {
            EnumeratedGroups::Device(groups) => groups.into_iter().map(|g| g as MetricGroupHandle).collect(),
            EnumeratedGroups::MultiDevice(groups) => groups.into_iter().map(|g| g as MetricGroupHandle).collect(),
        })
    }

    fn append_metric_memory_barrier(&self, cmd: &mut dyn CommandList) -> Result<()> {
        let fragments = if self.is_implicit_scaling_root() {
            self.sub_sources()
                .iter()
                .map(|sub| sub.gpu_commands(CommandBufferKind::OverrideFlushCaches, 0))
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![self.gpu_commands(CommandBufferKind::OverrideFlushCaches, 0)?]
        };

        for fragment in &fragments {
            cmd.append_gpu_commands(fragment)?;
        }
        Ok(())
    }

    fn activate(&self, groups: &[MetricGroupHandle], deferred: bool) -> Result<()> {
        if let Some(foreign) = groups.iter().find(|g| g.source_id() != self.id) {
            return Err(MetricsError::invalid_argument(format!(
                "metric group {} belongs to another source",
                foreign.properties().name
            )));
        }

        if self.is_implicit_scaling_root() {
            return self.activate_sub_devices(groups, deferred);
        }
        self.step(
            ActivationEvent::Request {
                groups: groups.to_vec(),
                deferred,
            },
            "immediate",
        )
    }

    fn activate_already_deferred(&self) -> Result<()> {
        if self.is_implicit_scaling_root() {
            self.lock().activation.transition(ActivationEvent::Trigger)?;
            for sub in self.sub_sources() {
                sub.activate_already_deferred()?;
            }
            return Ok(());
        }
        self.step(ActivationEvent::Trigger, "deferred")
    }

    fn snapshot_activation(&self) -> ActivationSnapshot {
        let mut snapshot = self.lock().activation.snapshot();
        if self.is_implicit_scaling_root() {
            snapshot.sub_devices = self.sub_sources().iter().map(|s| s.snapshot_activation()).collect();
        }
        snapshot
    }

    fn restore_activation(&self, mut snapshot: ActivationSnapshot) -> Result<()> {
        let sub_snapshots = std::mem::take(&mut snapshot.sub_devices);

        if self.is_implicit_scaling_root() {
            self.lock().activation.restore(snapshot);
            let mut first_error = None;
            for (sub, sub_snapshot) in self.sub_sources().iter().zip(sub_snapshots) {
                if let Err(e) = sub.restore_activation(sub_snapshot) {
                    first_error.get_or_insert(e);
                }
            }
            return first_error.map_or(Ok(()), Err);
        }

        self.with_state(|state, env| {
            let undo = state.activation.restore(snapshot);
            if undo.is_empty() {
                return Ok(());
            }
            Self::apply_commit(&mut state.library, env, &undo)?;
            self.release_if_idle_locked(state);
            Ok(())
        })
    }

    fn create_group_from_metrics(&self, name: &str, metrics: &[MetricHandle]) -> Result<MetricGroupHandle> {
        if metrics.is_empty() {
            return Err(MetricsError::invalid_argument("a metric group needs at least one metric"));
        }
        if let Some(foreign) = metrics.iter().find(|m| m.source_id() != self.id) {
            return Err(MetricsError::invalid_argument(format!(
                "metric {} belongs to another source",
                foreign.properties().name
            )));
        }

        if self.is_implicit_scaling_root() {
            return self.multi_device_group_from_metrics(name, metrics);
        }
        Ok(self.device_group_from_metrics(name, metrics)? as MetricGroupHandle)
    }

    fn supports_calculation_operations(&self) -> bool {
        true
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
