//! Metric query pools and queries
//!
//! A performance pool owns one library query per device part (one for a
//! plain device, one per subdevice for a multi-device group) and a single
//! GPU allocation holding every slot of every part. Each part also holds a
//! lease on its source's library context, so the context outlives the pool
//! until the last pool and the last query referencing it are gone.

use crate::cmdlist::{CommandList, EventHandle};
use crate::device::{Device, GraphicsAllocation};
use crate::group::{MetricGroupHandle, OaGroupRef};
use crate::library::api::{CommandBufferKind, QueryHandle};
use crate::source::oa::{LibraryLease, OaMetricSource};
use crate::telemetry;
use lzmetrics_shared::protocol::calculate::{pack_with, packed_capacity};
use lzmetrics_shared::{MetricQueryPoolDesc, MetricsError, QueryPoolType, Result, SamplingType};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct PoolPart {
    source: Arc<OaMetricSource>,
    query: QueryHandle,
    report_gpu_size: u32,
    _lease: Arc<LibraryLease>,
}

impl Drop for PoolPart {
    fn drop(&mut self) {
        self.source.destroy_query(self.query);
    }
}

enum PoolKind {
    Performance {
        group: OaGroupRef,
        parts: Vec<PoolPart>,
    },
    /// Measures command-list execution only, no counter hardware
    Execution {
        source: Arc<OaMetricSource>,
        _lease: Arc<LibraryLease>,
    },
}

struct PoolInner {
    desc: MetricQueryPoolDesc,
    device: Arc<Device>,
    kind: PoolKind,
    allocation: Option<GraphicsAllocation>,
    /// Bytes of GPU memory per part
    part_stride: u32,
    outstanding: AtomicU32,
}

impl PoolInner {
    fn slot_address(&self, part: usize, slot: u32, report_size: u32) -> u64 {
        match &self.allocation {
            Some(allocation) => {
                allocation.gpu_address + part as u64 * self.part_stride as u64 + slot as u64 * report_size as u64
            }
            None => 0,
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.device.services().free_graphics_memory(&allocation);
        }
        debug!(device = self.device.name(), count = self.desc.count, "metric query pool destroyed");
    }
}

pub struct MetricQueryPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for MetricQueryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricQueryPool")
            .field("desc", &self.inner.desc)
            .field("outstanding", &self.outstanding_queries())
            .finish()
    }
}

/// Create a pool; `group` is required for performance pools and ignored for execution pools
pub fn create(
    device: &Arc<Device>,
    group: Option<MetricGroupHandle>,
    desc: &MetricQueryPoolDesc,
) -> Result<MetricQueryPool> {
    if desc.count == 0 {
        return Err(MetricsError::invalid_argument("query pool count must be at least 1"));
    }
    match desc.pool_type {
        QueryPoolType::Execution => create_execution_pool(device, desc),
        QueryPoolType::Performance => {
            let group = group.ok_or(MetricsError::InvalidNullHandle("metric group"))?;
            group.metric_query_pool_create(device, desc)
        }
    }
}

pub(crate) fn create_performance_pool(
    device: &Arc<Device>,
    group: OaGroupRef,
    desc: &MetricQueryPoolDesc,
) -> Result<MetricQueryPool> {
    if desc.count == 0 {
        return Err(MetricsError::invalid_argument("query pool count must be at least 1"));
    }
    if desc.pool_type == QueryPoolType::Execution {
        return create_execution_pool(device, desc);
    }
    if group.properties().sampling_type != SamplingType::EventBased {
        return Err(MetricsError::invalid_argument(format!(
            "{} is time-based and cannot back a query pool",
            group.properties().name
        )));
    }
    if !matches!(group.device(), Some(d) if Arc::ptr_eq(&d, device)) {
        return Err(MetricsError::invalid_argument("metric group belongs to another device"));
    }

    let mut parts = Vec::new();
    for part_group in group.parts() {
        let source = part_group.source()?;
        let lease = source.acquire_lease()?;
        let (query, report_gpu_size) = source.reserve_query(desc.count)?;
        parts.push(PoolPart {
            source,
            query,
            report_gpu_size,
            _lease: lease,
        });
    }

    let report_size = parts.iter().map(|p| p.report_gpu_size).max().unwrap_or(0);
    let part_stride = report_size * desc.count;
    let allocation = device
        .services()
        .allocate_graphics_memory(part_stride as usize * parts.len())?;

    telemetry::QUERY_POOLS_CREATED.with_label_values(&["performance"]).inc();
    info!(
        group = %group.properties().name,
        slots = desc.count,
        parts = parts.len(),
        bytes = allocation.size,
        "metric query pool created"
    );

    Ok(MetricQueryPool {
        inner: Arc::new(PoolInner {
            desc: *desc,
            device: device.clone(),
            kind: PoolKind::Performance { group, parts },
            allocation: Some(allocation),
            part_stride,
            outstanding: AtomicU32::new(0),
        }),
    })
}

fn create_execution_pool(device: &Arc<Device>, desc: &MetricQueryPoolDesc) -> Result<MetricQueryPool> {
    let source = device
        .metric_context()
        .metric_source::<OaMetricSource>()
        .ok_or_else(|| MetricsError::unsupported("device has no OA metric source"))?;
    let lease = source.acquire_lease()?;

    telemetry::QUERY_POOLS_CREATED.with_label_values(&["execution"]).inc();
    info!(slots = desc.count, "execution query pool created");

    Ok(MetricQueryPool {
        inner: Arc::new(PoolInner {
            desc: *desc,
            device: device.clone(),
            kind: PoolKind::Execution { source, _lease: lease },
            allocation: None,
            part_stride: 0,
            outstanding: AtomicU32::new(0),
        }),
    })
}

impl MetricQueryPool {
    pub fn desc(&self) -> &MetricQueryPoolDesc {
        &self.inner.desc
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.inner.device
    }

    pub fn group(&self) -> Option<MetricGroupHandle> {
        match &self.inner.kind {
            PoolKind::Performance { group, .. } => Some(group.handle()),
            PoolKind::Execution { .. } => None,
        }
    }

    pub fn allocation(&self) -> Option<&GraphicsAllocation> {
        self.inner.allocation.as_ref()
    }

    pub fn outstanding_queries(&self) -> u32 {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn create_query(&self, slot: u32) -> Result<MetricQuery> {
        if slot >= self.inner.desc.count {
            return Err(MetricsError::invalid_argument(format!(
                "slot {} is outside a pool of {}",
                slot, self.inner.desc.count
            )));
        }
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(MetricQuery {
            pool: self.inner.clone(),
            slot,
        })
    }

    /// Queries still alive keep the pool's resources until they are destroyed
    pub fn destroy(self) -> Result<()> {
        let outstanding = self.outstanding_queries();
        if outstanding > 0 {
            debug!(outstanding, "query pool destroyed with live queries");
        }
        Ok(())
    }
}

pub struct MetricQuery {
    pool: Arc<PoolInner>,
    slot: u32,
}

impl std::fmt::Debug for MetricQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricQuery").field("slot", &self.slot).finish()
    }
}

impl MetricQuery {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Fragments for every part, in part order
    fn fragments(&self, cmd: &dyn CommandList, begin: bool) -> Result<Vec<Vec<u8>>> {
        cmd.device().activate_metric_groups()?;

        match &self.pool.kind {
            PoolKind::Performance { parts, .. } => parts
                .iter()
                .enumerate()
                .map(|(i, part)| {
                    let kind = CommandBufferKind::QueryHwCounters {
                        query: part.query,
                        slot: self.slot,
                        begin,
                    };
                    part.source
                        .gpu_commands(kind, self.pool.slot_address(i, self.slot, part.report_gpu_size))
                })
                .collect(),
            PoolKind::Execution { source, .. } => {
                let kind = CommandBufferKind::OverrideNullHardware { enable: begin };
                Ok(vec![source.gpu_commands(kind, 0)?])
            }
        }
    }

    /// Every part is programmed, but under implicit scaling only the first
    /// part's fragment is emitted, replayed per partition
    fn emit(&self, cmd: &mut dyn CommandList, fragments: &[Vec<u8>]) -> Result<()> {
        if let Some(allocation) = &self.pool.allocation {
            cmd.add_to_residency(allocation);
        }
        let Some(first) = fragments.first() else {
            return Err(MetricsError::unknown("no command fragment for query"));
        };

        if fragments.len() > 1 {
            cmd.append_multi_partition_prologue(self.pool.part_stride);
            cmd.append_gpu_commands(first)?;
            cmd.append_multi_partition_epilogue();
            Ok(())
        } else {
            cmd.append_gpu_commands(first)
        }
    }

    pub fn append_begin(&self, cmd: &mut dyn CommandList) -> Result<()> {
        let fragments = self.fragments(cmd, true)?;
        self.emit(cmd, &fragments)
    }

    pub fn append_end(
        &self,
        cmd: &mut dyn CommandList,
        signal: Option<&EventHandle>,
        wait: &[EventHandle],
    ) -> Result<()> {
        let fragments = self.fragments(cmd, false)?;
        if !wait.is_empty() {
            cmd.append_wait_on_events(wait)?;
        }
        self.emit(cmd, &fragments)?;
        if let Some(event) = signal {
            cmd.append_signal_event(event)?;
        }
        Ok(())
    }

    /// Report size (`out == None`) or the report itself; multi-device
    /// queries return packed data with one part per subdevice
    pub fn get_data(&self, out: Option<&mut [u8]>) -> Result<usize> {
        let parts = match &self.pool.kind {
            PoolKind::Performance { parts, .. } => parts,
            PoolKind::Execution { .. } => {
                return Err(MetricsError::unsupported("execution queries carry no report data"))
            }
        };

        if let [part] = parts.as_slice() {
            let size = part.source.query_report_api_size()? as usize;
            return match out {
                None => Ok(size),
                Some(out) => {
                    if out.len() < size {
                        return Err(MetricsError::InvalidSize {
                            required: size,
                            provided: out.len(),
                        });
                    }
                    part.source.query_report(part.query, self.slot, &mut out[..size])?;
                    Ok(size)
                }
            };
        }

        let sizes = parts
            .iter()
            .map(|p| p.source.query_report_api_size().map(|s| s as usize))
            .collect::<Result<Vec<_>>>()?;
        let largest = sizes.iter().copied().max().unwrap_or(0);

        match out {
            None => Ok(packed_capacity(parts.len(), largest)),
            Some(out) => pack_with(out, parts.len(), |i, region| {
                let size = sizes[i];
                if region.len() < size {
                    return Err(MetricsError::InvalidSize {
                        required: size,
                        provided: region.len(),
                    });
                }
                parts[i].source.query_report(parts[i].query, self.slot, &mut region[..size])?;
                Ok(size)
            }),
        }
    }

    pub fn reset(&self) -> Result<()> {
        Ok(())
    }

    pub fn destroy(self) -> Result<()> {
        Ok(())
    }
}

impl Drop for MetricQuery {
    fn drop(&mut self) {
        let previous = self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            warn!(slot = self.slot, "query count underflow");
        }
    }
}
