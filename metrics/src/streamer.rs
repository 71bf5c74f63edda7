//! Time-based metric streamers
//!
//! `MetricStreamer` is the handle callers hold; the sampling hardware behind
//! it is a `StreamerBackend`. The OA backend owns the I/O stream of every
//! part of its group: one for a plain device, one per subdevice for a
//! multi-device group. Reads from several parts are packed with the
//! calculate header.

use crate::cmdlist::{CommandList, EventHandle};
use crate::device::Device;
use crate::discovery::{api_mask, CompletionCode};
use crate::group::{MetricGroupHandle, OaGroupRef, OaMetricGroup};
use crate::library::api::CommandBufferKind;
use crate::source::oa::OaMetricSource;
use crate::source::MetricSource;
use crate::telemetry;
use lzmetrics_shared::protocol::calculate::{pack_with, packed_capacity};
use lzmetrics_shared::{MetricStreamerDesc, MetricsError, ReadStatus, Result, SamplingType};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct StreamPart {
    source: Arc<OaMetricSource>,
    group: Arc<OaMetricGroup>,
    oa_buffer_size: u32,
}

impl StreamPart {
    fn raw_report_size(&self) -> usize {
        self.group.raw_report_size() as usize
    }

    /// Largest read this part can return, in whole reports
    fn read_capacity(&self, max_reports: u32) -> usize {
        let raw = self.raw_report_size();
        if raw == 0 {
            return 0;
        }
        let wanted = max_reports as usize * raw;
        let buffer = self.oa_buffer_size as usize / raw * raw;
        wanted.min(buffer)
    }

    fn read(&self, max_reports: u32, out: &mut [u8]) -> Result<(usize, bool)> {
        let raw = self.raw_report_size();
        if raw == 0 {
            return Ok((0, false));
        }
        let reports = (max_reports as usize).min(out.len() / raw) as u32;
        let size = self.read_capacity(reports);

        let read = self.group.concurrent_group().read_io_stream(reports, &mut out[..size]);
        let dropped = match read.code {
            CompletionCode::Ok | CompletionCode::ReadPending => false,
            CompletionCode::ReportsLost => true,
            code => {
                return Err(MetricsError::unknown(format!("OA stream read failed: {:?}", code)));
            }
        };

        let bytes = (read.report_count as usize * raw).min(size);
        telemetry::REPORTS_READ.inc_by((bytes / raw) as f64);
        Ok((bytes, dropped))
    }
}

/// Sampling hardware behind a streamer
pub(crate) trait StreamerBackend: Send + Sync {
    fn group(&self) -> MetricGroupHandle;

    /// Hardware buffer size granted per part
    fn hw_buffer_sizes(&self) -> Vec<u32>;

    /// Bytes a read of `max_reports` may return (`out == None`), or read
    /// into `out`; returns bytes written and whether reports were lost
    fn read_data(&self, max_reports: u32, out: Option<&mut [u8]>) -> Result<(usize, bool)>;

    fn append_marker(&self, device: &Arc<Device>, cmd: &mut dyn CommandList, value: u32) -> Result<()>;

    /// Wait up to `timeout_ms` for the notification threshold on any part
    fn wait_for_reports(&self, timeout_ms: u32) -> Result<bool>;

    /// Stop sampling and release every part, even when stopping one fails
    fn close(&mut self) -> Result<()>;
}

pub struct MetricStreamer {
    device: Arc<Device>,
    backend: Box<dyn StreamerBackend>,
    notify_every_n_reports: u32,
    event: Option<EventHandle>,
    closed: bool,
}

impl std::fmt::Debug for MetricStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricStreamer")
            .field("group", &self.backend.group().properties().name)
            .field("notify_every_n_reports", &self.notify_every_n_reports)
            .finish()
    }
}

struct OaStreamer {
    group: OaGroupRef,
    parts: Vec<StreamPart>,
}

/// OA buffer size to request: the explicit hint, or room for two
/// notification intervals less two reports
fn requested_buffer_size(desc: &MetricStreamerDesc, raw_report_size: u32) -> u32 {
    match desc.buffer_size {
        Some(hint) => u32::try_from(hint.size_in_bytes).unwrap_or(u32::MAX),
        None => desc
            .notify_every_n_reports
            .saturating_mul(raw_report_size)
            .saturating_mul(2)
            .saturating_sub(raw_report_size.saturating_mul(2)),
    }
}

/// Close streams and release claims of parts opened so far
fn abandon(parts: &[StreamPart]) {
    for part in parts {
        let _ = part.group.concurrent_group().close_io_stream();
        part.source.release_streamer();
    }
}

/// Open an OA streamer; `desc.notify_every_n_reports` is rewritten to what
/// the allocated OA buffer supports
pub(crate) fn open_oa(
    device: &Arc<Device>,
    group: OaGroupRef,
    desc: &mut MetricStreamerDesc,
    event: Option<EventHandle>,
) -> Result<MetricStreamer> {
    if group.properties().sampling_type != SamplingType::TimeBased {
        return Err(MetricsError::invalid_argument(format!(
            "{} is not time-based",
            group.properties().name
        )));
    }
    if !matches!(group.device(), Some(d) if Arc::ptr_eq(&d, device)) {
        return Err(MetricsError::invalid_argument("metric group belongs to another device"));
    }

    let owner = group.source()?;
    if !owner.is_group_activated(group.id()) {
        return Err(MetricsError::NotReady(format!(
            "{} is not activated",
            group.properties().name
        )));
    }
    owner.activate_already_deferred()?;

    let mut parts: Vec<StreamPart> = Vec::new();
    for part_group in group.parts() {
        let source = part_group.source()?;
        if let Err(e) = source.claim_streamer() {
            abandon(&parts);
            return Err(e);
        }

        let raw = part_group.raw_report_size();
        let mut oa_buffer_size = requested_buffer_size(desc, raw);
        part_group.metric_set().set_api_filtering(api_mask::IOSTREAM);
        let code = part_group.concurrent_group().open_io_stream(
            part_group.metric_set().as_ref(),
            desc.sampling_period,
            &mut oa_buffer_size,
        );
        if !code.is_ok() {
            source.release_streamer();
            abandon(&parts);
            return Err(MetricsError::unknown(format!("OA stream open failed: {:?}", code)));
        }

        debug!(sub_device = parts.len(), oa_buffer_size, "OA stream opened");
        parts.push(StreamPart {
            source,
            group: part_group,
            oa_buffer_size,
        });
    }

    if let Some(first) = parts.first() {
        let raw = first.group.raw_report_size();
        if raw != 0 {
            desc.notify_every_n_reports = first.oa_buffer_size / (2 * raw);
        }
    }

    info!(
        group = %group.properties().name,
        parts = parts.len(),
        notify_every_n_reports = desc.notify_every_n_reports,
        sampling_period = desc.sampling_period,
        "OA streams opened"
    );

    Ok(MetricStreamer::new(
        device.clone(),
        Box::new(OaStreamer { group, parts }),
        desc.notify_every_n_reports,
        event,
    ))
}

impl StreamerBackend for OaStreamer {
    fn group(&self) -> MetricGroupHandle {
        self.group.handle()
    }

    fn hw_buffer_sizes(&self) -> Vec<u32> {
        self.parts.iter().map(|p| p.oa_buffer_size).collect()
    }

    fn read_data(&self, max_reports: u32, out: Option<&mut [u8]>) -> Result<(usize, bool)> {
        if let [part] = self.parts.as_slice() {
            return match out {
                None => Ok((part.read_capacity(max_reports), false)),
                Some(out) => part.read(max_reports, out),
            };
        }

        let largest = self
            .parts
            .iter()
            .map(|p| p.read_capacity(max_reports))
            .max()
            .unwrap_or(0);

        match out {
            None => Ok((packed_capacity(self.parts.len(), largest), false)),
            Some(out) => {
                let mut dropped = false;
                let bytes = pack_with(out, self.parts.len(), |i, region| {
                    let (bytes, lost) = self.parts[i].read(max_reports, region)?;
                    dropped |= lost;
                    Ok(bytes)
                })?;
                Ok((bytes, dropped))
            }
        }
    }

    fn append_marker(&self, device: &Arc<Device>, cmd: &mut dyn CommandList, value: u32) -> Result<()> {
        let target = cmd.device();
        if !device.is_related(&target) {
            return Err(MetricsError::invalid_argument("command list targets an unrelated device"));
        }
        target.activate_metric_groups()?;

        let source = target
            .metric_context()
            .metric_source::<OaMetricSource>()
            .ok_or_else(|| MetricsError::unsupported("device has no OA metric source"))?;
        let kind = CommandBufferKind::Marker { value };

        if source.is_implicit_scaling_root() {
            let first = source
                .sub_sources()
                .into_iter()
                .next()
                .ok_or_else(|| MetricsError::unknown("implicit scaling device without subdevices"))?;
            let fragment = first.gpu_commands(kind, 0)?;
            cmd.append_multi_partition_prologue(0);
            cmd.append_gpu_commands(&fragment)?;
            cmd.append_multi_partition_epilogue();
            return Ok(());
        }

        let fragment = source.gpu_commands(kind, 0)?;
        cmd.append_gpu_commands(&fragment)
    }

    fn wait_for_reports(&self, timeout_ms: u32) -> Result<bool> {
        for part in &self.parts {
            match part.group.concurrent_group().wait_for_reports(timeout_ms) {
                CompletionCode::Ok => return Ok(true),
                CompletionCode::WaitTimeout => {}
                code => return Err(MetricsError::unknown(format!("OA stream wait failed: {:?}", code))),
            }
        }
        Ok(false)
    }

    fn close(&mut self) -> Result<()> {
        let mut result = Ok(());
        for (i, part) in self.parts.iter().enumerate() {
            let code = part.group.concurrent_group().close_io_stream();
            part.source.release_streamer();
            if !code.is_ok() && result.is_ok() {
                warn!(sub_device = i, ?code, "OA stream close failed");
                result = Err(MetricsError::unknown(format!("OA stream close failed: {:?}", code)));
            }
        }
        result
    }
}

impl MetricStreamer {
    pub(crate) fn new(
        device: Arc<Device>,
        backend: Box<dyn StreamerBackend>,
        notify_every_n_reports: u32,
        event: Option<EventHandle>,
    ) -> Self {
        telemetry::OPEN_STREAMERS.inc();
        info!(group = %backend.group().properties().name, notify_every_n_reports, "metric streamer opened");
        Self {
            device,
            backend,
            notify_every_n_reports,
            event,
            closed: false,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn group(&self) -> MetricGroupHandle {
        self.backend.group()
    }

    pub fn notify_every_n_reports(&self) -> u32 {
        self.notify_every_n_reports
    }

    /// Hardware buffer size allocated per part
    pub fn hw_buffer_sizes(&self) -> Vec<u32> {
        self.backend.hw_buffer_sizes()
    }

    /// Bytes a read of `max_reports` may return (`out == None`), or read into
    /// `out` and return the bytes written
    pub fn read_data(&self, max_reports: u32, out: Option<&mut [u8]>) -> Result<(usize, ReadStatus)> {
        let (bytes, dropped) = self.backend.read_data(max_reports, out)?;
        if !dropped {
            return Ok((bytes, ReadStatus::Complete));
        }
        telemetry::DROPPED_DATA.inc();
        warn!(group = %self.backend.group().properties().name, "hardware buffer overflowed, reports were lost");
        Ok((bytes, ReadStatus::DroppedData))
    }

    /// Append a marker write to `cmd`, which may target this device or any
    /// related device
    pub fn append_marker(&self, cmd: &mut dyn CommandList, value: u32) -> Result<()> {
        self.backend.append_marker(&self.device, cmd, value)
    }

    /// Wait up to `timeout_ms` for the notification threshold; signals the
    /// streamer's event when reached
    pub fn poll_notification(&self, timeout_ms: u32) -> Result<bool> {
        let ready = self.backend.wait_for_reports(timeout_ms)?;
        if ready {
            if let Some(event) = &self.event {
                event.host_signal();
            }
        }
        Ok(ready)
    }

    fn close_streams(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = self.backend.close();
        telemetry::OPEN_STREAMERS.dec();
        info!(group = %self.backend.group().properties().name, "metric streamer closed");
        result
    }

    /// The streamer is released even when closing the stream fails
    pub fn close(mut self) -> Result<()> {
        self.close_streams()
    }
}

impl Drop for MetricStreamer {
    fn drop(&mut self) {
        if let Err(e) = self.close_streams() {
            warn!(error = %e, "metric streamer dropped with a failing close");
        }
    }
}
