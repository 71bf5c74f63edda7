//! Level Zero style entry points
//!
//! Thin wrappers over the engine that report a `ResultCode` for every call.
//! Variable-length results follow the two-phase convention: call with no
//! output buffer to learn the size or count, then call again to fill.

use crate::calculation::MetricCalculateOperation;
use crate::cmdlist::{CommandList, EventHandle};
use crate::device::Device;
use crate::driver::Context;
use crate::group::MetricGroupHandle;
use crate::metric::MetricHandle;
use crate::query::{self, MetricQuery, MetricQueryPool};
use crate::streamer::MetricStreamer;
use lzmetrics_shared::{
    CalculatedValues, CalculationType, MetricGroupProperties, MetricProperties, MetricQueryPoolDesc,
    MetricStreamerDesc, MetricsError, Result, ResultCode, TypedValue,
};
use std::sync::Arc;
use tracing::debug;

fn finish(op: &'static str, result: Result<()>) -> ResultCode {
    match result {
        Ok(()) => ResultCode::Success,
        Err(e) => {
            debug!(op, code = %e.code(), error = %e, "metrics call failed");
            e.code()
        }
    }
}

/// Two-phase listing: `count == 0` or no output reports the total, otherwise
/// up to `count` items are returned and `count` is set to how many
fn list<T: Clone>(items: Vec<T>, count: &mut u32, out: Option<&mut Vec<T>>) {
    match out {
        Some(out) if *count > 0 => {
            let n = (*count as usize).min(items.len());
            out.clear();
            out.extend(items.into_iter().take(n));
            *count = n as u32;
        }
        _ => *count = items.len() as u32,
    }
}

/// Two-phase byte buffer: `size == 0` or no buffer asks for the size
fn fill_bytes<F>(size: &mut usize, data: Option<&mut [u8]>, produce: F) -> Result<()>
where
    F: FnOnce(Option<&mut [u8]>) -> Result<usize>,
{
    match data {
        Some(data) if *size > 0 => {
            let limit = (*size).min(data.len());
            *size = produce(Some(&mut data[..limit]))?;
        }
        _ => *size = produce(None)?,
    }
    Ok(())
}

fn check_context(context: &Context, device: &Arc<Device>) -> Result<()> {
    if context.contains(device) {
        Ok(())
    } else {
        Err(MetricsError::invalid_argument(format!(
            "device {} is not part of the context",
            device.name()
        )))
    }
}

pub fn device_enable_metrics_exp(device: &Arc<Device>) -> ResultCode {
    finish("device_enable_metrics_exp", device.metric_context().enable_metrics())
}

pub fn metric_group_get(
    device: &Arc<Device>,
    count: &mut u32,
    groups: Option<&mut Vec<MetricGroupHandle>>,
) -> ResultCode {
    let result = device
        .metric_context()
        .metric_group_get()
        .map(|all| list(all, count, groups));
    finish("metric_group_get", result)
}

pub fn metric_group_get_properties(
    group: &MetricGroupHandle,
    properties: &mut Option<MetricGroupProperties>,
) -> ResultCode {
    *properties = Some(group.properties());
    ResultCode::Success
}

pub fn metric_get(group: &MetricGroupHandle, count: &mut u32, metrics: Option<&mut Vec<MetricHandle>>) -> ResultCode {
    list(group.metrics(), count, metrics);
    ResultCode::Success
}

pub fn metric_get_properties(metric: &MetricHandle, properties: &mut Option<MetricProperties>) -> ResultCode {
    *properties = Some(metric.properties());
    ResultCode::Success
}

pub fn context_activate_metric_groups(
    context: &Context,
    device: &Arc<Device>,
    groups: &[MetricGroupHandle],
) -> ResultCode {
    let result = check_context(context, device)
        .and_then(|_| device.metric_context().activate_metric_groups(groups));
    finish("context_activate_metric_groups", result)
}

pub fn metric_query_pool_create(
    context: &Context,
    device: &Arc<Device>,
    group: Option<&MetricGroupHandle>,
    desc: Option<&MetricQueryPoolDesc>,
    pool: &mut Option<MetricQueryPool>,
) -> ResultCode {
    let result = (|| -> Result<()> {
        check_context(context, device)?;
        let desc = desc.ok_or(MetricsError::InvalidNullPointer("query pool descriptor"))?;
        *pool = Some(query::create(device, group.cloned(), desc)?);
        Ok(())
    })();
    finish("metric_query_pool_create", result)
}

pub fn metric_query_pool_destroy(pool: MetricQueryPool) -> ResultCode {
    finish("metric_query_pool_destroy", pool.destroy())
}

pub fn metric_query_create(pool: &MetricQueryPool, slot: u32, query: &mut Option<MetricQuery>) -> ResultCode {
    let result = pool.create_query(slot).map(|q| *query = Some(q));
    finish("metric_query_create", result)
}

pub fn metric_query_reset(query: &MetricQuery) -> ResultCode {
    finish("metric_query_reset", query.reset())
}

pub fn metric_query_destroy(query: MetricQuery) -> ResultCode {
    finish("metric_query_destroy", query.destroy())
}

pub fn metric_query_get_data(query: &MetricQuery, size: &mut usize, data: Option<&mut [u8]>) -> ResultCode {
    let result = fill_bytes(size, data, |out| query.get_data(out));
    finish("metric_query_get_data", result)
}

pub fn command_list_append_metric_query_begin(cmd: &mut dyn CommandList, query: &MetricQuery) -> ResultCode {
    finish("command_list_append_metric_query_begin", query.append_begin(cmd))
}

pub fn command_list_append_metric_query_end(
    cmd: &mut dyn CommandList,
    query: &MetricQuery,
    signal: Option<&EventHandle>,
    wait: &[EventHandle],
) -> ResultCode {
    finish("command_list_append_metric_query_end", query.append_end(cmd, signal, wait))
}

pub fn command_list_append_metric_memory_barrier(cmd: &mut dyn CommandList) -> ResultCode {
    let device = cmd.device();
    let result = device
        .activate_metric_groups()
        .and_then(|_| device.metric_context().append_metric_memory_barrier(cmd));
    finish("command_list_append_metric_memory_barrier", result)
}

pub fn command_list_append_metric_streamer_marker(
    cmd: &mut dyn CommandList,
    streamer: &MetricStreamer,
    value: u32,
) -> ResultCode {
    finish("command_list_append_metric_streamer_marker", streamer.append_marker(cmd, value))
}

pub fn metric_streamer_open(
    context: &Context,
    device: &Arc<Device>,
    group: &MetricGroupHandle,
    desc: &mut MetricStreamerDesc,
    event: Option<EventHandle>,
    streamer: &mut Option<MetricStreamer>,
) -> ResultCode {
    let result = (|| -> Result<()> {
        check_context(context, device)?;
        *streamer = Some(group.clone().metric_streamer_open(device, desc, event)?);
        Ok(())
    })();
    finish("metric_streamer_open", result)
}

pub fn metric_streamer_read_data(
    streamer: &MetricStreamer,
    max_reports: u32,
    size: &mut usize,
    data: Option<&mut [u8]>,
) -> ResultCode {
    let mut status = None;
    let result = fill_bytes(size, data, |out| {
        let (bytes, read_status) = streamer.read_data(max_reports, out)?;
        status = Some(read_status);
        Ok(bytes)
    });
    match (result, status) {
        (Ok(()), Some(status)) => status.code(),
        (result, _) => finish("metric_streamer_read_data", result),
    }
}

pub fn metric_streamer_close(streamer: MetricStreamer) -> ResultCode {
    finish("metric_streamer_close", streamer.close())
}

pub fn metric_group_calculate_metric_values(
    group: &MetricGroupHandle,
    calculation: CalculationType,
    raw: &[u8],
    count: &mut u32,
    values: Option<&mut Vec<TypedValue>>,
) -> ResultCode {
    let result = match values {
        Some(values) if *count > 0 => {
            let mut decoded = Vec::new();
            group
                .calculate_metric_values(calculation, raw, Some(&mut decoded))
                .map(|_| {
                    decoded.truncate(*count as usize);
                    *count = decoded.len() as u32;
                    *values = decoded;
                })
        }
        _ => group
            .calculate_metric_values(calculation, raw, None)
            .map(|n| *count = n),
    };
    finish("metric_group_calculate_metric_values", result)
}

#[allow(clippy::too_many_arguments)]
pub fn metric_group_calculate_multiple_metric_values_exp(
    group: &MetricGroupHandle,
    calculation: CalculationType,
    raw: &[u8],
    data_count: &mut u32,
    total_metric_count: &mut u32,
    metric_counts: Option<&mut Vec<u32>>,
    values: Option<&mut Vec<TypedValue>>,
) -> ResultCode {
    let result = match (metric_counts, values) {
        (Some(metric_counts), Some(values)) => {
            let mut calculated = CalculatedValues::default();
            group
                .calculate_multiple_metric_values(calculation, raw, Some(&mut calculated))
                .map(|_| {
                    *data_count = calculated.data_count();
                    *total_metric_count = calculated.total_metric_count();
                    *metric_counts = calculated.metric_counts;
                    *values = calculated.values;
                })
        }
        _ => group
            .calculate_multiple_metric_values(calculation, raw, None)
            .map(|counts| {
                *data_count = counts.data_count;
                *total_metric_count = counts.total_metric_count;
            }),
    };
    finish("metric_group_calculate_multiple_metric_values_exp", result)
}

pub fn metric_group_get_export_data_exp(
    group: &MetricGroupHandle,
    raw: &[u8],
    size: &mut usize,
    data: Option<&mut [u8]>,
) -> ResultCode {
    let result = fill_bytes(size, data, |out| group.get_export_data(raw, out));
    finish("metric_group_get_export_data_exp", result)
}

pub fn metric_calculate_operation_create(
    context: &Context,
    device: &Arc<Device>,
    groups: &[MetricGroupHandle],
    excluded: &[MetricHandle],
    operation: &mut Option<MetricCalculateOperation>,
) -> ResultCode {
    let result = (|| -> Result<()> {
        check_context(context, device)?;
        *operation = Some(MetricCalculateOperation::create(device, groups, excluded)?);
        Ok(())
    })();
    finish("metric_calculate_operation_create", result)
}

pub fn metric_calculate_operation_destroy(operation: MetricCalculateOperation) -> ResultCode {
    finish("metric_calculate_operation_destroy", operation.destroy())
}

pub fn metric_calculate_operation_calculate(
    operation: &MetricCalculateOperation,
    raw: &[&[u8]],
    results: &mut Option<CalculatedValues>,
) -> ResultCode {
    let result = operation.calculate(raw).map(|values| *results = Some(values));
    finish("metric_calculate_operation_calculate", result)
}

pub fn device_create_metric_group_from_metrics(
    device: &Arc<Device>,
    name: &str,
    metrics: &[MetricHandle],
    group: &mut Option<MetricGroupHandle>,
) -> ResultCode {
    let result = (|| -> Result<()> {
        let first = metrics
            .first()
            .ok_or_else(|| MetricsError::invalid_argument("no metrics given"))?;
        let source = device
            .metric_context()
            .source_by_id(first.source_id())
            .ok_or_else(|| MetricsError::invalid_argument("metric does not belong to this device"))?;
        *group = Some(source.create_group_from_metrics(name, metrics)?);
        Ok(())
    })();
    finish("device_create_metric_group_from_metrics", result)
}
