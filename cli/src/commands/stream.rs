//! Stream command implementation

use super::{calculate, check, find_group, Session};
use crate::output;
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use lzmetrics::api;
use lzmetrics::cmdlist::{Event, EventHandle};
use lzmetrics::sim::cmdlist::{HostEvent, RecordingCommandList};
use lzmetrics_shared::utils::parse_sampling_period;
use lzmetrics_shared::{CalculatedValues, MetricStreamerDesc, ResultCode, SamplingType};
use serde_json::json;
use std::time::Duration;

#[derive(Args, Debug)]
pub struct StreamArgs {
    /// Time-based metric group to sample
    #[arg(short = 'G', long, default_value = "ComputeBasic")]
    pub group: String,

    /// Run on one subdevice instead of the root device
    #[arg(long)]
    pub sub_device: Option<u32>,

    /// Requested notification threshold in reports
    #[arg(short, long, default_value = "100")]
    pub notify: u32,

    /// Sampling period (e.g., "100us", "1ms")
    #[arg(short, long, default_value = "100us")]
    pub period: String,

    /// Number of reads to perform
    #[arg(short, long, default_value = "3")]
    pub reads: u32,

    /// Upper bound of reports per read
    #[arg(short, long, default_value = "10")]
    pub max_reports: u32,

    /// Write a marker before the first read
    #[arg(long)]
    pub marker: Option<u32>,

    /// Print JSON instead of a summary
    #[arg(long)]
    pub json: bool,
}

pub fn run(session: &Session, args: StreamArgs) -> Result<()> {
    let device = session.device(args.sub_device)?;
    let group = find_group(&device, &args.group, SamplingType::TimeBased)?;
    let sampling_period = parse_sampling_period(&args.period).context("Invalid sampling period")?;

    check(
        api::context_activate_metric_groups(&session.context, &device, std::slice::from_ref(&group)),
        "context_activate_metric_groups",
    )?;

    let notified = HostEvent::new();
    let mut desc = MetricStreamerDesc::new(args.notify, sampling_period);
    let mut streamer = None;
    check(
        api::metric_streamer_open(
            &session.context,
            &device,
            &group,
            &mut desc,
            Some(notified.clone() as EventHandle),
            &mut streamer,
        ),
        "metric_streamer_open",
    )?;
    let streamer = streamer.context("streamer was not opened")?;
    if desc.notify_every_n_reports != args.notify {
        output::info(&format!(
            "notification threshold adjusted to {} reports",
            desc.notify_every_n_reports
        ));
    }

    if let Some(value) = args.marker {
        let mut cmd = RecordingCommandList::new(device.clone());
        check(
            api::command_list_append_metric_streamer_marker(&mut cmd, &streamer, value),
            "command_list_append_metric_streamer_marker",
        )?;
    }

    let progress = if args.json {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(args.reads as u64)
    };
    progress.set_style(
        ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} reads {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    progress.enable_steady_tick(Duration::from_millis(100));

    let mut all = CalculatedValues::default();
    let mut bytes = 0usize;
    let mut dropped = 0u32;
    for _ in 0..args.reads {
        if streamer.poll_notification(0).unwrap_or(false) && notified.is_signaled() {
            progress.set_message("notified");
            notified.host_reset();
        }

        let mut size = 0;
        check(
            api::metric_streamer_read_data(&streamer, args.max_reports, &mut size, None),
            "metric_streamer_read_data",
        )?;
        let mut raw = vec![0u8; size];
        let code = api::metric_streamer_read_data(&streamer, args.max_reports, &mut size, Some(&mut raw[..]));
        check(code, "metric_streamer_read_data")?;
        if code == ResultCode::WarningDroppedData {
            dropped += 1;
        }
        raw.truncate(size);
        bytes += size;

        if size > 0 {
            let values = calculate(&group, &raw)?;
            for set in values.sets() {
                all.push_set(set.to_vec());
            }
        }
        progress.inc(1);
    }
    progress.finish_and_clear();

    check(api::metric_streamer_close(streamer), "metric_streamer_close")?;
    check(
        api::context_activate_metric_groups(&session.context, &device, &[]),
        "context_activate_metric_groups",
    )?;

    let names: Vec<String> = group.metrics().iter().map(|m| m.properties().name).collect();
    let averages = averages(&all, names.len());

    if args.json {
        let per_metric: Vec<_> = names
            .iter()
            .zip(&averages)
            .map(|(name, average)| json!({ "metric": name, "average": average }))
            .collect();
        let report = json!({
            "device": device.name(),
            "group": args.group,
            "notify_every_n_reports": desc.notify_every_n_reports,
            "bytes": bytes,
            "result_sets": all.data_count(),
            "dropped_reads": dropped,
            "averages": per_metric,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    output::success(&format!(
        "read {} bytes in {} read(s), {} result set(s)",
        bytes,
        args.reads,
        all.data_count()
    ));
    if dropped > 0 {
        output::warning(&format!("{} read(s) reported dropped reports", dropped));
    }
    println!("{}", "average per report".bold());
    for (name, average) in names.iter().zip(&averages) {
        println!("  {:<28} {:>16.3}", name, average);
    }
    Ok(())
}

/// Mean of each metric position across all result sets
fn averages(values: &CalculatedValues, metric_count: usize) -> Vec<f64> {
    let mut sums = vec![0.0; metric_count];
    let mut samples = vec![0u32; metric_count];
    for set in values.sets() {
        for (i, value) in set.iter().enumerate() {
            let slot = i % metric_count.max(1);
            if let (Some(sum), Some(n)) = (sums.get_mut(slot), samples.get_mut(slot)) {
                *sum += value.as_f64();
                *n += 1;
            }
        }
    }
    sums.iter()
        .zip(&samples)
        .map(|(sum, n)| if *n == 0 { 0.0 } else { sum / *n as f64 })
        .collect()
}
