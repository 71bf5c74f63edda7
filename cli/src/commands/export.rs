//! Export command implementation

use super::{check, find_group, Session};
use crate::output;
use anyhow::{Context, Result};
use clap::Args;
use lzmetrics::api;
use lzmetrics_shared::protocol::export::ExportData;
use lzmetrics_shared::SamplingType;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Event-based metric group to collect
    #[arg(short = 'G', long, default_value = "ComputeBasic")]
    pub group: String,

    /// Run on one subdevice instead of the root device
    #[arg(long)]
    pub sub_device: Option<u32>,

    /// Output file for the export envelope
    #[arg(short, long, default_value = "metrics.export")]
    pub output: PathBuf,

    /// Decode an existing export file instead of capturing
    #[arg(long)]
    pub inspect: bool,
}

pub fn run(session: &Session, args: ExportArgs) -> Result<()> {
    if args.inspect {
        return inspect(&args);
    }

    let device = session.device(args.sub_device)?;
    let group = find_group(&device, &args.group, SamplingType::EventBased)?;
    let raw = super::query::collect(session, &device, &group)?;

    let mut size = 0;
    check(
        api::metric_group_get_export_data_exp(&group, &raw, &mut size, None),
        "metric_group_get_export_data_exp",
    )?;
    let mut data = vec![0u8; size];
    check(
        api::metric_group_get_export_data_exp(&group, &raw, &mut size, Some(&mut data[..])),
        "metric_group_get_export_data_exp",
    )?;
    data.truncate(size);

    std::fs::write(&args.output, &data)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    output::success(&format!(
        "wrote {} bytes ({} bytes raw) to {}",
        data.len(),
        raw.len(),
        args.output.display()
    ));
    Ok(())
}

fn inspect(args: &ExportArgs) -> Result<()> {
    let bytes = std::fs::read(&args.output)
        .with_context(|| format!("Failed to read {}", args.output.display()))?;
    let data = ExportData::from_bytes(&bytes).context("Not a valid export file")?;

    let set = &data.metric_set;
    output::info(&format!(
        "{} ({:?}, domain {}), generation id {}",
        set.group.name, set.group.sampling_type, set.group.domain, data.hardware_generation
    ));
    println!(
        "  raw report size {}, query report size {}, {} bytes of raw data",
        set.raw_report_size,
        set.query_report_size,
        data.raw_data.len()
    );
    for metric in &set.metrics {
        println!("  {:<28} {:?} [{}]", metric.name, metric.result_type, metric.result_units);
    }
    Ok(())
}
