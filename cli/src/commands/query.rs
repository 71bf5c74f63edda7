//! Query command implementation

use super::{calculate, check, find_group, Session};
use crate::output;
use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use lzmetrics::api;
use lzmetrics::cmdlist::{Event, EventHandle};
use lzmetrics::sim::cmdlist::{HostEvent, RecordingCommandList};
use lzmetrics::{Device, MetricGroupHandle};
use lzmetrics_shared::utils::bytes_to_hex;
use lzmetrics_shared::{CalculatedValues, MetricQueryPoolDesc, SamplingType};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Event-based metric group to collect
    #[arg(short = 'G', long, default_value = "ComputeBasic")]
    pub group: String,

    /// Run on one subdevice instead of the root device
    #[arg(long)]
    pub sub_device: Option<u32>,

    /// Print the raw query data as hex
    #[arg(long)]
    pub raw: bool,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Activate `group`, run one query around an empty workload and return its raw data
pub fn collect(session: &Session, device: &Arc<Device>, group: &MetricGroupHandle) -> Result<Vec<u8>> {
    check(
        api::context_activate_metric_groups(&session.context, device, std::slice::from_ref(group)),
        "context_activate_metric_groups",
    )?;

    let mut pool = None;
    check(
        api::metric_query_pool_create(
            &session.context,
            device,
            Some(group),
            Some(&MetricQueryPoolDesc::performance(1)),
            &mut pool,
        ),
        "metric_query_pool_create",
    )?;
    let pool = pool.context("query pool was not created")?;

    let mut query = None;
    check(api::metric_query_create(&pool, 0, &mut query), "metric_query_create")?;
    let query = query.context("query was not created")?;

    let mut cmd = RecordingCommandList::new(device.clone());
    let done = HostEvent::new();
    check(api::command_list_append_metric_query_begin(&mut cmd, &query), "command_list_append_metric_query_begin")?;
    check(
        api::command_list_append_metric_query_end(&mut cmd, &query, Some(&(done.clone() as EventHandle)), &[]),
        "command_list_append_metric_query_end",
    )?;
    debug!(commands = cmd.commands().len(), "query recorded");
    if !done.is_signaled() {
        bail!("query end event was not signaled");
    }

    let mut size = 0;
    check(api::metric_query_get_data(&query, &mut size, None), "metric_query_get_data")?;
    let mut raw = vec![0u8; size];
    check(api::metric_query_get_data(&query, &mut size, Some(&mut raw[..])), "metric_query_get_data")?;
    raw.truncate(size);

    check(api::metric_query_destroy(query), "metric_query_destroy")?;
    check(api::metric_query_pool_destroy(pool), "metric_query_pool_destroy")?;
    check(
        api::context_activate_metric_groups(&session.context, device, &[]),
        "context_activate_metric_groups",
    )?;
    Ok(raw)
}

pub fn run(session: &Session, args: QueryArgs) -> Result<()> {
    let device = session.device(args.sub_device)?;
    let group = find_group(&device, &args.group, SamplingType::EventBased)?;
    let raw = collect(session, &device, &group)?;
    let values = calculate(&group, &raw)?;

    if args.json {
        let names: Vec<String> = group.metrics().iter().map(|m| m.properties().name).collect();
        let sets: Vec<_> = values.sets().map(|set| set.to_vec()).collect();
        let mut report = json!({
            "device": device.name(),
            "group": args.group,
            "metrics": names,
            "sets": sets,
        });
        if args.raw {
            report["raw"] = json!(bytes_to_hex(&raw));
        }
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    output::success(&format!("{} bytes of query data from {}", raw.len(), device.name()));
    if args.raw {
        println!("{}", bytes_to_hex(&raw));
    }
    print_sets(&group, &values);
    Ok(())
}

/// One block per result set, metric names cycling when a set spans several reports
pub fn print_sets(group: &MetricGroupHandle, values: &CalculatedValues) {
    let names: Vec<String> = group.metrics().iter().map(|m| m.properties().name).collect();
    for (i, set) in values.sets().enumerate() {
        println!("{}", format!("result set {}", i).bold());
        for (j, value) in set.iter().enumerate() {
            let name = names.get(j % names.len().max(1)).map(String::as_str).unwrap_or("?");
            println!("  {:<28} {:>16}", name, value.to_string());
        }
    }
}
