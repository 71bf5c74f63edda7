//! List command implementation

use super::{all_groups, Session};
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use lzmetrics::api;
use lzmetrics_shared::{MetricGroupProperties, MetricProperties};
use serde::Serialize;

#[derive(Args, Debug)]
pub struct ListArgs {
    /// List the groups of one subdevice instead of the root device
    #[arg(long)]
    pub sub_device: Option<u32>,

    /// Also list the metrics of every group
    #[arg(short, long)]
    pub metrics: bool,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct GroupListing {
    #[serde(flatten)]
    properties: MetricGroupProperties,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    metrics: Vec<MetricProperties>,
}

pub fn run(session: &Session, args: ListArgs) -> Result<()> {
    let device = session.device(args.sub_device)?;
    let mut listings = Vec::new();

    for group in all_groups(&device)? {
        let mut properties = None;
        super::check(api::metric_group_get_properties(&group, &mut properties), "metric_group_get_properties")?;
        let properties = properties.context("metric group returned no properties")?;

        let mut metrics = Vec::new();
        if args.metrics {
            let mut count = 0;
            let mut handles = Vec::new();
            super::check(api::metric_get(&group, &mut count, None), "metric_get")?;
            super::check(api::metric_get(&group, &mut count, Some(&mut handles)), "metric_get")?;
            for metric in &handles {
                let mut props = None;
                super::check(api::metric_get_properties(metric, &mut props), "metric_get_properties")?;
                metrics.extend(props);
            }
        }
        listings.push(GroupListing { properties, metrics });
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }

    println!(
        "{} ({}, {} metric group(s))",
        device.name().bold(),
        device.generation(),
        listings.len()
    );
    println!("  {:>3} {:<20} {:<11} {:>6} {:>7}", "#", "NAME", "SAMPLING", "DOMAIN", "METRICS");
    for (i, listing) in listings.iter().enumerate() {
        let props = &listing.properties;
        println!(
            "  {:>3} {:<20} {:<11} {:>6} {:>7}",
            i,
            props.name.cyan(),
            format!("{:?}", props.sampling_type),
            props.domain,
            props.metric_count
        );
        for metric in &listing.metrics {
            println!(
                "        {:<24} {:<10} {:?} [{}]",
                metric.name,
                metric.component,
                metric.result_type,
                metric.result_units
            );
        }
    }
    Ok(())
}
