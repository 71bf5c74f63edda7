//! Subcommands and the driver session they share

pub mod export;
pub mod list;
pub mod query;
pub mod stream;

use anyhow::{bail, Context as _, Result};
use lzmetrics::driver::{self, Context};
use lzmetrics::sim::SimPlatform;
use lzmetrics::{api, Device, HardwareGeneration, MetricGroupHandle, MetricsConfig};
use lzmetrics_shared::{CalculatedValues, CalculationType, ResultCode, SamplingType};
use std::sync::Arc;

/// Initialised driver plus the context every command works in
pub struct Session {
    pub context: Context,
    pub devices: Vec<Arc<Device>>,
}

impl Session {
    pub fn start(generation: HardwareGeneration, sub_devices: u32, config: MetricsConfig) -> Result<Self> {
        let platform = SimPlatform::new(generation)
            .with_sub_devices(sub_devices)
            .with_ip_sampling(true);
        let devices = driver::init(&platform, config).context("Failed to initialise driver")?;
        Ok(Self {
            context: Context::from_driver(),
            devices,
        })
    }

    /// Root device, or one of its subdevices when `sub_device` is given
    pub fn device(&self, sub_device: Option<u32>) -> Result<Arc<Device>> {
        let root = self.devices.first().context("No devices found")?;
        match sub_device {
            None => Ok(root.clone()),
            Some(index) => root
                .sub_devices()
                .get(index as usize)
                .cloned()
                .with_context(|| format!("Device {} has no subdevice {}", root.name(), index)),
        }
    }

    pub fn finish(self) {
        drop(self.devices);
        driver::teardown();
    }
}

/// Turn an API result code into an error naming the failed call
pub fn check(code: ResultCode, call: &str) -> Result<()> {
    if code.is_success() {
        Ok(())
    } else {
        bail!("{} failed: {}", call, code)
    }
}

pub fn all_groups(device: &Arc<Device>) -> Result<Vec<MetricGroupHandle>> {
    let mut count = 0;
    check(api::metric_group_get(device, &mut count, None), "metric_group_get")?;
    let mut groups = Vec::with_capacity(count as usize);
    check(api::metric_group_get(device, &mut count, Some(&mut groups)), "metric_group_get")?;
    Ok(groups)
}

pub fn find_group(device: &Arc<Device>, name: &str, sampling: SamplingType) -> Result<MetricGroupHandle> {
    all_groups(device)?
        .into_iter()
        .find(|g| {
            let props = g.properties();
            props.name == name && props.sampling_type == sampling
        })
        .with_context(|| format!("No {:?} metric group named {} on {}", sampling, name, device.name()))
}

/// Both passes of the multiple-value calculation
pub fn calculate(group: &MetricGroupHandle, raw: &[u8]) -> Result<CalculatedValues> {
    let mut data_count = 0;
    let mut total = 0;
    check(
        api::metric_group_calculate_multiple_metric_values_exp(
            group,
            CalculationType::MetricValues,
            raw,
            &mut data_count,
            &mut total,
            None,
            None,
        ),
        "metric_group_calculate_multiple_metric_values_exp",
    )?;

    let mut counts = Vec::with_capacity(data_count as usize);
    let mut values = Vec::with_capacity(total as usize);
    check(
        api::metric_group_calculate_multiple_metric_values_exp(
            group,
            CalculationType::MetricValues,
            raw,
            &mut data_count,
            &mut total,
            Some(&mut counts),
            Some(&mut values),
        ),
        "metric_group_calculate_multiple_metric_values_exp",
    )?;
    Ok(CalculatedValues {
        metric_counts: counts,
        values,
    })
}
