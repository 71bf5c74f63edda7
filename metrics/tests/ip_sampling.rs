mod common;

use common::{config, group};
use lzmetrics::api;
use lzmetrics::cmdlist::{Event, EventHandle};
use lzmetrics::driver::Context;
use lzmetrics::sim::cmdlist::{HostEvent, RecordingCommandList};
use lzmetrics::sim::ip_sampling::{SimIpSamplingOs, SIM_IP_SAMPLING_BUFFER_SIZE};
use lzmetrics::sim::SimPlatform;
use lzmetrics::source::ip_sampling::{IpSamplingMetricSource, StallReport, IP_SAMPLING_REPORT_SIZE};
use lzmetrics::source::{MetricSource, SourceType};
use lzmetrics::{Device, HardwareGeneration, MetricGroupHandle, MetricStreamer};
use lzmetrics_shared::protocol::calculate::PackedRawData;
use lzmetrics_shared::{
    CalculatedValues, CalculationType, MetricStreamerDesc, MetricsError, ResultCode, SamplingType, TypedValue,
};
use std::sync::Arc;

const REPORT: usize = IP_SAMPLING_REPORT_SIZE as usize;

struct Setup {
    platform: SimPlatform,
    device: Arc<Device>,
    context: Context,
    group: MetricGroupHandle,
}

fn setup(platform: SimPlatform) -> Setup {
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let group = stall_group(&device);
    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[group.clone()]),
        ResultCode::Success
    );
    Setup {
        platform,
        device,
        context,
        group,
    }
}

fn stall_group(device: &Arc<Device>) -> MetricGroupHandle {
    group(device, "EuStallSampling", SamplingType::TimeBased)
}

fn sampling_os(platform: &SimPlatform, device: &Device) -> Arc<SimIpSamplingOs> {
    platform
        .services_for(device)
        .and_then(|s| s.ip_sampling().cloned())
        .expect("device has a stall sampling unit")
}

fn open(s: &Setup, desc: &mut MetricStreamerDesc, event: Option<EventHandle>) -> (ResultCode, Option<MetricStreamer>) {
    let mut streamer = None;
    let code = api::metric_streamer_open(&s.context, &s.device, &s.group, desc, event, &mut streamer);
    (code, streamer)
}

fn stall(ip: u64, active: u16, pipe: u16) -> StallReport {
    let mut counters = [0u16; 9];
    counters[0] = active;
    counters[2] = pipe;
    StallReport { ip, counters }
}

fn read_all(streamer: &MetricStreamer, max_reports: u32) -> Vec<u8> {
    let mut size = 0;
    assert_eq!(
        api::metric_streamer_read_data(streamer, max_reports, &mut size, None),
        ResultCode::Success
    );
    let mut data = vec![0u8; size];
    assert_eq!(
        api::metric_streamer_read_data(streamer, max_reports, &mut size, Some(&mut data[..])),
        ResultCode::Success
    );
    data.truncate(size);
    data
}

#[test]
fn test_stall_group_is_listed() {
    let platform = SimPlatform::new(HardwareGeneration::XeHpg).with_ip_sampling(true);
    let device = platform.build(&config(false));
    let stalls = stall_group(&device);

    let props = stalls.properties();
    assert_eq!(props.metric_count, 10);
    assert_eq!(stalls.source_type(), SourceType::IpSampling);
    assert!(!stalls.is_multi_device());
    let names: Vec<String> = stalls.metrics().iter().map(|m| m.properties().name).collect();
    assert_eq!(names[0], "IP");
    assert_eq!(names[1], "Active");
    assert_eq!(names[9], "OtherStall");
}

#[test]
fn test_missing_kernel_support_hides_group() {
    let platform = SimPlatform::new(HardwareGeneration::XeHpg).with_ip_sampling(false);
    let device = platform.build(&config(false));

    let groups = device.metric_context().metric_group_get().unwrap();
    assert!(groups.iter().all(|g| g.source_type() != SourceType::IpSampling));
    assert_eq!(api::device_enable_metrics_exp(&device), ResultCode::Success);
    let source = device
        .metric_context()
        .metric_source::<IpSamplingMetricSource>()
        .unwrap();
    assert!(!source.is_enabled());
}

#[test]
fn test_open_requires_activation() {
    let platform = SimPlatform::new(HardwareGeneration::XeHpg).with_ip_sampling(true);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let stalls = stall_group(&device);

    let mut streamer = None;
    let mut desc = MetricStreamerDesc::new(10, 1000);
    assert_eq!(
        api::metric_streamer_open(&context, &device, &stalls, &mut desc, None, &mut streamer),
        ResultCode::NotReady
    );
    assert!(streamer.is_none());
}

#[test]
fn test_activated_with_oa_group() {
    let platform = SimPlatform::new(HardwareGeneration::XeHpg).with_ip_sampling(true);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);

    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[compute, stall_group(&device)]),
        ResultCode::Success
    );
}

#[test]
fn test_second_open_is_in_use() {
    let s = setup(SimPlatform::new(HardwareGeneration::XeHpg).with_ip_sampling(true));
    let mut desc = MetricStreamerDesc::new(10, 1000);
    let first = open(&s, &mut desc, None).1.unwrap();

    let (code, second) = open(&s, &mut desc, None);
    assert_eq!(code, ResultCode::ErrorHandleObjectInUse);
    assert!(second.is_none());

    assert_eq!(api::metric_streamer_close(first), ResultCode::Success);
    assert!(!sampling_os(&s.platform, &s.device).is_running());
    assert_eq!(open(&s, &mut desc, None).0, ResultCode::Success);
}

#[test]
fn test_start_failure_propagates() {
    let s = setup(SimPlatform::new(HardwareGeneration::XeHpg).with_ip_sampling(true));
    let os = sampling_os(&s.platform, &s.device);
    os.fail_start(Some(MetricsError::not_available("stall sampling busy")));

    let mut desc = MetricStreamerDesc::new(10, 1000);
    assert_eq!(open(&s, &mut desc, None).0, ResultCode::ErrorNotAvailable);

    os.fail_start(None);
    assert_eq!(open(&s, &mut desc, None).0, ResultCode::Success);
}

#[test]
fn test_stop_failure_propagates_from_close() {
    let s = setup(SimPlatform::new(HardwareGeneration::XeHpg).with_ip_sampling(true));
    let os = sampling_os(&s.platform, &s.device);
    let mut desc = MetricStreamerDesc::new(10, 1000);
    let streamer = open(&s, &mut desc, None).1.unwrap();

    os.fail_stop(Some(MetricsError::unknown("stop failed")));
    assert_eq!(api::metric_streamer_close(streamer), ResultCode::ErrorUnknown);

    // the claim is released anyway
    os.fail_stop(None);
    assert_eq!(open(&s, &mut desc, None).0, ResultCode::Success);
}

#[test]
fn test_read_failure_propagates() {
    let s = setup(SimPlatform::new(HardwareGeneration::XeHpg).with_ip_sampling(true));
    let os = sampling_os(&s.platform, &s.device);
    let mut desc = MetricStreamerDesc::new(10, 1000);
    let streamer = open(&s, &mut desc, None).1.unwrap();

    os.fail_read(Some(MetricsError::unknown("read failed")));
    let mut data = vec![0u8; 4 * REPORT];
    let mut size = data.len();
    assert_eq!(
        api::metric_streamer_read_data(&streamer, 4, &mut size, Some(&mut data[..])),
        ResultCode::ErrorUnknown
    );
}

#[test]
fn test_marker_is_unsupported() {
    let s = setup(SimPlatform::new(HardwareGeneration::XeHpg).with_ip_sampling(true));
    let mut desc = MetricStreamerDesc::new(10, 1000);
    let streamer = open(&s, &mut desc, None).1.unwrap();

    let mut cmd = RecordingCommandList::new(s.device.clone());
    assert_eq!(
        api::command_list_append_metric_streamer_marker(&mut cmd, &streamer, 1),
        ResultCode::ErrorUnsupportedFeature
    );
    assert!(cmd.gpu_fragments().is_empty());
}

#[test]
fn test_event_signaled_when_reports_available() {
    let s = setup(SimPlatform::new(HardwareGeneration::XeHpg).with_ip_sampling(true));
    let os = sampling_os(&s.platform, &s.device);
    let event = HostEvent::new();
    let mut desc = MetricStreamerDesc::new(10, 1000);
    let streamer = open(&s, &mut desc, Some(event.clone() as EventHandle)).1.unwrap();

    assert!(!streamer.poll_notification(0).unwrap());
    assert!(!event.is_signaled());

    os.set_reports_available(true);
    assert!(streamer.poll_notification(0).unwrap());
    assert!(event.is_signaled());
}

#[test]
fn test_notify_and_buffer_size_written_back() {
    let s = setup(SimPlatform::new(HardwareGeneration::XeHpg).with_ip_sampling(true));
    sampling_os(&s.platform, &s.device).set_granted_notify(50);

    let mut desc = MetricStreamerDesc::new(100, 1000).with_buffer_size(4096);
    let streamer = open(&s, &mut desc, None).1.unwrap();
    assert_eq!(desc.notify_every_n_reports, 50);
    assert_eq!(streamer.notify_every_n_reports(), 50);
    assert_eq!(
        desc.buffer_size.unwrap().size_in_bytes,
        IP_SAMPLING_REPORT_SIZE as u64 * u32::MAX as u64
    );
    assert_eq!(streamer.hw_buffer_sizes(), vec![SIM_IP_SAMPLING_BUFFER_SIZE]);
}

#[test]
fn test_read_and_calculate_per_ip() {
    let s = setup(SimPlatform::new(HardwareGeneration::XeHpg).with_ip_sampling(true));
    let os = sampling_os(&s.platform, &s.device);
    os.push_reports(&[stall(0x100, 1, 2), stall(0x200, 5, 0), stall(0x100, 3, 4)]).unwrap();

    let mut desc = MetricStreamerDesc::new(10, 1000);
    let streamer = open(&s, &mut desc, None).1.unwrap();
    let data = read_all(&streamer, 10);
    assert_eq!(data.len(), 3 * REPORT);

    let mut data_count = 0;
    let mut total = 0;
    let mut metric_counts = Vec::new();
    let mut values = Vec::new();
    assert_eq!(
        api::metric_group_calculate_multiple_metric_values_exp(
            &s.group,
            CalculationType::MetricValues,
            &data,
            &mut data_count,
            &mut total,
            Some(&mut metric_counts),
            Some(&mut values)
        ),
        ResultCode::Success
    );
    assert_eq!((data_count, total), (2, 20));
    assert_eq!(metric_counts, vec![10, 10]);
    assert_eq!(values[0], TypedValue::Uint64(0x100));
    assert_eq!(values[1], TypedValue::Uint64(4));
    assert_eq!(values[3], TypedValue::Uint64(6));
    assert_eq!(values[10], TypedValue::Uint64(0x200));

    let mut count = 0;
    assert_eq!(
        api::metric_group_calculate_metric_values(&s.group, CalculationType::MaxMetricValues, &data, &mut count, None),
        ResultCode::ErrorUnsupportedFeature
    );
}

#[test]
fn test_small_buffer_reads_whole_reports() {
    let s = setup(SimPlatform::new(HardwareGeneration::XeHpg).with_ip_sampling(true));
    let os = sampling_os(&s.platform, &s.device);
    os.push_reports(&[stall(1, 1, 0), stall(2, 1, 0)]).unwrap();

    let mut desc = MetricStreamerDesc::new(10, 1000);
    let streamer = open(&s, &mut desc, None).1.unwrap();

    let mut data = vec![0u8; REPORT + 10];
    let mut size = data.len();
    assert_eq!(
        api::metric_streamer_read_data(&streamer, 10, &mut size, Some(&mut data[..])),
        ResultCode::Success
    );
    assert_eq!(size, REPORT);

    let mut count = 0;
    assert_eq!(
        api::metric_group_calculate_metric_values(
            &s.group,
            CalculationType::MetricValues,
            &data[..REPORT + 10],
            &mut count,
            None
        ),
        ResultCode::ErrorInvalidSize
    );
}

#[test]
fn test_calculation_operation_over_stalls() {
    let s = setup(SimPlatform::new(HardwareGeneration::XeHpg).with_ip_sampling(true));
    let os = sampling_os(&s.platform, &s.device);
    os.push_reports(&[stall(0x40, 7, 1)]).unwrap();
    let mut desc = MetricStreamerDesc::new(10, 1000);
    let streamer = open(&s, &mut desc, None).1.unwrap();
    let data = read_all(&streamer, 10);

    let mut operation = None;
    assert_eq!(
        api::metric_calculate_operation_create(
            &s.context,
            &s.device,
            &[s.group.clone()],
            &s.group.metrics()[2..],
            &mut operation
        ),
        ResultCode::Success
    );
    let mut results = None;
    assert_eq!(
        api::metric_calculate_operation_calculate(&operation.unwrap(), &[data.as_slice()], &mut results),
        ResultCode::Success
    );
    let results: CalculatedValues = results.unwrap();
    assert_eq!(results.values, vec![TypedValue::Uint64(0x40), TypedValue::Uint64(7)]);
}

#[test]
fn test_root_device_samples_every_sub_device() {
    let platform = SimPlatform::new(HardwareGeneration::XeHpg)
        .with_sub_devices(2)
        .with_ip_sampling(true);
    let s = setup(platform);
    assert!(s.group.is_multi_device());

    let subs = s.device.sub_devices().to_vec();
    sampling_os(&s.platform, &subs[0])
        .push_reports(&[stall(0x10, 1, 0), stall(0x10, 1, 0)])
        .unwrap();
    sampling_os(&s.platform, &subs[1])
        .push_reports(&[stall(0x20, 2, 0), stall(0x30, 3, 0), stall(0x10, 4, 0)])
        .unwrap();

    let mut desc = MetricStreamerDesc::new(10, 1000).with_buffer_size(1);
    let streamer = open(&s, &mut desc, None).1.unwrap();
    assert_eq!(
        desc.buffer_size.unwrap().size_in_bytes,
        2 * IP_SAMPLING_REPORT_SIZE as u64 * u32::MAX as u64
    );
    assert_eq!(streamer.hw_buffer_sizes().len(), 2);
    for sub in &subs {
        assert!(sampling_os(&s.platform, sub).is_running());
    }

    let data = read_all(&streamer, 10);
    let packed = PackedRawData::parse(&data).unwrap();
    assert_eq!(packed.sizes(), &[2 * REPORT as u32, 3 * REPORT as u32]);

    let mut out = CalculatedValues::default();
    let counts = s
        .group
        .calculate_multiple_metric_values(CalculationType::MetricValues, &data, Some(&mut out))
        .unwrap();
    // the same IP on two subdevices gives two result sets
    assert_eq!(counts.data_count, 4);
    assert_eq!(counts.total_metric_count, 40);
    assert_eq!(out.values[1], TypedValue::Uint64(2));

    let mut count = 0;
    assert_eq!(
        api::metric_group_calculate_metric_values(&s.group, CalculationType::MetricValues, &data, &mut count, None),
        ResultCode::ErrorUnknown
    );
    assert!(s
        .group
        .calculate_multiple_metric_values(CalculationType::MetricValues, &packed.part(0).unwrap().to_vec(), None)
        .is_err());

    assert_eq!(api::metric_streamer_close(streamer), ResultCode::Success);
    for sub in &subs {
        assert!(!sampling_os(&s.platform, sub).is_running());
    }
}

#[test]
fn test_root_open_failure_stops_started_sub_devices() {
    let platform = SimPlatform::new(HardwareGeneration::XeHpg)
        .with_sub_devices(2)
        .with_ip_sampling(true);
    let s = setup(platform);
    let subs = s.device.sub_devices().to_vec();
    sampling_os(&s.platform, &subs[1]).fail_start(Some(MetricsError::unknown("start failed")));

    let mut desc = MetricStreamerDesc::new(10, 1000);
    assert_eq!(open(&s, &mut desc, None).0, ResultCode::ErrorUnknown);
    let first = sampling_os(&s.platform, &subs[0]);
    assert_eq!(first.start_calls(), 1);
    assert_eq!(first.stop_calls(), 1);
    assert!(!first.is_running());
    for sub in &subs {
        let source = sub.metric_context().metric_source::<IpSamplingMetricSource>().unwrap();
        assert!(!source.is_streamer_open());
    }
}

#[test]
fn test_root_group_is_rejected_on_sub_device() {
    let platform = SimPlatform::new(HardwareGeneration::XeHpg)
        .with_sub_devices(2)
        .with_ip_sampling(true);
    let device = platform.build(&config(false));
    let sub = device.sub_devices()[0].clone();
    let context = Context::new(vec![device.clone()]);

    assert_eq!(
        api::context_activate_metric_groups(&context, &sub, &[stall_group(&device)]),
        ResultCode::ErrorInvalidArgument
    );
    assert!(!stall_group(&sub).is_multi_device());
}

#[test]
fn test_root_needs_every_sub_device_unit() {
    let platform = SimPlatform::new(HardwareGeneration::XeHpg)
        .with_sub_devices(2)
        .with_ip_sampling(false);
    let device = platform.build(&config(false));
    let source = device
        .metric_context()
        .metric_source::<IpSamplingMetricSource>()
        .unwrap();

    assert!(source.is_implicit_scaling_root());
    assert!(!source.is_available());
    assert!(source.supports_calculation_operations());
}
