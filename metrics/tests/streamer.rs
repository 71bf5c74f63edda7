mod common;

use common::{config, group, oa_source};
use lzmetrics::api;
use lzmetrics::cmdlist::{Event, EventHandle};
use lzmetrics::driver::Context;
use lzmetrics::sim::cmdlist::{HostEvent, RecordedCommand, RecordingCommandList};
use lzmetrics::sim::{SimControls, SimPlatform};
use lzmetrics::{Device, HardwareGeneration, MetricGroupHandle, MetricStreamer};
use lzmetrics_shared::protocol::calculate::PackedRawData;
use lzmetrics_shared::{
    CalculatedValues, CalculationType, MetricQueryPoolDesc, MetricStreamerDesc, ResultCode, SamplingType,
};
use std::sync::Arc;

struct Setup {
    platform: SimPlatform,
    device: Arc<Device>,
    context: Context,
    group: MetricGroupHandle,
}

fn setup(platform: SimPlatform, group_name: &str) -> Setup {
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let group = group(&device, group_name, SamplingType::TimeBased);
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

fn open(s: &Setup, desc: &mut MetricStreamerDesc, event: Option<EventHandle>) -> (ResultCode, Option<MetricStreamer>) {
    let mut streamer = None;
    let code = api::metric_streamer_open(&s.context, &s.device, &s.group, desc, event, &mut streamer);
    (code, streamer)
}

#[test]
fn test_open_requires_activation() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let memory = group(&device, "MemoryProfile", SamplingType::TimeBased);

    let mut streamer = None;
    let mut desc = MetricStreamerDesc::new(100, 10_000);
    assert_eq!(
        api::metric_streamer_open(&context, &device, &memory, &mut desc, None, &mut streamer),
        ResultCode::NotReady
    );

    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[compute.clone()]),
        ResultCode::Success
    );
    assert_eq!(
        api::metric_streamer_open(&context, &device, &compute, &mut desc, None, &mut streamer),
        ResultCode::ErrorInvalidArgument
    );
    assert!(streamer.is_none());
}

#[test]
fn test_notify_written_back_from_buffer_size() {
    let s = setup(SimPlatform::new(HardwareGeneration::Gen12Lp), "MemoryProfile");

    let mut desc = MetricStreamerDesc::new(100, 10_000);
    let (code, streamer) = open(&s, &mut desc, None);
    assert_eq!(code, ResultCode::Success);
    let streamer = streamer.unwrap();
    // room for two intervals less two reports
    assert_eq!(streamer.hw_buffer_sizes(), vec![100 * 256 * 2 - 2 * 256]);
    assert_eq!(desc.notify_every_n_reports, 99);
    drop(streamer);

    s.platform.controls().set_oa_buffer_size(Some(32768 * 256 * 2 - 512));
    let mut desc = MetricStreamerDesc::new(100, 10_000);
    let (code, streamer) = open(&s, &mut desc, None);
    assert_eq!(code, ResultCode::Success);
    assert_eq!(desc.notify_every_n_reports, 32767);
    assert_eq!(streamer.unwrap().notify_every_n_reports(), 32767);
}

#[test]
fn test_buffer_size_hint_is_requested() {
    let s = setup(SimPlatform::new(HardwareGeneration::Gen12Lp), "MemoryProfile");

    let mut desc = MetricStreamerDesc::new(10, 10_000).with_buffer_size(1 << 20);
    let (code, streamer) = open(&s, &mut desc, None);
    assert_eq!(code, ResultCode::Success);
    assert_eq!(streamer.unwrap().hw_buffer_sizes(), vec![1 << 20]);
    assert_eq!(desc.notify_every_n_reports, (1 << 20) / 512);
}

#[test]
fn test_read_reports_and_calculate() {
    let s = setup(SimPlatform::new(HardwareGeneration::Gen12Lp), "MemoryProfile");
    let mut desc = MetricStreamerDesc::new(100, 10_000);
    let streamer = open(&s, &mut desc, None).1.unwrap();

    let mut size = 0;
    assert_eq!(api::metric_streamer_read_data(&streamer, 5, &mut size, None), ResultCode::Success);
    assert_eq!(size, 5 * 256);

    let mut data = vec![0u8; size];
    assert_eq!(
        api::metric_streamer_read_data(&streamer, 5, &mut size, Some(&mut data[..])),
        ResultCode::Success
    );
    assert_eq!(size, 5 * 256);

    let mut data_count = 0;
    let mut total = 0;
    assert_eq!(
        api::metric_group_calculate_multiple_metric_values_exp(
            &s.group,
            CalculationType::MetricValues,
            &data[..size],
            &mut data_count,
            &mut total,
            None,
            None
        ),
        ResultCode::Success
    );
    assert_eq!((data_count, total), (1, 25));
}

#[test]
fn test_dropped_data_then_failure() {
    let s = setup(SimPlatform::new(HardwareGeneration::Gen12Lp), "MemoryProfile");
    let mut desc = MetricStreamerDesc::new(100, 10_000);
    let streamer = open(&s, &mut desc, None).1.unwrap();
    let mut data = vec![0u8; 4 * 256];

    SimControls::toggle(&s.platform.controls().overflow_next_read, true);
    let mut size = data.len();
    assert_eq!(
        api::metric_streamer_read_data(&streamer, 4, &mut size, Some(&mut data[..])),
        ResultCode::WarningDroppedData
    );
    assert_eq!(size, 4 * 256);

    let mut size = data.len();
    assert_eq!(
        api::metric_streamer_read_data(&streamer, 4, &mut size, Some(&mut data[..])),
        ResultCode::Success
    );

    SimControls::toggle(&s.platform.controls().fail_io_read, true);
    let mut size = data.len();
    assert_eq!(
        api::metric_streamer_read_data(&streamer, 4, &mut size, Some(&mut data[..])),
        ResultCode::ErrorUnknown
    );
}

#[test]
fn test_one_streamer_per_source() {
    let s = setup(SimPlatform::new(HardwareGeneration::Gen12Lp), "MemoryProfile");
    let mut desc = MetricStreamerDesc::new(100, 10_000);
    let first = open(&s, &mut desc, None).1.unwrap();

    let (code, second) = open(&s, &mut desc, None);
    assert_eq!(code, ResultCode::ErrorNotAvailable);
    assert!(second.is_none());

    // the first one keeps working
    let mut size = 0;
    assert_eq!(api::metric_streamer_read_data(&first, 1, &mut size, None), ResultCode::Success);
    assert_eq!(api::metric_streamer_close(first), ResultCode::Success);
    assert!(!oa_source(&s.device).is_streamer_open());
    assert!(open(&s, &mut desc, None).1.is_some());
}

#[test]
fn test_streamer_and_pool_exclude_each_other() {
    let s = setup(SimPlatform::new(HardwareGeneration::Gen12Lp), "ComputeBasic");
    let compute = group(&s.device, "ComputeBasic", SamplingType::EventBased);
    let pool_desc = MetricQueryPoolDesc::performance(2);

    let mut desc = MetricStreamerDesc::new(100, 10_000);
    let streamer = open(&s, &mut desc, None).1.unwrap();
    let mut pool = None;
    assert_eq!(
        api::metric_query_pool_create(&s.context, &s.device, Some(&compute), Some(&pool_desc), &mut pool),
        ResultCode::ErrorNotAvailable
    );
    assert_eq!(api::metric_streamer_close(streamer), ResultCode::Success);

    assert_eq!(
        api::metric_query_pool_create(&s.context, &s.device, Some(&compute), Some(&pool_desc), &mut pool),
        ResultCode::Success
    );
    let (code, streamer) = open(&s, &mut desc, None);
    assert_eq!(code, ResultCode::ErrorNotAvailable);
    assert!(streamer.is_none());

    // execution pools do not hold the sampling hardware
    drop(pool);
    let mut execution = None;
    assert_eq!(
        api::metric_query_pool_create(
            &s.context,
            &s.device,
            None,
            Some(&MetricQueryPoolDesc::execution(1)),
            &mut execution
        ),
        ResultCode::Success
    );
    assert_eq!(open(&s, &mut desc, None).0, ResultCode::Success);
}

#[test]
fn test_close_failure_still_releases() {
    let s = setup(SimPlatform::new(HardwareGeneration::Gen12Lp), "MemoryProfile");
    let mut desc = MetricStreamerDesc::new(100, 10_000);
    let streamer = open(&s, &mut desc, None).1.unwrap();

    SimControls::toggle(&s.platform.controls().fail_io_close, true);
    assert_eq!(api::metric_streamer_close(streamer), ResultCode::ErrorUnknown);
    assert!(!oa_source(&s.device).is_streamer_open());

    SimControls::toggle(&s.platform.controls().fail_io_close, false);
    assert_eq!(open(&s, &mut desc, None).0, ResultCode::Success);
}

#[test]
fn test_open_failure_releases_claim() {
    let s = setup(SimPlatform::new(HardwareGeneration::Gen12Lp), "MemoryProfile");
    let mut desc = MetricStreamerDesc::new(100, 10_000);

    SimControls::toggle(&s.platform.controls().fail_io_open, true);
    assert_eq!(open(&s, &mut desc, None).0, ResultCode::ErrorUnknown);
    assert!(!oa_source(&s.device).is_streamer_open());
}

#[test]
fn test_notification_signals_event() {
    let s = setup(SimPlatform::new(HardwareGeneration::Gen12Lp), "MemoryProfile");
    let event = HostEvent::new();
    let mut desc = MetricStreamerDesc::new(100, 10_000);
    let streamer = open(&s, &mut desc, Some(event.clone() as EventHandle)).1.unwrap();

    assert!(streamer.poll_notification(10).unwrap());
    assert!(event.is_signaled());

    event.host_reset();
    s.platform.controls().set_stream_reports(&[0]);
    assert!(!streamer.poll_notification(10).unwrap());
    assert!(!event.is_signaled());
}

#[test]
fn test_marker_on_device() {
    let s = setup(SimPlatform::new(HardwareGeneration::Gen12Lp), "MemoryProfile");
    let mut desc = MetricStreamerDesc::new(100, 10_000);
    let streamer = open(&s, &mut desc, None).1.unwrap();

    let mut cmd = RecordingCommandList::new(s.device.clone());
    assert_eq!(
        api::command_list_append_metric_streamer_marker(&mut cmd, &streamer, 0x1234),
        ResultCode::Success
    );
    let fragments = cmd.gpu_fragments();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0][0], 0x4D);
    assert_eq!(&fragments[0][16..20], &0x1234u32.to_le_bytes());

    let unrelated = SimPlatform::new(HardwareGeneration::Gen12Lp).build(&config(false));
    let mut cmd = RecordingCommandList::new(unrelated);
    assert_eq!(
        api::command_list_append_metric_streamer_marker(&mut cmd, &streamer, 1),
        ResultCode::ErrorInvalidArgument
    );
}

#[test]
fn test_multi_device_read_is_packed() {
    let platform = SimPlatform::new(HardwareGeneration::XeHpg).with_sub_devices(2);
    platform.controls().set_stream_reports(&[10, 20]);
    let s = setup(platform, "MemoryProfile");
    assert!(s.group.is_multi_device());

    let mut desc = MetricStreamerDesc::new(100, 10_000);
    let streamer = open(&s, &mut desc, None).1.unwrap();
    assert_eq!(streamer.hw_buffer_sizes().len(), 2);
    for sub in s.device.sub_devices() {
        assert!(oa_source(sub).is_streamer_open());
    }

    let mut size = 0;
    assert_eq!(api::metric_streamer_read_data(&streamer, 20, &mut size, None), ResultCode::Success);
    assert_eq!(size, 20 + 8 * 2 + 2 * 20 * 256);

    let mut data = vec![0u8; size];
    assert_eq!(
        api::metric_streamer_read_data(&streamer, 20, &mut size, Some(&mut data[..])),
        ResultCode::Success
    );
    assert_eq!(size, 20 + 8 * 2 + 30 * 256);

    let packed = PackedRawData::parse(&data[..size]).unwrap();
    assert_eq!(packed.offsets(), &[0, 2560]);
    assert_eq!(packed.sizes(), &[2560, 5120]);

    let mut out = CalculatedValues::default();
    let counts = s
        .group
        .calculate_multiple_metric_values(CalculationType::MetricValues, &data[..size], Some(&mut out))
        .unwrap();
    assert_eq!(counts.data_count, 30);
    assert_eq!(counts.total_metric_count, 30 * 5);
    assert_eq!(out.data_count(), 30);

    // subdevice sources are busy too
    let sub = &s.device.sub_devices()[0];
    let compute = group(sub, "ComputeBasic", SamplingType::EventBased);
    let mut pool = None;
    assert_eq!(
        api::metric_query_pool_create(
            &s.context,
            sub,
            Some(&compute),
            Some(&MetricQueryPoolDesc::performance(1)),
            &mut pool
        ),
        ResultCode::ErrorNotAvailable
    );
}

#[test]
fn test_marker_under_implicit_scaling() {
    let s = setup(SimPlatform::new(HardwareGeneration::XeHpg).with_sub_devices(2), "MemoryProfile");
    let mut desc = MetricStreamerDesc::new(100, 10_000);
    let streamer = open(&s, &mut desc, None).1.unwrap();

    let mut cmd = RecordingCommandList::new(s.device.clone());
    streamer.append_marker(&mut cmd, 7).unwrap();
    assert_eq!(cmd.commands().len(), 3);
    assert_eq!(cmd.commands()[0], RecordedCommand::PartitionPrologue(0));
    assert_eq!(cmd.commands()[2], RecordedCommand::PartitionEpilogue);

    let mut sub_cmd = RecordingCommandList::new(s.device.sub_devices()[1].clone());
    streamer.append_marker(&mut sub_cmd, 7).unwrap();
    assert_eq!(sub_cmd.gpu_fragments().len(), 1);
    assert!(!matches!(sub_cmd.commands()[0], RecordedCommand::PartitionPrologue(_)));
}
