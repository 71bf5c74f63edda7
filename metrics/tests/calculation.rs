mod common;

use common::{config, group, oa_source};
use lzmetrics::api;
use lzmetrics::driver::Context;
use lzmetrics::sim::discovery::{write_report, QUERY_REPORT_SIZE};
use lzmetrics::sim::{SimControls, SimPlatform};
use lzmetrics::sim::source::MockSourceOptions;
use lzmetrics::HardwareGeneration;
use lzmetrics_shared::protocol::export::ExportData;
use lzmetrics_shared::{CalculatedValues, CalculationType, ResultCode, SamplingType, TypedValue};

fn query_report(seed: u64) -> Vec<u8> {
    let mut raw = vec![0u8; QUERY_REPORT_SIZE as usize];
    write_report(&mut raw, seed);
    raw
}

fn raw_u64(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[test]
fn test_calculate_values_two_phase() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let raw = query_report(1000);

    let mut count = 0;
    assert_eq!(
        api::metric_group_calculate_metric_values(&compute, CalculationType::MetricValues, &raw, &mut count, None),
        ResultCode::Success
    );
    assert_eq!(count, 5);

    let mut values = Vec::new();
    count = 3;
    assert_eq!(
        api::metric_group_calculate_metric_values(
            &compute,
            CalculationType::MetricValues,
            &raw,
            &mut count,
            Some(&mut values)
        ),
        ResultCode::Success
    );
    assert_eq!(count, 3);
    assert_eq!(values.len(), 3);
    assert_eq!(values[0], TypedValue::Uint64(1000));
}

#[test]
fn test_max_metric_values() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let raw = query_report(1000);

    let mut count = 5;
    let mut values = Vec::new();
    assert_eq!(
        api::metric_group_calculate_metric_values(
            &compute,
            CalculationType::MaxMetricValues,
            &raw,
            &mut count,
            Some(&mut values)
        ),
        ResultCode::Success
    );
    assert_eq!(count, 5);
    assert_eq!(values[0], TypedValue::Uint64(u64::MAX));
}

#[test]
fn test_partial_report_is_rejected() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let raw = query_report(1000);

    let mut count = 0;
    assert_eq!(
        api::metric_group_calculate_metric_values(
            &compute,
            CalculationType::MetricValues,
            &raw[..100],
            &mut count,
            None
        ),
        ResultCode::ErrorUnknown
    );
}

#[test]
fn test_operation_rejects_mixed_sources() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp).with_mock_source(true);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let mock = group(&device, "MockCounters", SamplingType::EventBased);

    let mut operation = None;
    assert_eq!(
        api::metric_calculate_operation_create(&context, &device, &[compute, mock], &[], &mut operation),
        ResultCode::ErrorInvalidArgument
    );
    assert!(operation.is_none());

    assert_eq!(
        api::metric_calculate_operation_create(&context, &device, &[], &[], &mut operation),
        ResultCode::ErrorInvalidArgument
    );
}

#[test]
fn test_operation_needs_calculating_source() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp).with_mock_source_options(MockSourceOptions {
        calculation_operations: false,
        ..MockSourceOptions::default()
    });
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let mock = group(&device, "MockCounters", SamplingType::EventBased);

    let mut operation = None;
    assert_eq!(
        api::metric_calculate_operation_create(&context, &device, &[mock], &[], &mut operation),
        ResultCode::ErrorUnsupportedFeature
    );
}

#[test]
fn test_excluded_metrics_are_filtered() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp).with_mock_source(true);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let mock = group(&device, "MockCounters", SamplingType::EventBased);
    let metrics = mock.metrics();

    let mut operation = None;
    assert_eq!(
        api::metric_calculate_operation_create(
            &context,
            &device,
            &[mock.clone()],
            &metrics[..1],
            &mut operation
        ),
        ResultCode::Success
    );
    let operation = operation.unwrap();
    assert_eq!(operation.report_metrics().len(), 1);
    assert_eq!(operation.report_metrics()[0].properties().name, "MockCountersCycles");

    let raw = raw_u64(&[1, 2, 3, 4]);
    let mut results = None;
    assert_eq!(
        api::metric_calculate_operation_calculate(&operation, &[raw.as_slice()], &mut results),
        ResultCode::Success
    );
    let results = results.unwrap();
    let sets: Vec<&[TypedValue]> = results.sets().collect();
    assert_eq!(sets, vec![&[TypedValue::Uint64(2)][..], &[TypedValue::Uint64(4)][..]]);

    let mut none = None;
    assert_eq!(
        api::metric_calculate_operation_calculate(&operation, &[], &mut none),
        ResultCode::ErrorInvalidArgument
    );
    assert_eq!(api::metric_calculate_operation_destroy(operation), ResultCode::Success);
}

#[test]
fn test_excluded_metric_must_be_member() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let render = group(&device, "RenderBasic", SamplingType::EventBased);

    let mut operation = None;
    assert_eq!(
        api::metric_calculate_operation_create(&context, &device, &[compute], &render.metrics()[..1], &mut operation),
        ResultCode::ErrorInvalidArgument
    );
}

#[test]
fn test_operation_filters_every_report() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let metrics = compute.metrics();

    let mut operation = None;
    assert_eq!(
        api::metric_calculate_operation_create(&context, &device, &[compute.clone()], &metrics[..1], &mut operation),
        ResultCode::Success
    );
    let operation = operation.unwrap();

    let mut raw = query_report(1000);
    raw.extend(query_report(2000));
    let mut results = None;
    assert_eq!(
        api::metric_calculate_operation_calculate(&operation, &[raw.as_slice()], &mut results),
        ResultCode::Success
    );
    let results: CalculatedValues = results.unwrap();
    assert_eq!(results.total_metric_count(), 8);
    assert!(!results.values.contains(&TypedValue::Uint64(1000)));
    assert!(!results.values.contains(&TypedValue::Uint64(2000)));
}

#[test]
fn test_export_data() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let raw = query_report(1000);

    let mut size = 0;
    assert_eq!(
        api::metric_group_get_export_data_exp(&compute, &raw, &mut size, None),
        ResultCode::Success
    );
    assert!(size > raw.len());

    let mut small = vec![0u8; 16];
    let mut small_size = small.len();
    assert_eq!(
        api::metric_group_get_export_data_exp(&compute, &raw, &mut small_size, Some(&mut small[..])),
        ResultCode::ErrorInvalidSize
    );

    let mut buffer = vec![0u8; size];
    assert_eq!(
        api::metric_group_get_export_data_exp(&compute, &raw, &mut size, Some(&mut buffer[..])),
        ResultCode::Success
    );
    let exported = ExportData::from_bytes(&buffer[..size]).unwrap();
    assert_eq!(exported.metric_set.group.name, "ComputeBasic");
    assert_eq!(exported.metric_set.metrics.len(), 5);
    assert_eq!(exported.raw_data, raw);
    assert_eq!(exported.hardware_generation, HardwareGeneration::Gen12Lp.metrics_library_gen_id());
}

#[test]
fn test_export_is_oa_only() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp).with_mock_source(true);
    let device = platform.build(&config(false));
    let mock = group(&device, "MockCounters", SamplingType::EventBased);

    let mut size = 0;
    assert_eq!(
        api::metric_group_get_export_data_exp(&mock, &raw_u64(&[1, 2]), &mut size, None),
        ResultCode::ErrorUnsupportedFeature
    );
}

#[test]
fn test_group_from_metrics() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp).with_mock_source(true);
    let device = platform.build(&config(false));
    let mock = group(&device, "MockCounters", SamplingType::EventBased);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);

    let mut custom = None;
    assert_eq!(
        api::device_create_metric_group_from_metrics(&device, "Cycles", &mock.metrics()[1..], &mut custom),
        ResultCode::Success
    );
    let custom = custom.unwrap();
    assert_eq!(custom.properties().name, "Cycles");
    assert_eq!(custom.properties().metric_count, 1);
    assert_eq!(custom.source_id(), mock.source_id());

    let mut none = None;
    assert_eq!(
        api::device_create_metric_group_from_metrics(&device, "Empty", &[], &mut none),
        ResultCode::ErrorInvalidArgument
    );
    assert_eq!(
        api::device_create_metric_group_from_metrics(
            &device,
            "Mixed",
            &[mock.metrics()[0].clone(), compute.metrics()[0].clone()],
            &mut none
        ),
        ResultCode::ErrorInvalidArgument
    );
    assert!(none.is_none());
}

#[test]
fn test_oa_group_from_metrics() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let render = group(&device, "RenderBasic", SamplingType::EventBased);
    let picked = vec![
        compute.metrics()[0].clone(),
        compute.metrics()[1].clone(),
        render.metrics()[2].clone(),
    ];

    let mut custom = None;
    assert_eq!(
        api::device_create_metric_group_from_metrics(&device, "Custom", &picked, &mut custom),
        ResultCode::Success
    );
    let custom = custom.unwrap();
    let props = custom.properties();
    assert_eq!(props.name, "Custom");
    assert_eq!(props.metric_count, 3);
    assert_eq!(props.sampling_type, SamplingType::EventBased);
    assert_eq!(props.domain, compute.properties().domain);
    assert_eq!(custom.source_id(), compute.source_id());
    let names: Vec<String> = custom.metrics().iter().map(|m| m.properties().name).collect();
    assert_eq!(names, vec!["GpuTime", "GpuBusy", "SamplerBusy"]);

    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[custom.clone()]),
        ResultCode::Success
    );
    let mut count = 0;
    let mut values = Vec::new();
    assert_eq!(
        api::metric_group_calculate_metric_values(
            &custom,
            CalculationType::MetricValues,
            &query_report(1000),
            &mut count,
            None
        ),
        ResultCode::Success
    );
    assert_eq!(count, 3);
    assert_eq!(
        api::metric_group_calculate_metric_values(
            &custom,
            CalculationType::MetricValues,
            &query_report(1000),
            &mut count,
            Some(&mut values)
        ),
        ResultCode::Success
    );
    assert_eq!(values[0], TypedValue::Uint64(1000));
}

#[test]
fn test_oa_group_from_metrics_needs_one_domain_and_sampling() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let memory = group(&device, "MemoryProfile", SamplingType::TimeBased);

    let mut none = None;
    assert_eq!(
        api::device_create_metric_group_from_metrics(
            &device,
            "Mixed",
            &[compute.metrics()[0].clone(), memory.metrics()[1].clone()],
            &mut none
        ),
        ResultCode::ErrorInvalidArgument
    );
    assert_eq!(
        api::device_create_metric_group_from_metrics(
            &device,
            "Twice",
            &[compute.metrics()[0].clone(), compute.metrics()[0].clone()],
            &mut none
        ),
        ResultCode::ErrorInvalidArgument
    );
    assert!(none.is_none());
}

#[test]
fn test_oa_group_from_metrics_library_failure() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);

    SimControls::toggle(&platform.controls().fail_metric_set_create, true);
    let mut none = None;
    assert_eq!(
        api::device_create_metric_group_from_metrics(&device, "Custom", &compute.metrics()[..1], &mut none),
        ResultCode::ErrorUnknown
    );
}

#[test]
fn test_root_group_from_metrics_spans_sub_devices() {
    let platform = SimPlatform::new(HardwareGeneration::XeHpg).with_sub_devices(2);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);

    let mut custom = None;
    assert_eq!(
        api::device_create_metric_group_from_metrics(&device, "Custom", &compute.metrics()[..2], &mut custom),
        ResultCode::Success
    );
    let custom = custom.unwrap();
    assert!(custom.is_multi_device());
    assert_eq!(custom.properties().metric_count, 2);
    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[custom]),
        ResultCode::Success
    );
    for sub in device.sub_devices() {
        assert!(oa_source(sub).is_active_in_hw());
    }
}

#[test]
fn test_root_group_from_metrics_errors() {
    let platform = SimPlatform::new(HardwareGeneration::XeHpg).with_sub_devices(2);
    let device = platform.build(&config(false));
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let sub_compute = group(&device.sub_devices()[0], "ComputeBasic", SamplingType::EventBased);

    let mut none = None;
    assert_eq!(
        api::device_create_metric_group_from_metrics(
            &device,
            "Custom",
            &[compute.metrics()[0].clone(), sub_compute.metrics()[1].clone()],
            &mut none
        ),
        ResultCode::ErrorInvalidArgument
    );

    SimControls::toggle(&platform.controls().fail_metric_set_create, true);
    assert_eq!(
        api::device_create_metric_group_from_metrics(&device, "Custom", &compute.metrics()[..2], &mut none),
        ResultCode::ErrorInvalidArgument
    );
    SimControls::toggle(&platform.controls().fail_metric_set_create, false);

    platform.controls().set_short_metric_sets_on(Some(1));
    assert_eq!(
        api::device_create_metric_group_from_metrics(&device, "Custom", &compute.metrics()[..2], &mut none),
        ResultCode::ErrorUnknown
    );
    assert!(none.is_none());
}
