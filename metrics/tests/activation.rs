mod common;

use common::{config, group, library, oa_source};
use lzmetrics::api;
use lzmetrics::driver::Context;
use lzmetrics::sim::cmdlist::RecordingCommandList;
use lzmetrics::sim::library::fragment_tag;
use lzmetrics::sim::source::{MockMetricSource, MockSourceOptions};
use lzmetrics::sim::{SimControls, SimPlatform};
use lzmetrics::library::api::CommandBufferKind;
use lzmetrics::source::{MetricSource, SourceType};
use lzmetrics::HardwareGeneration;
use lzmetrics_shared::{MetricQueryPoolDesc, ResultCode, SamplingType};

#[test]
fn test_deferred_activation_commits_on_first_use() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(true));
    let context = Context::new(vec![device.clone()]);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let oa = oa_source(&device);

    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[compute.clone()]),
        ResultCode::Success
    );
    assert!(oa.is_group_activated(compute.id()));
    assert!(!oa.is_active_in_hw());
    assert_eq!(library(&platform, &device).active_configurations(), 0);

    let mut pool = None;
    assert_eq!(
        api::metric_query_pool_create(
            &context,
            &device,
            Some(&compute),
            Some(&MetricQueryPoolDesc::performance(1)),
            &mut pool
        ),
        ResultCode::Success
    );
    let pool = pool.unwrap();
    let query = pool.create_query(0).unwrap();
    assert!(!oa.is_active_in_hw());

    let mut cmd = RecordingCommandList::new(device.clone());
    assert_eq!(api::command_list_append_metric_query_begin(&mut cmd, &query), ResultCode::Success);
    assert!(oa.is_active_in_hw());
    assert_eq!(library(&platform, &device).active_configurations(), 1);
}

#[test]
fn test_deferred_activation_commits_on_barrier() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(true));
    let context = Context::new(vec![device.clone()]);
    let render = group(&device, "RenderBasic", SamplingType::EventBased);
    let oa = oa_source(&device);

    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[render.clone()]),
        ResultCode::Success
    );
    assert!(!oa.is_active_in_hw());

    let mut cmd = RecordingCommandList::new(device.clone());
    assert_eq!(api::command_list_append_metric_memory_barrier(&mut cmd), ResultCode::Success);
    assert!(oa.is_active_in_hw());
}

#[test]
fn test_immediate_activation_and_replacement() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let render = group(&device, "RenderBasic", SamplingType::EventBased);
    let oa = oa_source(&device);
    let lib = library(&platform, &device);

    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[compute.clone()]),
        ResultCode::Success
    );
    assert!(oa.is_active_in_hw());
    assert_eq!(lib.active_configurations(), 1);

    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[render.clone()]),
        ResultCode::Success
    );
    assert!(!oa.is_group_activated(compute.id()));
    assert!(oa.is_group_activated(render.id()));
    assert_eq!(lib.active_configurations(), 1);

    assert_eq!(api::context_activate_metric_groups(&context, &device, &[]), ResultCode::Success);
    assert!(!oa.is_active_in_hw());
    assert_eq!(lib.active_configurations(), 0);
}

#[test]
fn test_two_groups_in_one_domain_are_rejected() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let render = group(&device, "RenderBasic", SamplingType::EventBased);

    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[compute.clone(), render.clone()]),
        ResultCode::ErrorInvalidArgument
    );
    assert!(!oa_source(&device).is_group_activated(compute.id()));

    // repeating one group is not a conflict
    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[compute.clone(), compute.clone()]),
        ResultCode::Success
    );
}

#[test]
fn test_failed_hardware_activation_rolls_back() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let render = group(&device, "RenderBasic", SamplingType::EventBased);
    let oa = oa_source(&device);

    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[compute.clone()]),
        ResultCode::Success
    );

    SimControls::toggle(&platform.controls().fail_configuration_activate, true);
    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[render.clone()]),
        ResultCode::ErrorUnknown
    );
    SimControls::toggle(&platform.controls().fail_configuration_activate, false);

    assert!(oa.is_group_activated(compute.id()));
    assert!(!oa.is_group_activated(render.id()));
}

#[test]
fn test_rollback_across_sources() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp).with_mock_source(true);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let render = group(&device, "RenderBasic", SamplingType::EventBased);
    let mock_group = group(&device, "MockCounters", SamplingType::EventBased);
    let oa = oa_source(&device);
    let mock = device
        .metric_context()
        .metric_source::<MockMetricSource>()
        .unwrap();

    let mut custom = None;
    assert_eq!(
        api::device_create_metric_group_from_metrics(&device, "Custom", &mock_group.metrics()[..1], &mut custom),
        ResultCode::Success
    );
    let custom = custom.unwrap();

    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[render.clone()]),
        ResultCode::Success
    );

    // the OA part succeeds, the two mock groups collide on one domain
    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[compute.clone(), mock_group.clone(), custom]),
        ResultCode::ErrorInvalidArgument
    );
    assert!(oa.is_group_activated(render.id()));
    assert!(!oa.is_group_activated(compute.id()));
    assert!(oa.is_active_in_hw());
    assert!(mock.committed().is_empty());

    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[compute.clone(), mock_group.clone()]),
        ResultCode::Success
    );
    assert!(oa.is_group_activated(compute.id()));
    assert_eq!(mock.committed().len(), 1);
}

#[test]
fn test_foreign_group_and_device_are_rejected() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let other = SimPlatform::new(HardwareGeneration::Gen12Lp).build(&config(false));
    let context = Context::new(vec![device.clone()]);

    let foreign = group(&other, "ComputeBasic", SamplingType::EventBased);
    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[foreign]),
        ResultCode::ErrorInvalidArgument
    );

    let own = group(&other, "RenderBasic", SamplingType::EventBased);
    assert_eq!(
        api::context_activate_metric_groups(&context, &other, &[own]),
        ResultCode::ErrorInvalidArgument
    );
}

#[test]
fn test_enable_metrics_runs_once_per_source() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp).with_mock_source(true);
    let device = platform.build(&config(false));
    let mock = device
        .metric_context()
        .metric_source::<MockMetricSource>()
        .unwrap();

    assert!(!device.metric_context().is_metrics_enabled());
    assert_eq!(api::device_enable_metrics_exp(&device), ResultCode::Success);
    assert_eq!(api::device_enable_metrics_exp(&device), ResultCode::Success);
    assert!(device.metric_context().is_metrics_enabled());
    assert!(oa_source(&device).is_enabled());
    assert_eq!(mock.enable_calls(), 1);
}

#[test]
fn test_enable_without_any_source() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp).without_counter_library();
    let device = platform.build(&config(false));

    assert_eq!(
        api::device_enable_metrics_exp(&device),
        ResultCode::ErrorDependencyUnavailable
    );
    assert!(!device.metric_context().is_metrics_enabled());
}

#[test]
fn test_enable_without_discovery_library() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp).without_discovery();
    let device = platform.build(&config(false));

    assert_eq!(
        api::device_enable_metrics_exp(&device),
        ResultCode::ErrorDependencyUnavailable
    );
    assert!(!oa_source(&device).is_available());
}

#[test]
fn test_enable_skips_unavailable_source() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp).with_mock_source(false);
    let device = platform.build(&config(false));

    assert_eq!(api::device_enable_metrics_exp(&device), ResultCode::Success);
    let mock = device
        .metric_context()
        .metric_source::<MockMetricSource>()
        .unwrap();
    assert_eq!(mock.enable_calls(), 0);
    assert!(device
        .metric_context()
        .metric_group_get()
        .unwrap()
        .iter()
        .all(|g| g.source_type() == SourceType::Oa));
}

#[test]
fn test_memory_barrier_reaches_every_source() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp).with_mock_source(true);
    let device = platform.build(&config(false));
    let mock = device
        .metric_context()
        .metric_source::<MockMetricSource>()
        .unwrap();

    let mut cmd = RecordingCommandList::new(device.clone());
    assert_eq!(api::command_list_append_metric_memory_barrier(&mut cmd), ResultCode::Success);

    let fragments = cmd.gpu_fragments();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0][0], fragment_tag(&CommandBufferKind::OverrideFlushCaches));
    assert_eq!(mock.barrier_calls(), 1);
}

#[test]
fn test_memory_barrier_per_sub_device() {
    let platform = SimPlatform::new(HardwareGeneration::XeHpg).with_sub_devices(2);
    let device = platform.build(&config(false));

    let mut cmd = RecordingCommandList::new(device.clone());
    assert_eq!(api::command_list_append_metric_memory_barrier(&mut cmd), ResultCode::Success);
    assert_eq!(cmd.gpu_fragments().len(), 2);
}

#[test]
fn test_old_discovery_version_is_unsupported() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    platform
        .controls()
        .set_discovery_version(lzmetrics::discovery::ApiVersion { major: 1, minor: 4 });
    let device = platform.build(&config(false));

    let mut count = 0;
    assert_eq!(
        api::metric_group_get(&device, &mut count, None),
        ResultCode::ErrorUnsupportedFeature
    );
    // the failure is remembered
    assert_eq!(
        api::metric_group_get(&device, &mut count, None),
        ResultCode::ErrorUnsupportedFeature
    );
}

#[test]
fn test_exclusive_source_is_not_activated_with_oa() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp).with_mock_source_options(MockSourceOptions {
        exclusive: true,
        ..MockSourceOptions::default()
    });
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let mock_group = group(&device, "MockCounters", SamplingType::EventBased);
    let oa = oa_source(&device);
    let mock = device
        .metric_context()
        .metric_source::<MockMetricSource>()
        .unwrap();

    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[compute.clone(), mock_group.clone()]),
        ResultCode::ErrorUnsupportedFeature
    );
    assert!(!oa.is_group_activated(compute.id()));
    assert!(mock.committed().is_empty());

    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[mock_group]),
        ResultCode::Success
    );
    assert_eq!(mock.committed().len(), 1);
    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[compute.clone()]),
        ResultCode::Success
    );
    assert!(oa.is_group_activated(compute.id()));
    assert!(mock.committed().is_empty());
}

#[test]
fn test_memory_barrier_skips_sources_without_one() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp).with_ip_sampling(true);
    let device = platform.build(&config(false));

    let mut cmd = RecordingCommandList::new(device.clone());
    assert_eq!(api::command_list_append_metric_memory_barrier(&mut cmd), ResultCode::Success);
    assert_eq!(cmd.gpu_fragments().len(), 1);
}
