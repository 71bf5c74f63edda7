mod common;

use common::{config, group, library, oa_source};
use lzmetrics::api;
use lzmetrics::driver::Context;
use lzmetrics::query::MetricQueryPool;
use lzmetrics::sim::SimPlatform;
use lzmetrics::{Device, HardwareGeneration, MetricsConfig};
use lzmetrics_shared::{MetricQueryPoolDesc, ResultCode, SamplingType};
use std::sync::Arc;

fn compute_pool(context: &Context, device: &Arc<Device>) -> MetricQueryPool {
    let compute = group(device, "ComputeBasic", SamplingType::EventBased);
    let mut pool = None;
    assert_eq!(
        api::metric_query_pool_create(
            context,
            device,
            Some(&compute),
            Some(&MetricQueryPoolDesc::performance(1)),
            &mut pool
        ),
        ResultCode::Success
    );
    pool.unwrap()
}

#[test]
fn test_context_create_data() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let _pool = compute_pool(&context, &device);

    let data = library(&platform, &device).last_context_data().unwrap();
    assert_eq!(data.client_gen, HardwareGeneration::Gen12Lp.metrics_library_gen_id());
    assert_eq!(data.os_handle, 3);
    assert!(data.options.compute_async);
    assert!(!data.options.tbs_enabled);
    assert!(!data.options.sub_device.sub_device);
    assert_eq!(oa_source(&device).library_initialization_state(), ResultCode::Success);
}

#[test]
fn test_sub_device_client_options() {
    let platform = SimPlatform::new(HardwareGeneration::XeHpg).with_sub_devices(2);
    let root = platform.build(&config(false));
    let context = Context::new(vec![root.clone()]);
    let sub = root.sub_devices()[1].clone();

    let _pool = compute_pool(&context, &sub);
    let data = library(&platform, &sub).last_context_data().unwrap();
    assert_eq!(data.os_handle, 5);
    assert!(data.options.sub_device.sub_device);
    assert_eq!(data.options.sub_device.sub_device_index, 1);
    assert_eq!(data.options.sub_device.sub_device_count, 2);
    assert!(!data.options.sub_device.workload_partition);

    let root_options = oa_source(&root).sub_device_client_options().unwrap();
    assert!(!root_options.sub_device);
    assert_eq!(root_options.sub_device_count, 2);
}

#[test]
fn test_workload_partition_survives_release() {
    let platform = SimPlatform::new(HardwareGeneration::XeHpg).with_sub_devices(2);
    let root = platform.build(&MetricsConfig {
        workload_partition: true,
        ..config(false)
    });
    let context = Context::new(vec![root.clone()]);
    let sub = root.sub_devices()[0].clone();
    let oa = oa_source(&sub);
    let lib = library(&platform, &sub);

    assert!(oa.is_workload_partition_enabled());
    assert!(!oa_source(&root).is_workload_partition_enabled());

    let pool = compute_pool(&context, &sub);
    assert!(lib.last_context_data().unwrap().options.sub_device.workload_partition);
    assert_eq!(api::metric_query_pool_destroy(pool), ResultCode::Success);
    assert_eq!(lib.live_contexts(), 0);

    let _pool = compute_pool(&context, &sub);
    assert_eq!(lib.contexts_created(), 2);
    assert!(lib.last_context_data().unwrap().options.sub_device.workload_partition);
    assert!(oa.sub_device_client_options().unwrap().workload_partition);
}

#[test]
fn test_configuration_caching() {
    for (caching, expected) in [(false, 1), (true, 2)] {
        let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
        let device = platform.build(&MetricsConfig {
            configuration_caching: caching,
            ..config(false)
        });
        let context = Context::new(vec![device.clone()]);
        let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
        let render = group(&device, "RenderBasic", SamplingType::EventBased);

        for g in [&compute, &render] {
            assert_eq!(
                api::context_activate_metric_groups(&context, &device, &[g.clone()]),
                ResultCode::Success
            );
        }
        let lib = library(&platform, &device);
        assert_eq!(lib.cached_configurations(), expected, "caching = {}", caching);
        assert_eq!(lib.active_configurations(), 1);

        // metric sets are only switched on while a configuration is created
        let discovery = platform.services_for(&device).unwrap().discovery().cloned().unwrap();
        assert!(discovery.oa_group().metric_sets().iter().all(|set| !set.is_active()));
    }
}

#[test]
fn test_deactivation_releases_idle_library() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let lib = library(&platform, &device);
    let services = platform.services_for(&device).unwrap();

    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[compute]),
        ResultCode::Success
    );
    assert_eq!(lib.live_contexts(), 1);
    assert_eq!(lib.active_configurations(), 1);

    assert_eq!(api::context_activate_metric_groups(&context, &device, &[]), ResultCode::Success);
    assert_eq!(lib.live_contexts(), 0);
    assert_eq!(lib.cached_configurations(), 0);
    assert_eq!(services.cache_flushes(), 1);
    assert_eq!(oa_source(&device).library_initialization_state(), ResultCode::ErrorUninitialized);
}

#[test]
fn test_library_kept_while_pool_outlives_deactivation() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let lib = library(&platform, &device);

    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[compute]),
        ResultCode::Success
    );
    let pool = compute_pool(&context, &device);
    assert_eq!(api::context_activate_metric_groups(&context, &device, &[]), ResultCode::Success);
    assert_eq!(lib.live_contexts(), 1);

    assert_eq!(api::metric_query_pool_destroy(pool), ResultCode::Success);
    assert_eq!(lib.live_contexts(), 0);
}

#[test]
fn test_device_teardown_releases_library() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let context = Context::new(vec![device.clone()]);
    let compute = group(&device, "ComputeBasic", SamplingType::EventBased);
    let lib = library(&platform, &device);
    let services = platform.services_for(&device).unwrap();

    assert_eq!(
        api::context_activate_metric_groups(&context, &device, &[compute.clone()]),
        ResultCode::Success
    );
    assert_eq!(lib.live_contexts(), 1);
    assert_eq!(services.cache_flushes(), 0);

    drop(compute);
    drop(context);
    drop(device);
    assert_eq!(lib.live_contexts(), 0);
    assert_eq!(lib.cached_configurations(), 0);
    assert_eq!(services.cache_flushes(), 1);
}

#[test]
fn test_teardown_without_context_does_not_flush() {
    let platform = SimPlatform::new(HardwareGeneration::Gen12Lp);
    let device = platform.build(&config(false));
    let services = platform.services_for(&device).unwrap();
    let _ = group(&device, "ComputeBasic", SamplingType::EventBased);

    drop(device);
    assert_eq!(services.cache_flushes(), 0);
}
