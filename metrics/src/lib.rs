//! Metric query and streaming engine
//!
//! Exposes metric groups discovered through the hardware-description library,
//! activates them through the counter-context library, and collects raw data
//! with event-based query pools or time-based streamers. `api` is the
//! result-code surface; everything below it returns `lzmetrics_shared::Result`.
//! `sim` provides a software platform for the CLI and for tests.

pub mod api;
pub mod calculation;
pub mod cmdlist;
pub mod config;
pub mod context;
pub mod device;
pub mod discovery;
pub mod driver;
pub mod enumeration;
pub mod group;
pub mod hw;
pub mod library;
pub mod metric;
pub mod query;
pub mod sim;
pub mod source;
pub mod streamer;
pub mod telemetry;

pub use calculation::MetricCalculateOperation;
pub use config::MetricsConfig;
pub use device::Device;
pub use driver::Context;
pub use group::{MetricGroup, MetricGroupHandle};
pub use hw::HardwareGeneration;
pub use metric::{Metric, MetricHandle};
pub use query::{MetricQuery, MetricQueryPool};
pub use streamer::MetricStreamer;
