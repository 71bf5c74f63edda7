//! Command lists and events
//!
//! Both are owned by the wider driver. The metrics engine only appends
//! fragments produced by the counter library and signals or waits on events.

use crate::device::{Device, GraphicsAllocation};
use lzmetrics_shared::Result;
use std::sync::Arc;

pub trait Event: Send + Sync {
    fn host_signal(&self);
    fn host_reset(&self);
    fn is_signaled(&self) -> bool;
}

pub type EventHandle = Arc<dyn Event>;

pub trait CommandList: Send {
    fn device(&self) -> Arc<Device>;

    /// Keep `allocation` resident while this list executes
    fn add_to_residency(&mut self, allocation: &GraphicsAllocation);

    fn append_wait_on_events(&mut self, events: &[EventHandle]) -> Result<()>;
    fn append_signal_event(&mut self, event: &EventHandle) -> Result<()>;

    /// Copy a GPU command fragment into the list's command stream
    fn append_gpu_commands(&mut self, commands: &[u8]) -> Result<()>;

    /// Commands between prologue and epilogue run once per partition, with
    /// addresses advanced by `partition_stride` for each partition
    fn append_multi_partition_prologue(&mut self, partition_stride: u32);
    fn append_multi_partition_epilogue(&mut self);
}
