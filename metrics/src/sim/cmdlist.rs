//! Command list and event that record what the engine appends

use crate::cmdlist::{CommandList, Event, EventHandle};
use crate::device::{Device, GraphicsAllocation};
use lzmetrics_shared::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    Gpu(Vec<u8>),
    WaitEvents(usize),
    SignalEvent,
    PartitionPrologue(u32),
    PartitionEpilogue,
}

pub struct RecordingCommandList {
    device: Arc<Device>,
    commands: Vec<RecordedCommand>,
    residency: Vec<GraphicsAllocation>,
}

impl RecordingCommandList {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            commands: Vec::new(),
            residency: Vec::new(),
        }
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    /// GPU fragments only, in append order
    pub fn gpu_fragments(&self) -> Vec<&[u8]> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::Gpu(bytes) => Some(bytes.as_slice()),
                _ => None,
            })
            .collect()
    }

    pub fn residency(&self) -> &[GraphicsAllocation] {
        &self.residency
    }

    pub fn clear(&mut self) {
        self.commands.clear();
        self.residency.clear();
    }
}

impl CommandList for RecordingCommandList {
    fn device(&self) -> Arc<Device> {
        self.device.clone()
    }

    fn add_to_residency(&mut self, allocation: &GraphicsAllocation) {
        if !self.residency.contains(allocation) {
            self.residency.push(allocation.clone());
        }
    }

    fn append_wait_on_events(&mut self, events: &[EventHandle]) -> Result<()> {
        self.commands.push(RecordedCommand::WaitEvents(events.len()));
        Ok(())
    }

    fn append_signal_event(&mut self, event: &EventHandle) -> Result<()> {
        // executed immediately in the simulation
        event.host_signal();
        self.commands.push(RecordedCommand::SignalEvent);
        Ok(())
    }

    fn append_gpu_commands(&mut self, commands: &[u8]) -> Result<()> {
        self.commands.push(RecordedCommand::Gpu(commands.to_vec()));
        Ok(())
    }

    fn append_multi_partition_prologue(&mut self, partition_stride: u32) {
        self.commands.push(RecordedCommand::PartitionPrologue(partition_stride));
    }

    fn append_multi_partition_epilogue(&mut self) {
        self.commands.push(RecordedCommand::PartitionEpilogue);
    }
}

#[derive(Debug, Default)]
pub struct HostEvent {
    signaled: AtomicBool,
}

impl HostEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Event for HostEvent {
    fn host_signal(&self) {
        self.signaled.store(true, Ordering::SeqCst);
    }

    fn host_reset(&self) {
        self.signaled.store(false, Ordering::SeqCst);
    }

    fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::SeqCst)
    }
}
