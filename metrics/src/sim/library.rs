//! Simulated counter-context library
//!
//! Query slots become readable once their end fragment has been produced,
//! standing in for the GPU executing the command list.

use super::discovery::{write_report, QUERY_REPORT_SIZE};
use super::SimControls;
use crate::library::api::{
    CommandBufferKind, CommandBufferRequest, ConfigurationHandle, ContextCreateData, ContextHandle,
    CounterLibraryApi, ParameterType, QueryHandle, StatusCode,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Slot size in GPU memory
pub const QUERY_GPU_SIZE: u32 = 1024;

/// Size of every command fragment
pub const COMMAND_BUFFER_SIZE: u32 = 64;

#[derive(Debug, Default)]
struct SimQuery {
    slots: u32,
    begun: HashSet<u32>,
    ended: HashSet<u32>,
}

#[derive(Debug, Default)]
struct LibraryState {
    contexts: HashMap<ContextHandle, ContextCreateData>,
    queries: HashMap<QueryHandle, SimQuery>,
    configurations: HashMap<ConfigurationHandle, bool>,
    contexts_created: u32,
    last_context: Option<ContextCreateData>,
}

pub struct SimCounterLibrary {
    controls: Arc<SimControls>,
    next_handle: AtomicU64,
    state: Mutex<LibraryState>,
}

/// First byte of every fragment
pub fn fragment_tag(kind: &CommandBufferKind) -> u8 {
    match kind {
        CommandBufferKind::QueryHwCounters { begin: true, .. } => 0xB0,
        CommandBufferKind::QueryHwCounters { begin: false, .. } => 0xE0,
        CommandBufferKind::Marker { .. } => 0x4D,
        CommandBufferKind::OverrideFlushCaches => 0xFC,
        CommandBufferKind::OverrideNullHardware { enable: true } => 0x41,
        CommandBufferKind::OverrideNullHardware { enable: false } => 0x40,
    }
}

impl SimCounterLibrary {
    pub fn new(controls: Arc<SimControls>) -> Self {
        Self {
            controls,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(LibraryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LibraryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub fn live_contexts(&self) -> usize {
        self.lock().contexts.len()
    }

    pub fn contexts_created(&self) -> u32 {
        self.lock().contexts_created
    }

    /// Data of the most recent context creation
    pub fn last_context_data(&self) -> Option<ContextCreateData> {
        self.lock().last_context
    }

    pub fn live_queries(&self) -> usize {
        self.lock().queries.len()
    }

    pub fn active_configurations(&self) -> usize {
        self.lock().configurations.values().filter(|active| **active).count()
    }

    pub fn cached_configurations(&self) -> usize {
        self.lock().configurations.len()
    }
}

impl CounterLibraryApi for SimCounterLibrary {
    fn context_create(&self, data: &ContextCreateData) -> Result<ContextHandle, StatusCode> {
        if SimControls::on(&self.controls.fail_context_create) {
            return Err(StatusCode::Failed);
        }
        let context = ContextHandle(self.handle());
        let mut state = self.lock();
        state.contexts.insert(context, *data);
        state.contexts_created += 1;
        state.last_context = Some(*data);
        Ok(context)
    }

    fn context_delete(&self, context: ContextHandle) -> StatusCode {
        match self.lock().contexts.remove(&context) {
            Some(_) => StatusCode::Success,
            None => StatusCode::IncorrectObject,
        }
    }

    fn get_parameter(&self, context: ContextHandle, parameter: ParameterType) -> Result<u32, StatusCode> {
        if !self.lock().contexts.contains_key(&context) {
            return Err(StatusCode::IncorrectObject);
        }
        match parameter {
            ParameterType::QueryHwCountersReportApiSize => Ok(QUERY_REPORT_SIZE),
            ParameterType::QueryHwCountersReportGpuSize => {
                if SimControls::on(&self.controls.report_gpu_size_zero) {
                    Ok(0)
                } else {
                    Ok(QUERY_GPU_SIZE)
                }
            }
        }
    }

    fn query_create(&self, context: ContextHandle, slots: u32) -> Result<QueryHandle, StatusCode> {
        let mut state = self.lock();
        if !state.contexts.contains_key(&context) {
            return Err(StatusCode::IncorrectObject);
        }
        let query = QueryHandle(self.handle());
        state.queries.insert(
            query,
            SimQuery {
                slots,
                ..SimQuery::default()
            },
        );
        Ok(query)
    }

    fn query_delete(&self, query: QueryHandle) -> StatusCode {
        match self.lock().queries.remove(&query) {
            Some(_) => StatusCode::Success,
            None => StatusCode::IncorrectObject,
        }
    }

    fn get_data(&self, query: QueryHandle, slot: u32, out: &mut [u8]) -> StatusCode {
        let state = self.lock();
        let Some(q) = state.queries.get(&query) else {
            return StatusCode::IncorrectObject;
        };
        if slot >= q.slots || out.len() < QUERY_REPORT_SIZE as usize {
            return StatusCode::IncorrectParameter;
        }
        if !q.ended.contains(&slot) {
            return StatusCode::ReportNotReady;
        }
        write_report(&mut out[..QUERY_REPORT_SIZE as usize], 1000 + slot as u64);
        StatusCode::Success
    }

    fn configuration_create(&self, context: ContextHandle) -> Result<ConfigurationHandle, StatusCode> {
        let mut state = self.lock();
        if !state.contexts.contains_key(&context) {
            return Err(StatusCode::IncorrectObject);
        }
        let configuration = ConfigurationHandle(self.handle());
        state.configurations.insert(configuration, false);
        Ok(configuration)
    }

    fn configuration_activate(&self, configuration: ConfigurationHandle) -> StatusCode {
        if SimControls::on(&self.controls.fail_configuration_activate) {
            return StatusCode::Failed;
        }
        match self.lock().configurations.get_mut(&configuration) {
            Some(active) => {
                *active = true;
                StatusCode::Success
            }
            None => StatusCode::IncorrectObject,
        }
    }

    fn configuration_deactivate(&self, configuration: ConfigurationHandle) -> StatusCode {
        match self.lock().configurations.get_mut(&configuration) {
            Some(active) => {
                *active = false;
                StatusCode::Success
            }
            None => StatusCode::IncorrectObject,
        }
    }

    fn configuration_delete(&self, configuration: ConfigurationHandle) -> StatusCode {
        match self.lock().configurations.remove(&configuration) {
            Some(_) => StatusCode::Success,
            None => StatusCode::IncorrectObject,
        }
    }

    fn command_buffer_get_size(&self, request: &CommandBufferRequest) -> Result<u32, StatusCode> {
        if SimControls::on(&self.controls.fail_command_buffer) {
            return Err(StatusCode::Failed);
        }
        if !self.lock().contexts.contains_key(&request.context) {
            return Err(StatusCode::IncorrectObject);
        }
        Ok(COMMAND_BUFFER_SIZE)
    }

    fn command_buffer_get(&self, request: &CommandBufferRequest, out: &mut [u8]) -> StatusCode {
        if out.len() < COMMAND_BUFFER_SIZE as usize {
            return StatusCode::IncorrectParameter;
        }

        if let CommandBufferKind::QueryHwCounters { query, slot, begin } = request.kind {
            let mut state = self.lock();
            let Some(q) = state.queries.get_mut(&query) else {
                return StatusCode::IncorrectObject;
            };
            if begin {
                q.begun.insert(slot);
                q.ended.remove(&slot);
            } else {
                q.ended.insert(slot);
            }
        }

        out.fill(0);
        out[0] = fragment_tag(&request.kind);
        out[8..16].copy_from_slice(&request.gpu_address.to_le_bytes());
        if let CommandBufferKind::Marker { value } = request.kind {
            out[16..20].copy_from_slice(&value.to_le_bytes());
        }
        StatusCode::Success
    }
}
