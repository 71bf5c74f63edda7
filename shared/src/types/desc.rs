//! Descriptors passed by callers when creating pools and opening streamers

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryPoolType {
    /// Queries capture counter snapshots from an activated metric group
    Performance,
    /// Queries only track command-list execution, no counters involved
    Execution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricQueryPoolDesc {
    pub pool_type: QueryPoolType,
    pub count: u32,
}

impl MetricQueryPoolDesc {
    pub fn performance(count: u32) -> Self {
        Self {
            pool_type: QueryPoolType::Performance,
            count,
        }
    }

    pub fn execution(count: u32) -> Self {
        Self {
            pool_type: QueryPoolType::Execution,
            count,
        }
    }
}

/// Streamer parameters; `notify_every_n_reports` is written back on open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricStreamerDesc {
    pub notify_every_n_reports: u32,
    /// Sampling period in nanoseconds
    pub sampling_period: u32,
    /// Explicit hardware buffer size extension
    pub buffer_size: Option<StreamerBufferSize>,
}

/// Requested hardware buffer size; some sources write back the largest size
/// they could ever need
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamerBufferSize {
    pub size_in_bytes: u64,
}

impl MetricStreamerDesc {
    pub fn new(notify_every_n_reports: u32, sampling_period: u32) -> Self {
        Self {
            notify_every_n_reports,
            sampling_period,
            buffer_size: None,
        }
    }

    pub fn with_buffer_size(mut self, size_in_bytes: u64) -> Self {
        self.buffer_size = Some(StreamerBufferSize { size_in_bytes });
        self
    }
}
