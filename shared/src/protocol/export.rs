//! Export-data envelope
//!
//! Raw data exported together with the metric set description needed to
//! calculate values offline. Encoded with bincode using an explicit config
//! (fixint lengths and enum tags) so producers and consumers always agree.

use crate::types::metric::{MetricGroupProperties, MetricProperties};
use crate::types::result::{MetricsError, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Envelope format version
pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// "LZMX" in little-endian byte order
pub const EXPORT_MAGIC: u32 = u32::from_le_bytes(*b"LZMX");

fn export_bincode() -> impl bincode::config::Options {
    bincode::config::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Description of the metric set the raw data was captured with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedMetricSet {
    pub group: MetricGroupProperties,
    pub metrics: Vec<MetricProperties>,
    pub raw_report_size: u32,
    pub query_report_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportData {
    pub magic: u32,
    pub version: u32,
    /// Counter-library generation id of the device that produced the data
    pub hardware_generation: u32,
    pub metric_set: ExportedMetricSet,
    pub raw_data: Vec<u8>,
}

impl ExportData {
    pub fn new(hardware_generation: u32, metric_set: ExportedMetricSet, raw_data: Vec<u8>) -> Self {
        Self {
            magic: EXPORT_MAGIC,
            version: EXPORT_FORMAT_VERSION,
            hardware_generation,
            metric_set,
            raw_data,
        }
    }

    /// Number of bytes `to_bytes` will produce
    pub fn encoded_size(&self) -> Result<usize> {
        export_bincode()
            .serialized_size(self)
            .map(|n| n as usize)
            .map_err(|e| MetricsError::unknown(format!("export size: {}", e)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        export_bincode()
            .serialize(self)
            .map_err(|e| MetricsError::unknown(format!("export encode: {}", e)))
    }

    /// Encode into `out`, which must hold at least `encoded_size()` bytes
    pub fn write_into(&self, out: &mut [u8]) -> Result<usize> {
        let bytes = self.to_bytes()?;
        if out.len() < bytes.len() {
            return Err(MetricsError::InvalidSize {
                required: bytes.len(),
                provided: out.len(),
            });
        }
        out[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Decode an envelope, validating magic and format version
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let data: ExportData = export_bincode()
            .deserialize(bytes)
            .map_err(|e| MetricsError::invalid_argument(format!("export decode: {}", e)))?;
        if data.magic != EXPORT_MAGIC {
            return Err(MetricsError::invalid_argument("not an export-data buffer"));
        }
        if data.version != EXPORT_FORMAT_VERSION {
            return Err(MetricsError::invalid_argument(format!(
                "export format version {} not supported (expected {})",
                data.version, EXPORT_FORMAT_VERSION
            )));
        }
        Ok(data)
    }
}
