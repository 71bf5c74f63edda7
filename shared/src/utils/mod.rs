//! Utility functions and helpers

use anyhow::{bail, Result};
use std::time::Duration;

/// Convert bytes to a hexadecimal string
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parse a duration string (e.g., "500ns", "100us", "10ms", "30s", "5m")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();

    // Two-letter suffixes first so "ms" is not read as minutes
    if let Some(num_str) = s.strip_suffix("ns") {
        Ok(Duration::from_nanos(num_str.parse()?))
    } else if let Some(num_str) = s.strip_suffix("us") {
        Ok(Duration::from_micros(num_str.parse()?))
    } else if let Some(num_str) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(num_str.parse()?))
    } else if let Some(num_str) = s.strip_suffix('s') {
        Ok(Duration::from_secs(num_str.parse()?))
    } else if let Some(num_str) = s.strip_suffix('m') {
        let mins: u64 = num_str.parse()?;
        Ok(Duration::from_secs(mins * 60))
    } else {
        // Default to seconds if no suffix
        let secs: u64 = s.parse()?;
        Ok(Duration::from_secs(secs))
    }
}

/// Parse a sampling period and express it in whole nanoseconds as a `u32`
pub fn parse_sampling_period(s: &str) -> Result<u32> {
    let nanos = parse_duration(s)?.as_nanos();
    if nanos == 0 {
        bail!("sampling period must be non-zero");
    }
    u32::try_from(nanos).map_err(|_| anyhow::anyhow!("sampling period {} does not fit in 32 bits of nanoseconds", s))
}
