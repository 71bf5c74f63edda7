//! Simulated EU stall sampling unit

use crate::source::ip_sampling::{IpSamplingOsInterface, StallReport, IP_SAMPLING_REPORT_SIZE};
use lzmetrics_shared::{MetricsError, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::trace;

/// Bytes the kernel keeps per sampling unit
pub const SIM_IP_SAMPLING_BUFFER_SIZE: u32 = 512 * 1024;

#[derive(Debug, Default)]
struct Injected {
    start: Option<MetricsError>,
    stop: Option<MetricsError>,
    read: Option<MetricsError>,
}

#[derive(Debug)]
pub struct SimIpSamplingOs {
    available: bool,
    running: AtomicBool,
    reports_available: AtomicBool,
    /// Notification threshold the unit grants at most
    granted_notify: AtomicU32,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
    pending: Mutex<Vec<u8>>,
    injected: Mutex<Injected>,
}

impl SimIpSamplingOs {
    pub fn new(available: bool) -> Self {
        Self {
            available,
            running: AtomicBool::new(false),
            reports_available: AtomicBool::new(false),
            granted_notify: AtomicU32::new(u32::MAX),
            start_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
            pending: Mutex::new(Vec::new()),
            injected: Mutex::new(Injected::default()),
        }
    }

    fn injected(&self) -> std::sync::MutexGuard<'_, Injected> {
        self.injected.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_start(&self, error: Option<MetricsError>) {
        self.injected().start = error;
    }

    pub fn fail_stop(&self, error: Option<MetricsError>) {
        self.injected().stop = error;
    }

    pub fn fail_read(&self, error: Option<MetricsError>) {
        self.injected().read = error;
    }

    pub fn set_reports_available(&self, available: bool) {
        self.reports_available.store(available, Ordering::SeqCst);
    }

    /// Cap the notification threshold handed back on start
    pub fn set_granted_notify(&self, reports: u32) {
        self.granted_notify.store(reports, Ordering::SeqCst);
    }

    /// Queue reports for the next reads
    pub fn push_reports(&self, reports: &[StallReport]) -> Result<()> {
        let unit = IP_SAMPLING_REPORT_SIZE as usize;
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for report in reports {
            let start = pending.len();
            pending.resize(start + unit, 0);
            report.encode_into(&mut pending[start..])?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl IpSamplingOsInterface for SimIpSamplingOs {
    fn start_measurement(&self, notify_every_n_reports: &mut u32, _sampling_period_ns: &mut u32) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.injected().start.clone() {
            return Err(error);
        }
        *notify_every_n_reports = (*notify_every_n_reports).min(self.granted_notify.load(Ordering::SeqCst));
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_measurement(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.injected().stop.clone() {
            return Err(error);
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn read_data(&self, out: &mut [u8]) -> Result<usize> {
        if let Some(error) = self.injected().read.clone() {
            return Err(error);
        }
        let unit = IP_SAMPLING_REPORT_SIZE as usize;
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let bytes = pending.len().min(out.len() / unit * unit);
        out[..bytes].copy_from_slice(&pending[..bytes]);
        pending.drain(..bytes);
        trace!(bytes, left = pending.len(), "stall reports read");
        Ok(bytes)
    }

    fn required_buffer_size(&self, max_reports: u32) -> u32 {
        let wanted = u64::from(max_reports) * u64::from(IP_SAMPLING_REPORT_SIZE);
        wanted.min(u64::from(SIM_IP_SAMPLING_BUFFER_SIZE)) as u32
    }

    fn unit_report_size(&self) -> u32 {
        IP_SAMPLING_REPORT_SIZE
    }

    fn is_n_reports_available(&self) -> bool {
        self.reports_available.load(Ordering::SeqCst)
    }

    fn is_dependency_available(&self) -> bool {
        self.available
    }
}
