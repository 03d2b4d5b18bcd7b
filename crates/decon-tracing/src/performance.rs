//! Timing helpers for staging, iterations and host/device transfers.
//!
//! ```rust
//! use decon_tracing::performance::{record_transfer, PerformanceSpan, TransferDirection};
//!
//! let span = PerformanceSpan::new("stage_tile", Some(100));
//! // ... copy a tile to the device ...
//! drop(span); // logged only if it took at least 100µs
//!
//! record_transfer(4096, TransferDirection::HostToDevice, 250);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tracing::Level;

static ENABLED: AtomicBool = AtomicBool::new(true);
/// `u64::MAX` means "no threshold".
static THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Apply the process-wide performance settings. Called by [`crate::build_subscriber`].
pub fn configure(enabled: bool, threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    THRESHOLD_US.store(threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

/// Whether performance spans currently log anything.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

fn global_threshold() -> Option<u64> {
    match THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        value => Some(value),
    }
}

/// RAII timer: measures from creation and logs on drop when the duration reaches
/// the threshold (its own, else the process-wide one).
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

    pub fn with_level(level: Level, name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = if level == Level::TRACE {
            tracing::trace_span!("perf", name = %name)
        } else if level == Level::DEBUG {
            tracing::debug_span!("perf", name = %name)
        } else if level == Level::INFO {
            tracing::info_span!("perf", name = %name)
        } else if level == Level::WARN {
            tracing::warn_span!("perf", name = %name)
        } else {
            tracing::error_span!("perf", name = %name)
        };

        Self {
            name,
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !is_enabled() {
            return;
        }
        let elapsed_us = self.elapsed_us();
        let threshold = self.threshold_us.or_else(global_threshold);
        if threshold.is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Direction of a staging copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::HostToDevice => f.write_str("H2D"),
            TransferDirection::DeviceToHost => f.write_str("D2H"),
        }
    }
}

/// Bandwidth in MiB/s; zero when the duration rounds to zero.
pub fn bandwidth_mibps(bytes: usize, duration_us: u64) -> f64 {
    if duration_us == 0 {
        return 0.0;
    }
    (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
}

/// Emit a `data_transfer` event for a host/device copy.
pub fn record_transfer(bytes: usize, direction: TransferDirection, duration_us: u64) {
    if !is_enabled() {
        return;
    }
    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        mb = bytes as f64 / (1024.0 * 1024.0),
        direction = %direction,
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mibps(bytes, duration_us),
        "data_transfer"
    );
}

/// Emit an `iteration_rate` event once a tile finished iterating.
pub fn record_iterations(subvolume: usize, iterations: usize, voxels: usize, duration_us: u64) {
    if !is_enabled() {
        return;
    }
    let voxel_iterations_per_sec = if duration_us > 0 {
        (voxels as f64 * iterations as f64 / duration_us as f64) * 1_000_000.0
    } else {
        0.0
    };
    tracing::debug!(
        event = "iterations",
        subvolume = subvolume,
        iterations = iterations,
        voxels = voxels,
        duration_us = duration_us,
        mvoxel_iterations_per_sec = voxel_iterations_per_sec / 1_000_000.0,
        "iteration_rate"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn span_keeps_name_and_threshold() {
        let span = PerformanceSpan::new("stage_tile", Some(1000));
        assert_eq!(span.name(), "stage_tile");
        assert_eq!(span.threshold_us, Some(1000));
    }

    #[test]
    fn span_measures_elapsed_time() {
        let span = PerformanceSpan::with_level(Level::INFO, "sleep", None);
        thread::sleep(Duration::from_millis(5));
        assert!(span.elapsed_us() >= 5_000);
    }

    #[test]
    fn bandwidth_of_one_mib_per_ms() {
        let mibps = bandwidth_mibps(1024 * 1024, 1000);
        assert!((mibps - 1000.0).abs() < 0.01);
        assert_eq!(bandwidth_mibps(10, 0), 0.0);
    }

    #[test]
    fn transfer_direction_labels() {
        assert_eq!(TransferDirection::HostToDevice.to_string(), "H2D");
        assert_eq!(TransferDirection::DeviceToHost.to_string(), "D2H");
    }

    #[test]
    fn recording_events_without_subscriber() {
        record_transfer(4096, TransferDirection::DeviceToHost, 12);
        record_iterations(0, 10, 65_536, 1_000);
    }
}
