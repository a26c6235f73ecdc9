//! Progress reporting and cancellation shared between a rip and its controller
//!
//! [`RipProgress`] is a cheap-to-clone handle. The ripping thread records
//! sectors as it reads them; any other thread may take a
//! [`ProgressSnapshot`] or request a stop.

use crate::sector::SECTORS_PER_SECOND;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Progress callback type
pub type ProgressCallback = Box<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Point-in-time view of a rip's progress
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Sectors read from the drive so far
    pub sectors_read: u64,

    /// Sectors the rip expects to read in total
    pub grand_total_sectors: u64,

    /// Time since the rip started
    pub elapsed: Duration,

    /// Recent read speed in sectors per second
    pub sectors_per_second: f64,

    /// Estimated time remaining in seconds
    pub eta_seconds: Option<u64>,

    /// Whether a stop was requested
    pub stopped: bool,
}

impl ProgressSnapshot {
    /// Calculate completion percentage (0.0 to 100.0)
    ///
    /// Retries can push the sectors read past the expected total, so the
    /// value is capped.
    pub fn percentage(&self) -> f64 {
        if self.grand_total_sectors == 0 {
            100.0
        } else {
            (self.sectors_read as f64 / self.grand_total_sectors as f64 * 100.0).min(100.0)
        }
    }

    /// Read speed as a multiple of real time (e.g., "8.0x")
    pub fn speed_display(&self) -> String {
        format!("{:.1}x", self.sectors_per_second / SECTORS_PER_SECOND as f64)
    }

    /// Format ETA for display (e.g., "2m 30s")
    pub fn eta_display(&self) -> String {
        match self.eta_seconds {
            Some(secs) if secs > 0 => format_duration(secs),
            _ => "calculating...".to_string(),
        }
    }
}

struct ProgressState {
    stop: AtomicBool,
    sectors_read: AtomicU64,
    grand_total: AtomicU64,
    epoch: Instant,
    started_at_ms: AtomicU64,
    speed: Mutex<SpeedTracker>,
    callback: Option<ProgressCallback>,
}

/// Shared progress counters and stop flag
#[derive(Clone)]
pub struct RipProgress {
    state: Arc<ProgressState>,
}

impl std::fmt::Debug for RipProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RipProgress")
            .field("sectors_read", &self.sectors_read())
            .field("grand_total_sectors", &self.grand_total_sectors())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Default for RipProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl RipProgress {
    /// Create a handle with zeroed counters
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a handle that calls `callback` each time sectors are recorded
    pub fn with_callback<F>(callback: F) -> Self
    where
        F: Fn(&ProgressSnapshot) + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(callback)))
    }

    fn build(callback: Option<ProgressCallback>) -> Self {
        Self {
            state: Arc::new(ProgressState {
                stop: AtomicBool::new(false),
                sectors_read: AtomicU64::new(0),
                grand_total: AtomicU64::new(0),
                epoch: Instant::now(),
                started_at_ms: AtomicU64::new(0),
                speed: Mutex::new(SpeedTracker::new()),
                callback,
            }),
        }
    }

    /// Ask the rip to stop at the next sector boundary
    pub fn stop(&self) {
        self.state.stop.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested
    pub fn is_stopped(&self) -> bool {
        self.state.stop.load(Ordering::SeqCst)
    }

    /// Reset the counters and start the clock for a rip of `grand_total` sectors
    pub fn begin(&self, grand_total: u64) {
        self.state.sectors_read.store(0, Ordering::SeqCst);
        self.state.grand_total.store(grand_total, Ordering::SeqCst);
        let now = self.state.epoch.elapsed().as_millis() as u64;
        self.state.started_at_ms.store(now, Ordering::SeqCst);
        *self.speed_tracker() = SpeedTracker::new();
    }

    /// Record `count` sectors read from the drive
    pub fn record_sectors(&self, count: u64) {
        let total = self.state.sectors_read.fetch_add(count, Ordering::SeqCst) + count;
        self.speed_tracker().update(total);
        if let Some(callback) = &self.state.callback {
            callback(&self.snapshot());
        }
    }

    /// Sectors read so far
    pub fn sectors_read(&self) -> u64 {
        self.state.sectors_read.load(Ordering::SeqCst)
    }

    /// Sectors expected in total
    pub fn grand_total_sectors(&self) -> u64 {
        self.state.grand_total.load(Ordering::SeqCst)
    }

    /// Time since [`begin`](Self::begin)
    pub fn elapsed(&self) -> Duration {
        let started = Duration::from_millis(self.state.started_at_ms.load(Ordering::SeqCst));
        self.state.epoch.elapsed().saturating_sub(started)
    }

    /// Current progress
    pub fn snapshot(&self) -> ProgressSnapshot {
        let sectors_read = self.sectors_read();
        let grand_total_sectors = self.grand_total_sectors();
        let sectors_per_second = self.speed_tracker().current_speed();
        ProgressSnapshot {
            sectors_read,
            grand_total_sectors,
            elapsed: self.elapsed(),
            sectors_per_second,
            eta_seconds: calculate_eta(sectors_read, grand_total_sectors, sectors_per_second),
            stopped: self.is_stopped(),
        }
    }

    fn speed_tracker(&self) -> std::sync::MutexGuard<'_, SpeedTracker> {
        // The tracker holds no invariants a panic could break
        self.state
            .speed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Speed tracking with smoothing
struct SpeedTracker {
    samples: Vec<(Instant, u64)>,
    max_samples: usize,
}

impl SpeedTracker {
    fn new() -> Self {
        Self {
            samples: Vec::with_capacity(10),
            max_samples: 10,
        }
    }

    fn update(&mut self, sectors_read: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.remove(0);
        }
        self.samples.push((Instant::now(), sectors_read));
    }

    fn current_speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.first(), self.samples.last()) else {
            return 0.0;
        };

        let duration = last.0.duration_since(first.0);
        let sectors = last.1.saturating_sub(first.1);

        if duration.as_millis() > 0 {
            sectors as f64 / duration.as_secs_f64()
        } else {
            0.0
        }
    }
}

/// Calculate estimated time remaining
fn calculate_eta(sectors_read: u64, grand_total: u64, sectors_per_second: f64) -> Option<u64> {
    if sectors_per_second <= 0.0 || sectors_read >= grand_total {
        return None;
    }

    let remaining = grand_total.saturating_sub(sectors_read);
    Some((remaining as f64 / sectors_per_second) as u64)
}

/// Format duration for display
pub fn format_duration(seconds: u64) -> String {
    if seconds >= 3600 {
        let hours = seconds / 3600;
        let mins = (seconds % 3600) / 60;
        format!("{}h {}m", hours, mins)
    } else if seconds >= 60 {
        let mins = seconds / 60;
        let secs = seconds % 60;
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", seconds)
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
