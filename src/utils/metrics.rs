//! Observability and Metrics
//!
//! Process-wide counters for messaging, directory traffic and liveness sweeps.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Global metrics collector
#[derive(Debug)]
pub struct Metrics {
    /// Envelopes written to a receiver
    pub messages_sent: AtomicU64,
    /// Envelopes published by a receiver
    pub messages_received: AtomicU64,
    /// Envelope bytes written
    pub bytes_sent: AtomicU64,
    /// Envelope payload bytes received
    pub bytes_received: AtomicU64,
    /// Endpoints skipped because a connect failed
    pub endpoints_skipped: AtomicU64,
    /// Connections dropped for carrying a foreign handle
    pub foreign_handles: AtomicU64,
    /// Directory service requests served
    pub directory_requests: AtomicU64,
    /// Liveness probes attempted
    pub probes_total: AtomicU64,
    /// Liveness probes that failed
    pub probes_failed: AtomicU64,
    /// Sweep passes run by a directory service
    pub sweeps_total: AtomicU64,
    /// Endpoints removed by service sweeps and local prunes
    pub endpoints_pruned: AtomicU64,
    /// Connection errors
    pub connection_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            endpoints_skipped: AtomicU64::new(0),
            foreign_handles: AtomicU64::new(0),
            directory_requests: AtomicU64::new(0),
            probes_total: AtomicU64::new(0),
            probes_failed: AtomicU64::new(0),
            sweeps_total: AtomicU64::new(0),
            endpoints_pruned: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn endpoint_skipped(&self) {
        self.endpoints_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn foreign_handle(&self) {
        self.foreign_handles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn directory_request(&self) {
        self.directory_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probe(&self, reachable: bool) {
        self.probes_total.fetch_add(1, Ordering::Relaxed);
        if !reachable {
            self.probes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sweep(&self, pruned: u64) {
        self.sweeps_total.fetch_add(1, Ordering::Relaxed);
        self.endpoints_pruned.fetch_add(pruned, Ordering::Relaxed);
    }

    /// Endpoints dropped by a local prune. Local prunes piggyback on reads and
    /// are not counted as sweeps.
    pub fn pruned(&self, count: u64) {
        self.endpoints_pruned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            endpoints_skipped: self.endpoints_skipped.load(Ordering::Relaxed),
            foreign_handles: self.foreign_handles.load(Ordering::Relaxed),
            directory_requests: self.directory_requests.load(Ordering::Relaxed),
            probes_total: self.probes_total.load(Ordering::Relaxed),
            probes_failed: self.probes_failed.load(Ordering::Relaxed),
            sweeps_total: self.sweeps_total.load(Ordering::Relaxed),
            endpoints_pruned: self.endpoints_pruned.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            endpoints_skipped = snapshot.endpoints_skipped,
            foreign_handles = snapshot.foreign_handles,
            directory_requests = snapshot.directory_requests,
            probes_total = snapshot.probes_total,
            probes_failed = snapshot.probes_failed,
            sweeps_total = snapshot.sweeps_total,
            endpoints_pruned = snapshot.endpoints_pruned,
            connection_errors = snapshot.connection_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "IPC metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub endpoints_skipped: u64,
    pub foreign_handles: u64,
    pub directory_requests: u64,
    pub probes_total: u64,
    pub probes_failed: u64,
    pub sweeps_total: u64,
    pub endpoints_pruned: u64,
    pub connection_errors: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
