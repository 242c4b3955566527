//! Counters exposed to the host for observability.
//!
//! Producers (dispatcher, synchronizer, store) update the counters; the host
//! reads a [`DiagnosticsSnapshot`]. Error counters only grow until an
//! explicit [`Diagnostics::reset_errors`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Error count with the time of the most recent occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounter {
    pub count: u64,
    pub last_seen: DateTime<Utc>,
    /// Last error code reported by the wire, if any.
    pub last_code: Option<i64>,
}

/// Point-in-time view of the diagnostics counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    pub hubs_total: usize,
    pub hubs_online: usize,
    pub active_operations: usize,
    pub queue_depth: usize,
    pub backpressure: bool,
    pub device_type_errors: HashMap<String, ErrorCounter>,
    /// Keyed by `"<hub>/<device>"`.
    pub device_errors: HashMap<String, ErrorCounter>,
}

#[derive(Default)]
struct ErrorTables {
    by_type: HashMap<String, ErrorCounter>,
    by_device: HashMap<String, ErrorCounter>,
}

/// Shared diagnostics counters.
#[derive(Default)]
pub struct Diagnostics {
    hubs_total: AtomicUsize,
    hubs_online: AtomicUsize,
    active_operations: AtomicUsize,
    queue_depth: AtomicUsize,
    backpressure: AtomicBool,
    errors: Mutex<ErrorTables>,
}

impl Diagnostics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_hub_counts(&self, total: usize, online: usize) {
        self.hubs_total.store(total, Ordering::Relaxed);
        self.hubs_online.store(online, Ordering::Relaxed);
    }

    /// Mark one operation in flight until the guard drops.
    pub fn begin_operation(self: &Arc<Self>) -> ActiveOperation {
        self.active_operations.fetch_add(1, Ordering::Relaxed);
        ActiveOperation {
            diagnostics: Arc::clone(self),
        }
    }

    pub fn active_operations(&self) -> usize {
        self.active_operations.load(Ordering::Relaxed)
    }

    /// Add to the queue depth and return the new value.
    pub fn queue_added(&self, n: usize) -> usize {
        self.queue_depth.fetch_add(n, Ordering::Relaxed) + n
    }

    /// Remove from the queue depth and return the new value.
    pub fn queue_removed(&self, n: usize) -> usize {
        let mut current = self.queue_depth.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(n);
            match self.queue_depth.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Set the backpressure flag. Returns `true` if the flag changed.
    pub fn set_backpressure(&self, on: bool) -> bool {
        self.backpressure.swap(on, Ordering::Relaxed) != on
    }

    pub fn backpressure(&self) -> bool {
        self.backpressure.load(Ordering::Relaxed)
    }

    /// Record a failed command against its device and device type.
    pub fn record_device_error(
        &self,
        device_type: &str,
        hub_id: &str,
        device_id: &str,
        code: Option<i64>,
    ) {
        let now = Utc::now();
        let mut errors = self.errors.lock();
        bump(&mut errors.by_type, device_type.to_string(), code, now);
        bump(&mut errors.by_device, format!("{}/{}", hub_id, device_id), code, now);
    }

    pub fn device_error_count(&self, hub_id: &str, device_id: &str) -> u64 {
        self.errors
            .lock()
            .by_device
            .get(&format!("{}/{}", hub_id, device_id))
            .map(|c| c.count)
            .unwrap_or(0)
    }

    /// Operator-visible reset of every error counter.
    pub fn reset_errors(&self) {
        let mut errors = self.errors.lock();
        errors.by_type.clear();
        errors.by_device.clear();
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let errors = self.errors.lock();
        DiagnosticsSnapshot {
            hubs_total: self.hubs_total.load(Ordering::Relaxed),
            hubs_online: self.hubs_online.load(Ordering::Relaxed),
            active_operations: self.active_operations(),
            queue_depth: self.queue_depth(),
            backpressure: self.backpressure(),
            device_type_errors: errors.by_type.clone(),
            device_errors: errors.by_device.clone(),
        }
    }
}

fn bump(
    table: &mut HashMap<String, ErrorCounter>,
    key: String,
    code: Option<i64>,
    now: DateTime<Utc>,
) {
    let counter = table.entry(key).or_insert(ErrorCounter {
        count: 0,
        last_seen: now,
        last_code: None,
    });
    counter.count += 1;
    counter.last_seen = now;
    if code.is_some() {
        counter.last_code = code;
    }
}

/// Guard returned by [`Diagnostics::begin_operation`].
pub struct ActiveOperation {
    diagnostics: Arc<Diagnostics>,
}

impl Drop for ActiveOperation {
    fn drop(&mut self) {
        self.diagnostics
            .active_operations
            .fetch_sub(1, Ordering::Relaxed);
    }
}
