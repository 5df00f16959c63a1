//! The batching pipeline between finished records and the sink.
//!
//! Records are grouped into wall-clock-aligned windows of
//! `batch_window_s` seconds; buckets are keyed by their window-end
//! boundary. A background thread wakes at each boundary and delivers
//! every bucket that is due. Producers only ever append under a short
//! lock, so a slow sink never blocks them.
//!
//! ```text
//!       300               600               900
//!      |   x    x x      |             x   |
//!    --+-----------------+-----------------+---------
//!                        ^                 ^
//!                       wake              wake
//! ```

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::clock::{Clock, WallClock};
use crate::emergency::{BatchEntry, EmergencyStore};
use crate::record::RecordData;
use crate::sink::Sink;

/// Cloneable handle to the shared pipeline state. All clones feed the
/// same buckets and the same worker.
#[derive(Clone)]
pub struct LogQueue {
    shared: Arc<QueueShared>,
}

struct QueueShared {
    name: String,
    batch_window_s: u64,
    sink: Arc<dyn Sink>,
    clock: Arc<dyn Clock>,
    emergency: Option<EmergencyStore>,
    /// window-end epoch seconds → records in finish order.
    buckets: Mutex<BTreeMap<i64, Vec<RecordData>>>,
    stop: Mutex<bool>,
    wake: Condvar,
}

impl LogQueue {
    /// Windowed queue with the wall clock and no emergency store.
    /// `batch_window_s == 0` selects synchronous mode: every submitted
    /// record goes straight to the sink on the caller's thread.
    pub fn new(name: impl Into<String>, batch_window_s: u64, sink: Arc<dyn Sink>) -> Self {
        Self::with(name, batch_window_s, sink, Arc::new(WallClock), None)
    }

    /// Fully parameterized constructor: custom clock and an optional
    /// emergency store for shutdown persistence.
    pub fn with(
        name: impl Into<String>,
        batch_window_s: u64,
        sink: Arc<dyn Sink>,
        clock: Arc<dyn Clock>,
        emergency: Option<EmergencyStore>,
    ) -> Self {
        let shared = Arc::new(QueueShared {
            name: name.into(),
            batch_window_s,
            sink,
            clock,
            emergency,
            buckets: Mutex::new(BTreeMap::new()),
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        if batch_window_s > 0 {
            spawn_worker(Arc::clone(&shared));
        }
        LogQueue { shared }
    }

    /// Append a finished record to the window it belongs to. Records
    /// finished at exactly a boundary belong to the next window.
    pub fn submit(&self, record: RecordData) {
        let now = self.shared.clock.now();
        let key = if self.shared.batch_window_s == 0 {
            now as i64
        } else {
            bucket_end(now, self.shared.batch_window_s)
        };
        self.lock_buckets().entry(key).or_default().push(record);
        if self.shared.batch_window_s == 0 {
            self.flush_all();
        }
    }

    /// Pull emergency saves from this queue's store back into the
    /// buckets, preserving their original window-end timestamps. Old
    /// timestamps sort first, so recovered batches are delivered ahead
    /// of anything new.
    pub fn load_emergency_saves(&self) {
        let Some(store) = &self.shared.emergency else {
            return;
        };
        match store.load_and_clear() {
            Ok(batches) => {
                if batches.is_empty() {
                    return;
                }
                tracing::debug!(
                    queue = %self.shared.name,
                    batches = batches.len(),
                    "recovered emergency saves"
                );
                let mut buckets = self.lock_buckets();
                for entry in batches {
                    buckets.entry(entry.window_end).or_default().extend(entry.records);
                }
            }
            Err(error) => {
                tracing::warn!(queue = %self.shared.name, %error, "emergency recovery failed");
            }
        }
    }

    /// Deliver every pending batch now, including the currently
    /// accumulating window.
    pub fn flush_all(&self) {
        self.flush_before(i64::MAX - 1);
    }

    /// Deliver all batches whose window end is at or before `max_time`,
    /// in ascending window order. Failed batches are kept for retry.
    pub fn flush_before(&self, max_time: i64) {
        let due: Vec<(i64, Vec<RecordData>)> = {
            let mut buckets = self.lock_buckets();
            let keep = buckets.split_off(&max_time.saturating_add(1));
            std::mem::replace(&mut *buckets, keep).into_iter().collect()
        };

        for (window_end, records) in due {
            let outcome = catch_unwind(AssertUnwindSafe(|| self.shared.sink.emit(window_end, &records)));
            let failed = match outcome {
                Ok(Ok(())) => false,
                Ok(Err(error)) => {
                    tracing::warn!(queue = %self.shared.name, window_end, %error, "sink failed; batch kept for retry");
                    true
                }
                Err(_) => {
                    tracing::warn!(queue = %self.shared.name, window_end, "sink panicked; batch kept for retry");
                    true
                }
            };
            if failed {
                // Re-queue under the original window so the batch keeps
                // its timestamp and its place ahead of newer records.
                let mut buckets = self.lock_buckets();
                let slot = buckets.entry(window_end).or_default();
                let mut merged = records;
                merged.append(slot);
                *slot = merged;
            }
        }
    }

    /// Number of records waiting for delivery.
    pub fn pending(&self) -> usize {
        self.lock_buckets().values().map(Vec::len).sum()
    }

    /// Signal the worker to exit at its next wake-up. Does not wait for
    /// an in-flight sink call.
    pub fn stop_worker(&self) {
        let mut stopped = self.lock_stop();
        *stopped = true;
        drop(stopped);
        self.shared.wake.notify_all();
    }

    /// Halt the worker and persist everything undelivered to the
    /// emergency store. After this the queue accepts no deliveries from
    /// the worker; submissions would sit in memory forever.
    pub fn shutdown(&self) {
        self.stop_worker();

        let pending: Vec<BatchEntry> = {
            let mut buckets = self.lock_buckets();
            std::mem::take(&mut *buckets)
                .into_iter()
                .map(|(window_end, records)| BatchEntry { window_end, records })
                .collect()
        };
        if pending.is_empty() {
            return;
        }
        match &self.shared.emergency {
            Some(store) => {
                if let Err(error) = store.save(&pending) {
                    tracing::warn!(queue = %self.shared.name, %error, "emergency save failed; records lost");
                }
            }
            None => {
                let count: usize = pending.iter().map(|entry| entry.records.len()).sum();
                tracing::warn!(queue = %self.shared.name, count, "no emergency store configured; pending records dropped");
            }
        }
    }

    fn lock_buckets(&self) -> MutexGuard<'_, BTreeMap<i64, Vec<RecordData>>> {
        self.shared.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_stop(&self) -> MutexGuard<'_, bool> {
        self.shared.stop.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The window-end boundary owning a record finished at `now`.
fn bucket_end(now: f64, batch_window_s: u64) -> i64 {
    let window = batch_window_s as i64;
    (now as i64).div_euclid(window) * window + window
}

fn spawn_worker(shared: Arc<QueueShared>) {
    let name = format!("{}-writer", shared.name);
    thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(shared))
        .expect("spawn log queue worker");
}

/// Wake at each wall-clock-aligned boundary and flush everything due.
/// The boundary is recomputed from the clock every cycle so scheduling
/// skew does not accumulate.
fn worker_loop(shared: Arc<QueueShared>) {
    let window = shared.batch_window_s as f64;
    loop {
        let next_wake = bucket_end(shared.clock.now(), shared.batch_window_s);

        let mut stopped = shared.stop.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if *stopped {
                return;
            }
            let remaining = next_wake as f64 - shared.clock.now();
            if remaining <= 0.0 {
                break;
            }
            let (guard, _) = shared
                .wake
                .wait_timeout(stopped, Duration::from_secs_f64(remaining.min(window)))
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            stopped = guard;
        }
        drop(stopped);

        LogQueue { shared: Arc::clone(&shared) }.flush_before(next_wake);
    }
}
