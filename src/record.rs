use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::ScopeError;
use crate::probe::{self, ProbeDeltas, ProbeSnapshot};

/// The external shape of a record: an open mapping from string keys to
/// JSON values, produced by [`LogRecord::snapshot`].
pub type RecordData = BTreeMap<String, Value>;

/// A mutable record collecting values, counters and timers for one
/// scope (typically one request).
///
/// Handles are cheap to clone and share one underlying record, so a
/// [`LogTimer`] can keep writing into the record that was current when
/// it started even if the ambient scope has moved on.
#[derive(Clone)]
pub struct LogRecord {
    inner: Arc<Mutex<RecordState>>,
}

struct RecordState {
    values: RecordData,
    counters: BTreeMap<String, i64>,
    timers: BTreeMap<String, TimerTotal>,
    /// Timers started but not yet closed, keyed by guard token.
    running: HashMap<u64, RunningTimer>,
    next_token: u64,
    start_wall: DateTime<Utc>,
    start_mono: Instant,
    open_probe: ProbeSnapshot,
    fault: Option<ScopeError>,
    close: Option<CloseState>,
}

#[derive(Clone, Copy, Default)]
struct TimerTotal {
    count: u64,
    total_us: u64,
}

struct RunningTimer {
    name: String,
    started: Instant,
}

struct CloseState {
    end_wall: DateTime<Utc>,
    duration_us: u64,
    deltas: ProbeDeltas,
}

impl LogRecord {
    /// Open a new record, pre-populated with `initial_values`, and take
    /// the open-time probe snapshot.
    pub fn new(initial_values: RecordData) -> Self {
        LogRecord {
            inner: Arc::new(Mutex::new(RecordState {
                values: initial_values,
                counters: BTreeMap::new(),
                timers: BTreeMap::new(),
                running: HashMap::new(),
                next_token: 0,
                start_wall: Utc::now(),
                start_mono: Instant::now(),
                open_probe: probe::capture(),
                fault: None,
                close: None,
            })),
        }
    }

    /// Assign a value; overwrites any previous value for the same key.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut state = self.lock();
        if state.closed("set") {
            return;
        }
        state.values.insert(key.into(), value.into());
    }

    /// Bulk [`set`](Self::set).
    pub fn merge_values<K, V>(&self, pairs: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let mut state = self.lock();
        if state.closed("merge_values") {
            return;
        }
        for (key, value) in pairs {
            state.values.insert(key.into(), value.into());
        }
    }

    /// Add `delta` to the named counter. Counters are strictly
    /// additive; deltas may be negative.
    pub fn add_counter(&self, name: impl Into<String>, delta: i64) {
        let mut state = self.lock();
        if state.closed("add_counter") {
            return;
        }
        let slot = state.counters.entry(name.into()).or_insert(0);
        *slot = slot.saturating_add(delta);
    }

    /// Bulk [`add_counter`](Self::add_counter).
    pub fn add_counters<K>(&self, pairs: impl IntoIterator<Item = (K, i64)>)
    where
        K: Into<String>,
    {
        let mut state = self.lock();
        if state.closed("add_counters") {
            return;
        }
        for (name, delta) in pairs {
            let slot = state.counters.entry(name.into()).or_insert(0);
            *slot = slot.saturating_add(delta);
        }
    }

    /// Start a timer for `name` and return a guard that stops it when
    /// dropped (or via [`LogTimer::finish`]).
    ///
    /// On close the record gains `{name}_cnt` (+1) and `{name}_ms`
    /// (+elapsed). Overlapping timers for the same name each contribute
    /// their own duration.
    pub fn time(&self, name: impl Into<String>) -> LogTimer {
        let mut state = self.lock();
        if state.closed("time") {
            return LogTimer::inert();
        }
        let token = state.next_token;
        state.next_token += 1;
        state.running.insert(
            token,
            RunningTimer {
                name: name.into(),
                started: Instant::now(),
            },
        );
        LogTimer {
            target: Some((self.clone(), token)),
        }
    }

    /// Mark the record faulted. The error description ends up as
    /// `error_class` / `error_message` with `fault=1`.
    pub fn record_error(&self, error: &ScopeError) {
        let mut state = self.lock();
        if state.closed("record_error") {
            return;
        }
        state.fault = Some(error.clone());
    }

    /// Close the record: terminate any still-running timers with their
    /// elapsed time so far, stamp the end instant and run the
    /// close-time probe. Closing twice is a diagnostic no-op.
    pub fn finish(&self) {
        let mut state = self.lock();
        if state.close.is_some() {
            tracing::debug!("finish called on an already-finished log record");
            return;
        }
        // There should be 0 running timers, but who knows.
        let leftovers: Vec<RunningTimer> = state.running.drain().map(|(_, rt)| rt).collect();
        for rt in leftovers {
            state.accumulate_timer(&rt.name, rt.started.elapsed().as_micros() as u64);
        }
        let deltas = probe::deltas_since(&state.open_probe);
        state.close = Some(CloseState {
            end_wall: Utc::now(),
            duration_us: state.start_mono.elapsed().as_micros() as u64,
            deltas,
        });
    }

    pub fn is_finished(&self) -> bool {
        self.lock().close.is_some()
    }

    /// Flattened external view: user values, then counters, then
    /// `T_cnt`/`T_ms` timer pairs, then the reserved system fields.
    /// System fields win on key collision.
    pub fn snapshot(&self) -> RecordData {
        let state = self.lock();
        let mut out = state.values.clone();
        for (name, total) in &state.counters {
            out.insert(name.clone(), Value::from(*total));
        }
        for (name, total) in &state.timers {
            out.insert(format!("{name}_cnt"), Value::from(total.count));
            out.insert(format!("{name}_ms"), Value::from(total.total_us / 1000));
        }
        out.insert("start_time".into(), Value::from(dtfmt(state.start_wall)));
        out.insert("pid".into(), Value::from(state.open_probe.pid));
        if let Some(loadavg) = state.open_probe.loadavg {
            out.insert("loadavg".into(), Value::from(loadavg));
        }
        if let Some(dyno) = &state.open_probe.dyno {
            out.insert("dyno".into(), Value::from(dyno.clone()));
        }
        out.insert("fault".into(), Value::from(state.fault.is_some() as u8));
        if let Some(error) = &state.fault {
            out.insert("error_class".into(), Value::from(error.class.clone()));
            out.insert("error_message".into(), Value::from(error.message.clone()));
        }
        if let Some(close) = &state.close {
            out.insert("end_time".into(), Value::from(dtfmt(close.end_wall)));
            out.insert("duration_ms".into(), Value::from(close.duration_us / 1000));
            if let Some(user_ms) = close.deltas.user_ms {
                out.insert("user_ms".into(), Value::from(user_ms));
            }
            if let Some(sys_ms) = close.deltas.sys_ms {
                out.insert("sys_ms".into(), Value::from(sys_ms));
            }
            if let Some(max_rss) = close.deltas.max_rss {
                out.insert("max_rss".into(), Value::from(max_rss));
            }
            if let Some(inc) = close.deltas.inc_max_rss {
                out.insert("inc_max_rss".into(), Value::from(inc));
            }
        }
        out
    }

    fn close_timer(&self, token: u64) {
        let mut state = self.lock();
        if let Some(rt) = state.running.remove(&token) {
            state.accumulate_timer(&rt.name, rt.started.elapsed().as_micros() as u64);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecordState {
    fn closed(&self, operation: &str) -> bool {
        if self.close.is_some() {
            tracing::debug!(operation, "mutation on a finished log record ignored");
            true
        } else {
            false
        }
    }

    fn accumulate_timer(&mut self, name: &str, elapsed_us: u64) {
        let total = self.timers.entry(name.to_string()).or_default();
        total.count += 1;
        total.total_us += elapsed_us;
    }
}

impl std::fmt::Debug for LogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("LogRecord")
            .field("values", &state.values)
            .field("finished", &state.close.is_some())
            .finish()
    }
}

/// RAII guard for one timer measurement. Dropping the guard records the
/// elapsed milliseconds into the owning record; if the record was
/// finished in the meantime the drop is a no-op (the record already
/// terminated the timer with its elapsed-so-far).
pub struct LogTimer {
    target: Option<(LogRecord, u64)>,
}

impl LogTimer {
    /// A timer attached to nothing; measures and records nothing. Used
    /// when no scope is active.
    pub(crate) fn inert() -> Self {
        LogTimer { target: None }
    }

    /// Stop the timer now instead of at end of scope.
    pub fn finish(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some((record, token)) = self.target.take() {
            record.close_timer(token);
        }
    }
}

impl Drop for LogTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dtfmt(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
