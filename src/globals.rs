//! The process-wide façade: one queue, one context registry, and the
//! free functions user code calls from anywhere.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::clock::{Clock, WallClock};
use crate::context::{ContextBackend, ContextRegistry, ThreadLocalBackend};
use crate::emergency::EmergencyStore;
use crate::error::{InitError, ScopeError};
use crate::queue::LogQueue;
use crate::record::{LogRecord, LogTimer, RecordData};
use crate::sink::{DefaultSink, Sink};

/// Configuration for [`initialize`].
///
/// **Fields**
/// - `sink`: receives every batch of finished records.
/// - `batch_window_s`: window length in seconds; `0` (the default)
///   delivers each record synchronously as a batch of one.
/// - `name`: queue name, used for the worker thread and the default
///   emergency file name.
/// - `emergency_path`: where undelivered records are persisted on
///   shutdown; defaults to `{tmp}/{name}_dump.{pid}.jsonl`.
/// - `load_emergency_saves`: whether `initialize` recovers a previous
///   process's emergency file.
/// - `clock`: pipeline time source, swappable in tests.
/// - `context_backend`: replacement for the default thread-local
///   record stacks.
pub struct Config {
    pub sink: Arc<dyn Sink>,
    pub batch_window_s: u64,
    pub name: String,
    pub emergency_path: Option<PathBuf>,
    pub load_emergency_saves: bool,
    pub clock: Arc<dyn Clock>,
    pub context_backend: Option<Arc<dyn ContextBackend>>,
}

impl Config {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Config {
            sink,
            batch_window_s: 0,
            name: "requestlog".to_string(),
            emergency_path: None,
            load_emergency_saves: true,
            clock: Arc::new(WallClock),
            context_backend: None,
        }
    }

    pub fn batch_window_s(mut self, seconds: u64) -> Self {
        self.batch_window_s = seconds;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn emergency_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.emergency_path = Some(path.into());
        self
    }

    pub fn load_emergency_saves(mut self, load: bool) -> Self {
        self.load_emergency_saves = load;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn context_backend(mut self, backend: Arc<dyn ContextBackend>) -> Self {
        self.context_backend = Some(backend);
        self
    }
}

struct GlobalState {
    queue: LogQueue,
    shutdown: bool,
}

static OPEN_RECORDS: AtomicUsize = AtomicUsize::new(0);

fn state() -> MutexGuard<'static, GlobalState> {
    static STATE: OnceLock<Mutex<GlobalState>> = OnceLock::new();
    STATE
        .get_or_init(|| {
            Mutex::new(GlobalState {
                // Records logged before initialize still go somewhere
                // visible: a synchronous queue with the warn-once sink.
                queue: LogQueue::new("requestlog", 0, Arc::new(DefaultSink::default())),
                shutdown: false,
            })
        })
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn registry() -> &'static ContextRegistry {
    static REGISTRY: OnceLock<ContextRegistry> = OnceLock::new();
    REGISTRY.get_or_init(ContextRegistry::new)
}

/// Wire the pipeline: sink, batch window, emergency recovery, and
/// optionally a context backend.
///
/// The first call configures everything and (in windowed mode) starts
/// the background worker. Later calls replace the configuration, but
/// only while no record is open; otherwise they fail with
/// [`InitError::Busy`]. After [`emergency_shutdown`] this is a
/// diagnostic no-op.
pub fn initialize(config: Config) -> Result<(), InitError> {
    let mut global = state();
    if global.shutdown {
        tracing::warn!("initialize after emergency_shutdown ignored");
        return Ok(());
    }
    let open = OPEN_RECORDS.load(Ordering::SeqCst);
    if open > 0 {
        return Err(InitError::Busy(open));
    }

    if let Some(backend) = config.context_backend {
        registry().replace_backend(backend);
    }

    global.queue.stop_worker();
    let store = EmergencyStore::new(
        config
            .emergency_path
            .unwrap_or_else(|| EmergencyStore::default_path(&config.name)),
    );
    let queue = LogQueue::with(
        config.name,
        config.batch_window_s,
        config.sink,
        config.clock,
        Some(store),
    );
    if config.load_emergency_saves {
        queue.load_emergency_saves();
    }
    global.queue = queue;
    Ok(())
}

/// Open a record for the current context and make it "the" record for
/// all `log_*` calls until the returned scope closes.
///
/// Dropping the scope finishes the record cleanly; use
/// [`RecordScope::fail`] on error paths.
pub fn begin_global_log_record<K, V>(initial_values: impl IntoIterator<Item = (K, V)>) -> RecordScope
where
    K: Into<String>,
    V: Into<Value>,
{
    if state().shutdown {
        tracing::debug!("begin_global_log_record after shutdown ignored");
        return RecordScope { active: false };
    }
    let values: RecordData = initial_values
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect();
    registry().push(LogRecord::new(values));
    OPEN_RECORDS.fetch_add(1, Ordering::SeqCst);
    RecordScope { active: true }
}

/// Close the current record: pop it, apply fault info if an error is
/// given, run the close-time probe and hand the snapshot to the
/// pipeline. Returns the emitted snapshot.
pub fn finish_global_log_record(error: Option<ScopeError>) -> Option<RecordData> {
    let Some(record) = registry().pop() else {
        tracing::debug!("finish_global_log_record with no open record");
        return None;
    };
    OPEN_RECORDS.fetch_sub(1, Ordering::SeqCst);

    if let Some(error) = &error {
        record.record_error(error);
    }
    record.finish();
    let data = record.snapshot();

    let (queue, shutdown) = {
        let global = state();
        (global.queue.clone(), global.shutdown)
    };
    if shutdown {
        tracing::debug!("record finished after shutdown; dropped");
        return None;
    }
    queue.submit(data.clone());
    Some(data)
}

/// Assign a value on the current record. No-op without an open scope.
pub fn log_value(key: impl Into<String>, value: impl Into<Value>) {
    if let Some(record) = registry().current_or_warn() {
        record.set(key, value);
    }
}

/// Bulk [`log_value`].
pub fn log_values<K, V>(pairs: impl IntoIterator<Item = (K, V)>)
where
    K: Into<String>,
    V: Into<Value>,
{
    if let Some(record) = registry().current_or_warn() {
        record.merge_values(pairs);
    }
}

/// Add to a counter on the current record.
pub fn log_counter(name: impl Into<String>, count: i64) {
    if let Some(record) = registry().current_or_warn() {
        record.add_counter(name, count);
    }
}

/// Bulk [`log_counter`].
pub fn log_counters<K>(pairs: impl IntoIterator<Item = (K, i64)>)
where
    K: Into<String>,
{
    if let Some(record) = registry().current_or_warn() {
        record.add_counters(pairs);
    }
}

/// Time a section of the current scope. The returned guard writes
/// `{name}_cnt` / `{name}_ms` when it goes out of scope; without an
/// open scope it is inert.
pub fn log_time(name: impl Into<String>) -> LogTimer {
    match registry().current_or_warn() {
        Some(record) => record.time(name),
        None => LogTimer::inert(),
    }
}

/// Snapshot of the current in-progress record, if any.
pub fn read_global_log_record() -> Option<RecordData> {
    registry().current().map(|record| record.snapshot())
}

/// Deliver every pending batch now, including the open window.
pub fn flush() {
    let queue = state().queue.clone();
    queue.flush_all();
}

/// Replace how "the current record" is located, e.g. with a task-local
/// backend under a cooperative runtime. Only allowed while no record
/// is open anywhere.
pub fn set_context_backend(backend: Arc<dyn ContextBackend>) -> Result<(), InitError> {
    let open = OPEN_RECORDS.load(Ordering::SeqCst);
    if open > 0 {
        return Err(InitError::Busy(open));
    }
    registry().replace_backend(backend);
    Ok(())
}

/// The process is going down. Finish whatever is open in this context
/// (marked `terminated=true`), halt the worker, and persist all
/// undelivered records to the emergency store. The façade is terminal
/// afterwards; further calls are no-ops.
pub fn emergency_shutdown() {
    while registry().current().is_some() {
        log_value("terminated", true);
        finish_global_log_record(None);
    }

    let queue = {
        let mut global = state();
        if global.shutdown {
            return;
        }
        global.shutdown = true;
        global.queue.clone()
    };
    queue.shutdown();
}

/// Tear down all façade state so the next test starts clean. Stops the
/// worker, drops pending records, restores the default backend.
#[doc(hidden)]
pub fn reset_for_tests() {
    while registry().pop().is_some() {}
    registry().replace_backend(Arc::new(ThreadLocalBackend));
    OPEN_RECORDS.store(0, Ordering::SeqCst);

    let mut global = state();
    global.queue.stop_worker();
    global.queue = LogQueue::new("requestlog", 0, Arc::new(DefaultSink::default()));
    global.shutdown = false;
}

/// Scope handle returned by [`begin_global_log_record`]; closing it
/// (explicitly or by drop) runs [`finish_global_log_record`].
#[must_use = "dropping the scope immediately would finish the record at once"]
pub struct RecordScope {
    active: bool,
}

impl RecordScope {
    /// Finish the record cleanly, now.
    pub fn finish(mut self) {
        self.close(None);
    }

    /// Finish the record with fault info: `fault=1`, `error_class`,
    /// `error_message`.
    pub fn fail(mut self, error: ScopeError) {
        self.close(Some(error));
    }

    fn close(&mut self, error: Option<ScopeError>) {
        if self.active {
            self.active = false;
            finish_global_log_record(error);
        }
    }
}

impl Drop for RecordScope {
    fn drop(&mut self) {
        self.close(None);
    }
}
