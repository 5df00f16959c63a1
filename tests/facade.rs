//! End-to-end tests of the global façade. The façade is process-wide
//! state, so every test takes the same lock and starts from
//! `reset_for_tests`.

use requestlog::globals::reset_for_tests;
use requestlog::{
    begin_global_log_record, finish_global_log_record, flush, initialize, log_counter,
    log_counters, log_time, log_value, log_values, read_global_log_record, set_context_backend,
    BufferSink, Clock, Config, ContextBackend, InitError, LogRecord, RecordData, ScopeError,
    ThreadLocalBackend,
};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::Duration;

fn facade_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(Mutex::default)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fresh façade wired to a buffering sink in synchronous mode.
fn fresh_sync_facade() -> (MutexGuard<'static, ()>, BufferSink) {
    let guard = facade_lock();
    reset_for_tests();
    let sink = BufferSink::new();
    initialize(Config::new(Arc::new(sink.clone())).load_emergency_saves(false)).unwrap();
    (guard, sink)
}

fn no_values() -> std::iter::Empty<(&'static str, Value)> {
    std::iter::empty()
}

#[test]
fn value_logging_reaches_the_sink() {
    let (_guard, sink) = fresh_sync_facade();

    let scope = begin_global_log_record(no_values());
    log_value("path", "/x");
    scope.finish();

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["path"], "/x");
    assert_eq!(records[0]["fault"], 0);
    assert!(records[0].contains_key("start_time"));
    assert!(records[0].contains_key("end_time"));
}

#[test]
fn initial_values_seed_the_record() {
    let (_guard, sink) = fresh_sync_facade();

    begin_global_log_record([("banaan", "geel")]).finish();
    assert_eq!(sink.records()[0]["banaan"], "geel");
}

#[test]
fn counters_add_up_across_calls() {
    let (_guard, sink) = fresh_sync_facade();

    let scope = begin_global_log_record(no_values());
    log_counter("rows", 5);
    log_counter("rows", 2);
    log_counters([("hits", 1), ("misses", 3)]);
    scope.finish();

    let record = &sink.records()[0];
    assert_eq!(record["rows"], 7);
    assert_eq!(record["hits"], 1);
    assert_eq!(record["misses"], 3);
}

#[test]
fn timers_accumulate_count_and_duration() {
    let (_guard, sink) = fresh_sync_facade();

    let scope = begin_global_log_record(no_values());
    for _ in 0..2 {
        let timer = log_time("db");
        thread::sleep(Duration::from_millis(100));
        timer.finish();
    }
    scope.finish();

    let record = &sink.records()[0];
    assert_eq!(record["db_cnt"], 2);
    let total = record["db_ms"].as_u64().unwrap();
    assert!((199..=800).contains(&total), "db_ms was {total}");
}

#[test]
fn failed_scopes_carry_fault_info() {
    let (_guard, sink) = fresh_sync_facade();

    #[derive(Debug)]
    struct ValueError;
    impl std::fmt::Display for ValueError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("bad")
        }
    }
    impl std::error::Error for ValueError {}

    let scope = begin_global_log_record(no_values());
    let outcome: Result<(), ValueError> = Err(ValueError);
    match outcome {
        Ok(()) => scope.finish(),
        Err(error) => scope.fail(ScopeError::from_error(&error)),
    }

    let record = &sink.records()[0];
    assert_eq!(record["fault"], 1);
    assert!(record["error_class"].as_str().unwrap().ends_with("ValueError"));
    assert_eq!(record["error_message"], "bad");
}

#[test]
fn nested_scopes_route_mutations_to_the_innermost() {
    let (_guard, sink) = fresh_sync_facade();

    let outer = begin_global_log_record([("layer", "outer")]);
    log_value("outer_seen", true);
    {
        let inner = begin_global_log_record([("layer", "inner")]);
        log_value("inner_seen", true);
        inner.finish();
    }
    log_value("outer_again", true);
    outer.finish();

    let records = sink.records();
    assert_eq!(records.len(), 2);
    // Inner finished first.
    assert_eq!(records[0]["layer"], "inner");
    assert_eq!(records[0]["inner_seen"], true);
    assert!(!records[0].contains_key("outer_seen"));
    assert_eq!(records[1]["layer"], "outer");
    assert_eq!(records[1]["outer_seen"], true);
    assert_eq!(records[1]["outer_again"], true);
}

#[test]
fn dropping_the_scope_finishes_the_record() {
    let (_guard, sink) = fresh_sync_facade();

    {
        let _scope = begin_global_log_record([("path", "/drop")]);
        log_value("n", 1);
    }
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["path"], "/drop");
}

#[test]
fn calls_without_a_scope_are_noops() {
    let (_guard, sink) = fresh_sync_facade();

    log_value("ghost", true);
    log_counter("ghost_count", 1);
    let timer = log_time("ghost_time");
    timer.finish();
    assert!(finish_global_log_record(None).is_none());
    assert!(read_global_log_record().is_none());
    assert!(sink.records().is_empty());
}

#[test]
fn read_global_log_record_sees_the_open_record() {
    let (_guard, _sink) = fresh_sync_facade();

    let scope = begin_global_log_record([("banaan", "geel")]);
    log_values([("bloem", "rood")]);
    let data = read_global_log_record().unwrap();
    assert_eq!(data["banaan"], "geel");
    assert_eq!(data["bloem"], "rood");
    assert!(data.contains_key("start_time"));
    assert!(!data.contains_key("end_time"), "record is still open");
    scope.finish();
}

#[test]
fn reconfiguring_with_an_open_record_is_busy() {
    let (_guard, sink) = fresh_sync_facade();

    let scope = begin_global_log_record(no_values());
    let again = initialize(Config::new(Arc::new(sink.clone())));
    assert!(matches!(again, Err(InitError::Busy(1))));
    scope.finish();

    initialize(Config::new(Arc::new(sink)).load_emergency_saves(false)).unwrap();
}

#[test]
fn windowed_batches_keep_finish_order_and_window_timestamps() {
    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<f64>>);
    impl Clock for ManualClock {
        fn now(&self) -> f64 {
            *self.0.lock().unwrap()
        }
    }

    let _guard = facade_lock();
    reset_for_tests();

    let clock = ManualClock(Arc::new(Mutex::new(1000.0)));
    let sink = BufferSink::new();
    initialize(
        Config::new(Arc::new(sink.clone()))
            .batch_window_s(300)
            .clock(Arc::new(clock.clone()))
            .load_emergency_saves(false),
    )
    .unwrap();

    begin_global_log_record([("n", 1)]).finish();
    begin_global_log_record([("n", 2)]).finish();
    *clock.0.lock().unwrap() = 1300.0;
    begin_global_log_record([("n", 3)]).finish();

    assert!(sink.batches().is_empty(), "nothing delivered before a flush");
    flush();

    let batches = sink.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].0, 1200);
    assert_eq!(batches[0].1[0]["n"], 1);
    assert_eq!(batches[0].1[1]["n"], 2);
    assert_eq!(batches[1].0, 1500);
    assert_eq!(batches[1].1[0]["n"], 3);
}

#[test]
fn context_backend_can_be_swapped_when_idle() {
    let (_guard, sink) = fresh_sync_facade();

    /// Single shared slot: every caller sees the same stack.
    struct SharedSlotBackend(Mutex<Vec<LogRecord>>);
    impl ContextBackend for SharedSlotBackend {
        fn get(&self) -> Vec<LogRecord> {
            self.0.lock().unwrap().clone()
        }
        fn set(&self, stack: Vec<LogRecord>) {
            *self.0.lock().unwrap() = stack;
        }
    }

    set_context_backend(Arc::new(SharedSlotBackend(Mutex::new(Vec::new())))).unwrap();

    let scope = begin_global_log_record(no_values());
    // With the shared backend another thread resolves the same record.
    thread::spawn(|| log_value("from_other_thread", true))
        .join()
        .unwrap();
    assert!(matches!(
        set_context_backend(Arc::new(ThreadLocalBackend)),
        Err(InitError::Busy(1))
    ));
    scope.finish();

    set_context_backend(Arc::new(ThreadLocalBackend)).unwrap();
    let record = &sink.records()[0];
    assert_eq!(record["from_other_thread"], true);
}

#[test]
fn snapshots_round_trip_through_json() {
    let (_guard, sink) = fresh_sync_facade();

    let scope = begin_global_log_record([("path", "/json")]);
    log_counter("rows", 3);
    scope.finish();

    let record = &sink.records()[0];
    let encoded = serde_json::to_string(record).unwrap();
    let decoded: RecordData = serde_json::from_str(&encoded).unwrap();
    assert_eq!(&decoded, record);
}
