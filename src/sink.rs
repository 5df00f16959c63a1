use std::error::Error;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::record::RecordData;

pub type SinkError = Box<dyn Error + Send + Sync>;

/// Consumer of batched records.
///
/// `window_end` is the batch's window boundary in seconds since the
/// unix epoch. Called from the background worker thread in windowed
/// mode, or from the finishing caller's thread in synchronous mode.
/// Failures never propagate to producers; the pipeline keeps the batch
/// for retry and emergency persistence.
pub trait Sink: Send + Sync {
    fn emit(&self, window_end: i64, records: &[RecordData]) -> Result<(), SinkError>;
}

impl<F> Sink for F
where
    F: Fn(i64, &[RecordData]) -> Result<(), SinkError> + Send + Sync,
{
    fn emit(&self, window_end: i64, records: &[RecordData]) -> Result<(), SinkError> {
        self(window_end, records)
    }
}

/// A sink that retains everything it is given, batch structure
/// included. Intended for tests.
#[derive(Clone, Default)]
pub struct BufferSink {
    batches: Arc<Mutex<Vec<(i64, Vec<RecordData>)>>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delivered batch, in delivery order.
    pub fn batches(&self) -> Vec<(i64, Vec<RecordData>)> {
        self.batches.lock().unwrap().clone()
    }

    /// All delivered records, flattened.
    pub fn records(&self) -> Vec<RecordData> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, records)| records.clone())
            .collect()
    }
}

impl Sink for BufferSink {
    fn emit(&self, window_end: i64, records: &[RecordData]) -> Result<(), SinkError> {
        self.batches.lock().unwrap().push((window_end, records.to_vec()));
        Ok(())
    }
}

/// Writes each record as a JSON line to stderr.
#[derive(Clone, Copy, Default)]
pub struct PrintSink;

impl Sink for PrintSink {
    fn emit(&self, _window_end: i64, records: &[RecordData]) -> Result<(), SinkError> {
        let mut stderr = std::io::stderr().lock();
        for record in records {
            let line = serde_json::to_string(record)?;
            writeln!(stderr, "{line}")?;
        }
        Ok(())
    }
}

/// The sink wired up before `initialize` is called: prints like
/// [`PrintSink`] and warns once that no real sink is configured.
#[derive(Clone, Default)]
pub struct DefaultSink {
    warned: Arc<AtomicBool>,
}

impl Sink for DefaultSink {
    fn emit(&self, window_end: i64, records: &[RecordData]) -> Result<(), SinkError> {
        if !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!("no sink configured for requestlog; call initialize with one");
        }
        PrintSink.emit(window_end, records)
    }
}

/// Emits each record as a `tracing` debug event.
#[derive(Clone, Copy, Default)]
pub struct TracingSink;

impl Sink for TracingSink {
    fn emit(&self, window_end: i64, records: &[RecordData]) -> Result<(), SinkError> {
        for record in records {
            tracing::debug!(window_end, record = %serde_json::to_string(record)?);
        }
        Ok(())
    }
}

/// A sink that simply drops all records. Useful for measuring the
/// overhead of the pipeline itself, and for tests that don't care
/// about delivery.
#[derive(Clone, Copy, Default)]
pub struct NoopSink;

impl Sink for NoopSink {
    fn emit(&self, _window_end: i64, _records: &[RecordData]) -> Result<(), SinkError> {
        Ok(())
    }
}
