//! In-process structured request log aggregator.
//!
//! Open a record at the start of a scoped operation, accumulate
//! values, counters and timings into it from anywhere in the call
//! tree, and close it when the operation ends. Finished records are
//! batched into wall-clock-aligned windows and handed to a
//! user-supplied [`Sink`]; whatever is undelivered at shutdown is
//! persisted to disk and recovered by the next process.

pub mod clock;
pub mod context;
pub mod emergency;
pub mod error;
pub mod globals;
pub mod probe;
pub mod queue;
pub mod record;
pub mod sink;

pub use clock::{Clock, WallClock};
pub use context::{ContextBackend, ContextRegistry, ThreadLocalBackend};
pub use error::{EmergencyError, InitError, ScopeError};
pub use globals::{
    begin_global_log_record, emergency_shutdown, finish_global_log_record, flush, initialize,
    log_counter, log_counters, log_time, log_value, log_values, read_global_log_record,
    set_context_backend, Config, RecordScope,
};
pub use queue::LogQueue;
pub use record::{LogRecord, LogTimer, RecordData};
pub use sink::{BufferSink, DefaultSink, NoopSink, PrintSink, Sink, SinkError, TracingSink};
