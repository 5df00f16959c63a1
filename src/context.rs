//! Ambient-context plumbing: how in-scope code finds "its" record
//! without threading it through every call.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::record::LogRecord;

/// Storage backend associating a stack of open records with the
/// current execution context.
///
/// The contract: a `set` in execution context X is visible to a
/// subsequent `get` in the same X and no other. The default is one
/// stack per OS thread; hosts with cooperative scheduling supply their
/// own backend keyed by logical task instead.
pub trait ContextBackend: Send + Sync {
    /// The record stack for the current context; empty when no scope
    /// is open.
    fn get(&self) -> Vec<LogRecord>;

    /// Replace the record stack for the current context.
    fn set(&self, stack: Vec<LogRecord>);
}

/// Default backend: one record stack per OS thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadLocalBackend;

thread_local! {
    static STACK: RefCell<Vec<LogRecord>> = const { RefCell::new(Vec::new()) };
}

impl ContextBackend for ThreadLocalBackend {
    fn get(&self) -> Vec<LogRecord> {
        STACK.with(|stack| stack.borrow().clone())
    }

    fn set(&self, new: Vec<LogRecord>) {
        STACK.with(|stack| *stack.borrow_mut() = new);
    }
}

/// Resolves the current record through a swappable [`ContextBackend`].
pub struct ContextRegistry {
    backend: RwLock<Arc<dyn ContextBackend>>,
}

static NO_SCOPE_WARNED: AtomicBool = AtomicBool::new(false);

impl ContextRegistry {
    pub fn new() -> Self {
        ContextRegistry {
            backend: RwLock::new(Arc::new(ThreadLocalBackend)),
        }
    }

    /// The innermost open record for the calling context, if any.
    pub fn current(&self) -> Option<LogRecord> {
        self.backend().get().last().cloned()
    }

    /// Like [`current`](Self::current), but emits the once-per-process
    /// no-active-scope diagnostic when empty. Mutation paths use this.
    pub fn current_or_warn(&self) -> Option<LogRecord> {
        let found = self.current();
        if found.is_none() && !NO_SCOPE_WARNED.swap(true, Ordering::Relaxed) {
            tracing::warn!("log call with no active record; the call is a no-op");
        }
        found
    }

    pub fn push(&self, record: LogRecord) {
        let backend = self.backend();
        let mut stack = backend.get();
        stack.push(record);
        backend.set(stack);
    }

    pub fn pop(&self) -> Option<LogRecord> {
        let backend = self.backend();
        let mut stack = backend.get();
        let popped = stack.pop();
        backend.set(stack);
        popped
    }

    pub fn depth(&self) -> usize {
        self.backend().get().len()
    }

    /// Swap in a different backend. The caller is responsible for
    /// ensuring no record is open anywhere; stacks held by the old
    /// backend are not migrated.
    pub fn replace_backend(&self, backend: Arc<dyn ContextBackend>) {
        *self.backend.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = backend;
    }

    fn backend(&self) -> Arc<dyn ContextBackend> {
        self.backend
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}
