//! Boolean signal lines (interrupt, halt, reset)

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Callback invoked with the new level of a line
pub type SignalCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// A wire carrying a level, with change callbacks
pub struct SignalLine {
    name: String,
    level: AtomicBool,
    callbacks: RwLock<Vec<SignalCallback>>,
}

impl SignalLine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            level: AtomicBool::new(false),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> bool {
        self.level.load(Ordering::Acquire)
    }

    /// Register a callback run on every level change
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Drive the line. Callbacks only run when the level actually changes.
    pub fn set(&self, level: bool) {
        if self.level.swap(level, Ordering::AcqRel) == level {
            return;
        }
        trace!("Signal '{}' -> {}", self.name, level);

        // Callbacks may register further callbacks or drive other lines.
        let callbacks: Vec<SignalCallback> = self.callbacks.read().clone();
        for callback in callbacks {
            callback(level);
        }
    }

    /// Raise then lower the line
    pub fn pulse(&self) {
        self.set(true);
        self.set(false);
    }
}

impl std::fmt::Debug for SignalLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalLine")
            .field("name", &self.name)
            .field("level", &self.get())
            .finish()
    }
}
