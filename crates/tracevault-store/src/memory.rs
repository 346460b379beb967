use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracevault_types::EngineConfig;

/// Pressure classification for the current memory estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    Normal,
    /// Above the warning threshold.
    Warning,
    /// Above 90% of the hard cap; forced cleanup runs.
    Critical,
}

/// Emitted to registered listeners when a sample crosses a threshold.
#[derive(Debug, Clone, Copy)]
pub struct PressureEvent {
    pub level: PressureLevel,
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

type PressureListener = Box<dyn Fn(PressureEvent) + Send + Sync>;

/// Tracks an engine-maintained memory estimate and classifies pressure.
///
/// There is no portable heap introspection in this stack, so components
/// register the bytes they hold (stream buffers, result cache, a fixed
/// per-connection page-cache budget) and the monitor samples the sum.
/// Listener callbacks must not block; they run on the sampling thread.
pub struct MemoryMonitor {
    used_bytes: AtomicU64,
    warn_bytes: u64,
    limit_bytes: u64,
    listeners: Mutex<Vec<PressureListener>>,
    last_level: Mutex<PressureLevel>,
}

impl MemoryMonitor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            used_bytes: AtomicU64::new(0),
            warn_bytes: config.memory_warn_bytes,
            limit_bytes: config.memory_limit_bytes,
            listeners: Mutex::new(Vec::new()),
            last_level: Mutex::new(PressureLevel::Normal),
        }
    }

    pub fn add_usage(&self, bytes: u64) {
        self.used_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub_usage(&self, bytes: u64) {
        let _ = self
            .used_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    /// Replace the tracked component total (used by the sampling cycle,
    /// which recomputes cache/buffer sizes from scratch).
    pub fn set_usage(&self, bytes: u64) {
        self.used_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn on_pressure(&self, listener: impl Fn(PressureEvent) + Send + Sync + 'static) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Box::new(listener));
        }
    }

    pub fn classify(&self, used: u64) -> PressureLevel {
        if used >= (self.limit_bytes as f64 * 0.9) as u64 {
            PressureLevel::Critical
        } else if used >= self.warn_bytes {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    /// Sample the current estimate, notifying listeners on every non-normal
    /// sample and on recovery back to normal. Returns the sampled level.
    pub fn sample(&self) -> PressureLevel {
        let used = self.used_bytes();
        let level = self.classify(used);

        let changed = {
            let mut last = match self.last_level.lock() {
                Ok(last) => last,
                Err(_) => return level,
            };
            let changed = *last != level;
            *last = level;
            changed
        };

        if level != PressureLevel::Normal || changed {
            let event = PressureEvent {
                level,
                used_bytes: used,
                limit_bytes: self.limit_bytes,
            };
            if let Ok(listeners) = self.listeners.lock() {
                for listener in listeners.iter() {
                    listener(event);
                }
            }
        }

        level
    }
}
