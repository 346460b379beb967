use std::cmp::Reverse;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use tracevault_types::{EngineConfig, Error, Result};

/// Backpressure delay: base 100ms, doubling, capped at 2s, at most 10
/// re-checks before the hard-cap decision.
const BACKPRESSURE_BASE: Duration = Duration::from_millis(100);
const BACKPRESSURE_CAP: Duration = Duration::from_secs(2);
const BACKPRESSURE_MAX_ATTEMPTS: u32 = 10;

/// Retry delay for failed batches: base 100ms, doubling, capped at 1s.
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(1);

/// Delivered exactly once per enqueued item that carries a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Persisted,
    /// The item exhausted its retry budget and was dropped.
    Dropped { attempts: u32, error: String },
}

pub type CompletionHook = Box<dyn FnOnce(BatchOutcome) + Send>;

struct Pending<T> {
    item: T,
    priority: i64,
    seq: u64,
    attempts: u32,
    /// Set after a failed batch; the item is not retried before this.
    not_before: Option<Instant>,
    hook: Option<CompletionHook>,
}

struct Inner<T> {
    /// Sorted by descending priority, insertion order within a priority.
    queue: Vec<Pending<T>>,
    next_seq: u64,
}

/// Priority batch queue for the heavier write paths.
///
/// Items are held in priority order and handed to the sink in batches of
/// `max_batch_size`. A failed batch costs every item in it one retry; items
/// past the retry budget are dropped with their hook notified, the rest are
/// re-queued together with a backoff delay.
pub struct BatchQueue<T> {
    config: EngineConfig,
    inner: Mutex<Inner<T>>,
    sink: Box<dyn Fn(&[T]) -> Result<()> + Send + Sync>,
    /// When set, backpressure also engages while this reports pressure,
    /// independent of queue length.
    memory_gate: Option<Box<dyn Fn() -> bool + Send + Sync>>,
}

impl<T: Clone + Send> BatchQueue<T> {
    pub fn new<F>(config: EngineConfig, sink: F) -> Self
    where
        F: Fn(&[T]) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            config,
            inner: Mutex::new(Inner {
                queue: Vec::new(),
                next_seq: 0,
            }),
            sink: Box::new(sink),
            memory_gate: None,
        }
    }

    /// Queue whose backpressure also consults an external memory-pressure
    /// check, typically backed by the engine's memory estimate.
    pub fn with_memory_gate<F, G>(config: EngineConfig, sink: F, gate: G) -> Self
    where
        F: Fn(&[T]) -> Result<()> + Send + Sync + 'static,
        G: Fn() -> bool + Send + Sync + 'static,
    {
        let mut queue = Self::new(config, sink);
        queue.memory_gate = Some(Box::new(gate));
        queue
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue occupancy as a fraction of the hard capacity.
    pub fn occupancy(&self) -> f64 {
        self.len() as f64 / self.config.queue_hard_cap() as f64
    }

    pub fn enqueue(&self, item: T, priority: i64) -> Result<()> {
        self.enqueue_with_hook(item, priority, None)
    }

    /// Add an item, applying backpressure above the length watermark or
    /// while the memory gate reports pressure, and failing with `QueueFull`
    /// at the hard cap. May flush inline when the add fills a batch or a
    /// high-priority item crosses the minimum batch.
    pub fn enqueue_with_hook(
        &self,
        item: T,
        priority: i64,
        hook: Option<CompletionHook>,
    ) -> Result<()> {
        let hard_cap = self.config.queue_hard_cap();
        let watermark =
            (hard_cap as f64 * self.config.backpressure_watermark) as usize;

        let mut attempt = 0;
        while (self.len() >= watermark || self.gate_engaged())
            && attempt < BACKPRESSURE_MAX_ATTEMPTS
        {
            std::thread::sleep(backoff(BACKPRESSURE_BASE, BACKPRESSURE_CAP, attempt));
            self.flush();
            attempt += 1;
        }

        let should_flush = {
            let mut inner = self.lock();
            if inner.queue.len() >= hard_cap {
                return Err(Error::QueueFull {
                    pending: inner.queue.len(),
                    capacity: hard_cap,
                });
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            insert_sorted(
                &mut inner.queue,
                Pending {
                    item,
                    priority,
                    seq,
                    attempts: 0,
                    not_before: None,
                    hook,
                },
            );

            inner.queue.len() >= self.config.max_batch_size
                || (priority >= self.config.high_priority_threshold
                    && inner.queue.len() >= self.config.min_batch_size)
        };

        if should_flush {
            self.flush();
        }
        Ok(())
    }

    /// Drain ready items in priority order, one batch at a time. Stops at
    /// the first failed batch so its retry delay is respected. Returns the
    /// number of items persisted.
    pub fn flush(&self) -> usize {
        let mut persisted = 0;

        loop {
            let batch = self.take_batch();
            if batch.is_empty() {
                break;
            }

            let items: Vec<T> = batch.iter().map(|p| p.item.clone()).collect();
            match (self.sink)(&items) {
                Ok(()) => {
                    persisted += batch.len();
                    for pending in batch {
                        if let Some(hook) = pending.hook {
                            hook(BatchOutcome::Persisted);
                        }
                    }
                }
                Err(e) => {
                    self.handle_failed_batch(batch, &e);
                    break;
                }
            }
        }

        persisted
    }

    /// Remove up to one batch of items whose retry delay has elapsed,
    /// preserving queue order.
    fn take_batch(&self) -> Vec<Pending<T>> {
        let now = Instant::now();
        let max = self.config.max_batch_size;
        let mut inner = self.lock();

        let mut batch = Vec::new();
        let mut index = 0;
        while index < inner.queue.len() && batch.len() < max {
            let ready = inner.queue[index]
                .not_before
                .is_none_or(|t| t <= now);
            if ready {
                batch.push(inner.queue.remove(index));
            } else {
                index += 1;
            }
        }
        batch
    }

    fn handle_failed_batch(&self, batch: Vec<Pending<T>>, error: &Error) {
        let max_retries = self.config.max_retries;
        let mut survivors = Vec::new();
        let mut dropped = 0;

        for mut pending in batch {
            pending.attempts += 1;
            if pending.attempts > max_retries {
                dropped += 1;
                if let Some(hook) = pending.hook.take() {
                    hook(BatchOutcome::Dropped {
                        attempts: pending.attempts,
                        error: error.to_string(),
                    });
                }
            } else {
                pending.not_before =
                    Some(Instant::now() + backoff(RETRY_BASE, RETRY_CAP, pending.attempts - 1));
                survivors.push(pending);
            }
        }

        warn!(
            error = %error,
            retried = survivors.len(),
            dropped,
            "batch flush failed"
        );

        let mut inner = self.lock();
        for pending in survivors {
            insert_sorted(&mut inner.queue, pending);
        }
    }

    fn gate_engaged(&self) -> bool {
        self.memory_gate.as_ref().is_some_and(|gate| gate())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Binary-search insertion keyed by (descending priority, ascending seq),
/// so equal priorities keep arrival order.
fn insert_sorted<T>(queue: &mut Vec<Pending<T>>, pending: Pending<T>) {
    let key = (Reverse(pending.priority), pending.seq);
    let position = match queue
        .binary_search_by(|probe| (Reverse(probe.priority), probe.seq).cmp(&key))
    {
        Ok(i) | Err(i) => i,
    };
    queue.insert(position, pending);
}

fn backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    (base * factor).min(cap)
}
