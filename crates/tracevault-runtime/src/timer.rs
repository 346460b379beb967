use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

/// Named background thread running a closure on a fixed period.
///
/// The wait uses a Condvar so `stop` interrupts a sleeping timer
/// immediately instead of waiting out the current tick.
pub(crate) struct RepeatingTimer {
    stop: Arc<Stop>,
    handle: Option<JoinHandle<()>>,
}

struct Stop {
    flag: AtomicBool,
    lock: Mutex<()>,
    signal: Condvar,
}

impl RepeatingTimer {
    pub(crate) fn spawn<F>(name: &str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let stop = Arc::new(Stop {
            flag: AtomicBool::new(false),
            lock: Mutex::new(()),
            signal: Condvar::new(),
        });
        let thread_stop = Arc::clone(&stop);
        let thread_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    let guard = match thread_stop.lock.lock() {
                        Ok(g) => g,
                        Err(_) => break,
                    };
                    let (_guard, _timeout) = match thread_stop
                        .signal
                        .wait_timeout_while(guard, period, |_| {
                            !thread_stop.flag.load(Ordering::Acquire)
                        }) {
                        Ok(r) => r,
                        Err(_) => break,
                    };
                    if thread_stop.flag.load(Ordering::Acquire) {
                        break;
                    }
                    tick();
                }
                debug!(timer = %thread_name, "timer stopped");
            })
            .ok();

        Self {
            stop,
            handle,
        }
    }

    pub(crate) fn stop(&mut self) {
        self.stop.flag.store(true, Ordering::Release);
        self.stop.signal.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_timer_ticks_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&ticks);
        let mut timer = RepeatingTimer::spawn("test-timer", Duration::from_millis(10), move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(80));
        timer.stop();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected ticks, got {}", seen);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_stop_interrupts_long_period() {
        let mut timer =
            RepeatingTimer::spawn("slow-timer", Duration::from_secs(3600), || {});
        let started = std::time::Instant::now();
        timer.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
