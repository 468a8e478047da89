//! Loop watchdog: a supervisor thread that fires when the control loop stops
//! feeding it. The supervisor runs on its own OS thread, outside the async
//! runtime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use irrigation_core::valve::Watchdog;

pub const LOOP_TIMEOUT: Duration = Duration::from_secs(10);

struct Shared {
    started: Instant,
    last_feed_ms: AtomicU64,
    suspended: AtomicBool,
}

impl Shared {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[derive(Clone)]
pub struct LoopWatchdog {
    shared: Arc<Shared>,
}

impl LoopWatchdog {
    /// Start supervising. `on_expire` runs once, on the supervisor thread,
    /// when `timeout` passes without a feed.
    pub fn spawn<F>(timeout: Duration, on_expire: F) -> Result<Self>
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            started: Instant::now(),
            last_feed_ms: AtomicU64::new(0),
            suspended: AtomicBool::new(false),
        });

        let poll = (timeout / 10).clamp(Duration::from_millis(5), Duration::from_secs(1));
        let sup = Arc::clone(&shared);
        thread::Builder::new()
            .name("loop-watchdog".into())
            .spawn(move || loop {
                thread::sleep(poll);
                if sup.suspended.load(Ordering::Acquire) {
                    continue;
                }
                let silent = sup
                    .now_ms()
                    .saturating_sub(sup.last_feed_ms.load(Ordering::Acquire));
                if silent > timeout.as_millis() as u64 {
                    let silent = Duration::from_millis(silent);
                    tracing::error!(silent_ms = silent.as_millis() as u64, "control loop stalled");
                    on_expire(silent);
                    return;
                }
            })
            .context("failed to start watchdog thread")?;

        tracing::info!(timeout_s = timeout.as_secs(), "loop watchdog armed");
        Ok(Self { shared })
    }
}

impl Watchdog for LoopWatchdog {
    fn feed(&mut self) {
        let now = self.shared.now_ms();
        self.shared.last_feed_ms.store(now, Ordering::Release);
    }

    fn suspend(&mut self) {
        self.shared.suspended.store(true, Ordering::Release);
        tracing::warn!("loop watchdog suspended");
    }

    fn resume(&mut self) {
        self.feed();
        self.shared.suspended.store(false, Ordering::Release);
        tracing::info!("loop watchdog resumed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_when_not_fed() {
        let (tx, rx) = mpsc::channel();
        let _dog = LoopWatchdog::spawn(Duration::from_millis(50), move |d| {
            let _ = tx.send(d);
        })
        .unwrap();
        let silent = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(silent >= Duration::from_millis(50));
    }

    #[test]
    fn feeding_keeps_it_quiet() {
        let (tx, rx) = mpsc::channel();
        let mut dog = LoopWatchdog::spawn(Duration::from_millis(200), move |_| {
            let _ = tx.send(());
        })
        .unwrap();
        for _ in 0..20 {
            dog.feed();
            thread::sleep(Duration::from_millis(10));
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn suspended_dog_does_not_fire() {
        let (tx, rx) = mpsc::channel();
        let mut dog = LoopWatchdog::spawn(Duration::from_millis(30), move |_| {
            let _ = tx.send(());
        })
        .unwrap();
        dog.suspend();
        thread::sleep(Duration::from_millis(150));
        assert!(rx.try_recv().is_err());
        dog.resume();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }
}
