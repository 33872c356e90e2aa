//! Generic cooperative poller (spec §4.2), reused by the inbound message
//! processor and both BAR roles (spec §4.8 explicitly treats the builder and
//! the sender as pollers too).

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// What one tick accomplished, driving whether the loop continues
/// immediately or idle-sleeps (spec §4.2).
pub enum Tick {
    Processed,
    Idle,
}

/// One cooperative poller. `start` is idempotent: calling it on an already
/// running poller is a no-op. `stop` cancels the pending sleep immediately
/// and sets the running flag the next loop iteration observes.
pub struct Poller {
    started: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Poller {
    pub fn new() -> Self {
        Poller {
            started: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Spawns the loop. `tick` runs once per iteration; `Ok(Tick::Processed)`
    /// continues immediately without sleeping, `Ok(Tick::Idle)` invokes
    /// `on_idle` and sleeps one `interval`, `Err` invokes `on_error` and also
    /// sleeps one interval.
    pub fn start<Tk, OnIdle, OnError>(&self, interval: Duration, tick: Tk, mut on_idle: OnIdle, mut on_error: OnError)
    where
        Tk: Fn() -> BoxFuture<'static, Result<Tick, anyhow::Error>> + Send + Sync + 'static,
        OnIdle: FnMut() + Send + 'static,
        OnError: FnMut(&anyhow::Error) + Send + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                match tick().await {
                    Ok(Tick::Processed) => continue,
                    Ok(Tick::Idle) => {
                        on_idle();
                        sleep_cancellable(interval, &running, &notify).await;
                    }
                    Err(e) => {
                        on_error(&e);
                        sleep_cancellable(interval, &running, &notify).await;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

async fn sleep_cancellable(interval: Duration, running: &Arc<AtomicBool>, notify: &Arc<Notify>) {
    if !running.load(Ordering::SeqCst) {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(interval) => {},
        _ = notify.notified() => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn start_is_idempotent() {
        let poller = Poller::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            poller.start(
                StdDuration::from_secs(60),
                move || {
                    let calls = calls.clone();
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(Tick::Idle)
                    })
                },
                || {},
                |_| {},
            );
        }

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        poller.stop();
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        // only the first start() spawned a loop; idle-sleeps once then parks
        assert!(calls.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn stop_cancels_pending_sleep() {
        let poller = Poller::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();

        poller.start(
            StdDuration::from_secs(3600),
            move || {
                let ticks = ticks_clone.clone();
                Box::pin(async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    Ok(Tick::Idle)
                })
            },
            || {},
            |_| {},
        );

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(poller.is_running());

        poller.stop();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(!poller.is_running());
    }
}
