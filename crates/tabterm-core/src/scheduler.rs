//! Coalescing snapshot persistence, one scheduler per tab.
//!
//! While a tab is dirty, a flush happens at
//! `min(dirty_since + interval, last_activity + debounce)`: continuous output
//! is saved at least once per interval, and a burst is saved shortly after it
//! stops. A single task owns the timer, so two flushes never race.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

/// Persists one snapshot. Errors are handled (logged) by the callback itself.
pub type FlushFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Flush timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushTiming {
    pub interval: Duration,
    pub debounce: Duration,
}

impl Default for FlushTiming {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            debounce: Duration::from_millis(500),
        }
    }
}

enum Command {
    Activity,
    Flush(Option<oneshot::Sender<()>>),
    Shutdown {
        final_flush: bool,
        done: oneshot::Sender<()>,
    },
}

/// Cheap handle for notifying a scheduler from other tasks.
#[derive(Clone)]
pub struct FlushHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl FlushHandle {
    /// Mark the tab dirty. Never blocks.
    pub fn note_activity(&self) {
        let _ = self.tx.send(Command::Activity);
    }

    /// Request an immediate flush without waiting for it.
    pub fn request_flush(&self) {
        let _ = self.tx.send(Command::Flush(None));
    }
}

pub struct FlushScheduler {
    handle: FlushHandle,
    task: JoinHandle<()>,
}

impl FlushScheduler {
    pub fn spawn(tab_id: Uuid, timing: FlushTiming, flush: FlushFn) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(tab_id, timing, flush, rx));
        Self {
            handle: FlushHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> FlushHandle {
        self.handle.clone()
    }

    pub fn note_activity(&self) {
        self.handle.note_activity();
    }

    /// Flush now and wait until the snapshot is written.
    pub async fn flush_now(&self) {
        let (tx, rx) = oneshot::channel();
        if self.handle.tx.send(Command::Flush(Some(tx))).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the scheduler, flushing first if anything is pending.
    pub async fn shutdown(self) {
        self.stop(true).await;
    }

    /// Stop the scheduler and drop pending work (the tab is being deleted).
    pub async fn discard(self) {
        self.stop(false).await;
    }

    async fn stop(self, final_flush: bool) {
        let (done, rx) = oneshot::channel();
        if self
            .handle
            .tx
            .send(Command::Shutdown { final_flush, done })
            .is_ok()
        {
            let _ = rx.await;
        }
        let _ = self.task.await;
    }
}

async fn run(
    tab_id: Uuid,
    timing: FlushTiming,
    flush: FlushFn,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut dirty_since: Option<Instant> = None;
    let mut last_activity = Instant::now();

    loop {
        let deadline = dirty_since
            .map(|since| (since + timing.interval).min(last_activity + timing.debounce));
        let sleep_until = deadline.unwrap_or_else(|| Instant::now() + timing.interval);

        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Activity) => {
                    let now = Instant::now();
                    dirty_since.get_or_insert(now);
                    last_activity = now;
                }
                Some(Command::Flush(reply)) => {
                    trace!(target: "tabterm::scheduler", "Explicit flush for tab {}", tab_id);
                    flush().await;
                    dirty_since = None;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                }
                Some(Command::Shutdown { final_flush, done }) => {
                    if final_flush && dirty_since.is_some() {
                        flush().await;
                    }
                    debug!(target: "tabterm::scheduler", "Scheduler for tab {} stopped", tab_id);
                    let _ = done.send(());
                    return;
                }
                None => {
                    if dirty_since.is_some() {
                        flush().await;
                    }
                    return;
                }
            },
            _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                trace!(target: "tabterm::scheduler", "Scheduled flush for tab {}", tab_id);
                flush().await;
                dirty_since = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<AtomicUsize>, FlushFn) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let flush: FlushFn = Arc::new(move || {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
        });
        (count, flush)
    }

    fn timing() -> FlushTiming {
        FlushTiming {
            interval: Duration::from_secs(1),
            debounce: Duration::from_millis(200),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_after_burst() {
        let (count, flush) = counting();
        let scheduler = FlushScheduler::spawn(Uuid::new_v4(), timing(), flush);

        for _ in 0..10 {
            scheduler.note_activity();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Clean: no further flushes
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_bounds_continuous_output() {
        let (count, flush) = counting();
        let scheduler = FlushScheduler::spawn(Uuid::new_v4(), timing(), flush);

        // Activity every 100ms for 3s never lets the debounce expire
        for _ in 0..30 {
            scheduler.note_activity();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let flushed = count.load(Ordering::SeqCst);
        assert!((2..=3).contains(&flushed), "flushed {flushed} times");
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now_and_shutdown() {
        let (count, flush) = counting();
        let scheduler = FlushScheduler::spawn(Uuid::new_v4(), timing(), flush);

        scheduler.flush_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.note_activity();
        scheduler.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_drops_pending() {
        let (count, flush) = counting();
        let scheduler = FlushScheduler::spawn(Uuid::new_v4(), timing(), flush);
        scheduler.note_activity();
        scheduler.discard().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_when_clean_does_not_flush() {
        let (count, flush) = counting();
        let scheduler = FlushScheduler::spawn(Uuid::new_v4(), timing(), flush);
        scheduler.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
