//! Lazy, cancelable timer scheduler
//!
//! One driver task per scheduler owns every pending deadline. The driver is
//! spawned on the first schedule and dropped by `cancel_all`, so an idle
//! account holds no background task.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Upper bound on an idle driver sleep
const IDLE_PARK: Duration = Duration::from_secs(3600);

const MIN_PERIOD: Duration = Duration::from_millis(1);

enum TimerTask {
    Once(BoxFuture<'static, ()>),
    Repeating(Box<dyn FnMut() -> BoxFuture<'static, ()> + Send>),
}

struct Entry {
    id: u64,
    canceled: Arc<AtomicBool>,
    period: Option<Duration>,
    task: TimerTask,
}

enum Command {
    Schedule { deadline: Instant, entry: Entry },
    Cancel(u64),
}

struct Driver {
    tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Handle to one scheduled task
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    canceled: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Command>,
}

impl TimerHandle {
    /// Stop the task from firing again. Idempotent.
    pub fn cancel(&self) {
        if !self.canceled.swap(true, Ordering::SeqCst) {
            // The driver may already be gone; the flag alone is enough then
            let _ = self.tx.send(Command::Cancel(self.id));
            trace!("Timer {} canceled", self.id);
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Schedule { deadline, entry } => f
                .debug_struct("Schedule")
                .field("deadline", deadline)
                .field("id", &entry.id)
                .finish(),
            Command::Cancel(id) => f.debug_tuple("Cancel").field(id).finish(),
        }
    }
}

/// Timer scheduler shared by everything on one account
#[derive(Default)]
pub struct TimerScheduler {
    driver: Mutex<Option<Driver>>,
    next_id: AtomicU64,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once after `delay`
    pub fn schedule_once<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule(delay, None, TimerTask::Once(task.boxed()))
    }

    /// Run `task` after `delay`, then every `period`
    pub fn schedule_repeating<F, Fut>(&self, delay: Duration, period: Duration, mut task: F) -> TimerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule(
            delay,
            Some(period),
            TimerTask::Repeating(Box::new(move || task().boxed())),
        )
    }

    /// Drop every pending task and release the driver
    pub fn cancel_all(&self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.task.abort();
            debug!("Timer scheduler driver released");
        }
    }

    /// Whether a driver task currently exists
    pub fn is_running(&self) -> bool {
        self.driver
            .lock()
            .as_ref()
            .map(|d| !d.task.is_finished())
            .unwrap_or(false)
    }

    fn schedule(&self, delay: Duration, period: Option<Duration>, task: TimerTask) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let canceled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            id,
            canceled: canceled.clone(),
            period,
            task,
        };

        let mut driver = self.driver.lock();
        let tx = match driver.as_ref() {
            Some(d) if !d.task.is_finished() => d.tx.clone(),
            _ => {
                let (tx, rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(Self::run(rx));
                debug!("Timer scheduler driver started");
                *driver = Some(Driver { tx: tx.clone(), task });
                tx
            }
        };
        let _ = tx.send(Command::Schedule {
            deadline: Instant::now() + delay,
            entry,
        });

        TimerHandle { id, canceled, tx }
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut queue: BTreeMap<(Instant, u64), Entry> = BTreeMap::new();

        loop {
            let next = queue.keys().next().map(|(deadline, _)| *deadline);
            let wake = next.unwrap_or_else(|| Instant::now() + IDLE_PARK);

            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Schedule { deadline, entry }) => {
                        queue.insert((deadline, entry.id), entry);
                    }
                    Some(Command::Cancel(id)) => {
                        queue.retain(|(_, entry_id), _| *entry_id != id);
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(wake), if next.is_some() => {
                    let now = Instant::now();
                    let due: Vec<(Instant, u64)> = queue
                        .range(..=(now, u64::MAX))
                        .map(|(key, _)| *key)
                        .collect();

                    for key in due {
                        let Some(entry) = queue.remove(&key) else { continue };
                        if entry.canceled.load(Ordering::SeqCst) {
                            continue;
                        }
                        if let Some(entry) = Self::fire(entry) {
                            let period = entry.period.unwrap_or_default().max(MIN_PERIOD);
                            queue.insert((key.0 + period, entry.id), entry);
                        }
                    }
                }
            }
        }
    }

    /// Spawn the task; hand back the entry if it must fire again
    fn fire(entry: Entry) -> Option<Entry> {
        trace!("Timer {} fired", entry.id);
        match entry.task {
            TimerTask::Once(future) => {
                tokio::spawn(future);
                None
            }
            TimerTask::Repeating(mut factory) => {
                tokio::spawn(factory());
                Some(Entry {
                    task: TimerTask::Repeating(factory),
                    ..entry
                })
            }
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> BoxFuture<'static, ()>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_is_lazy() {
        let scheduler = TimerScheduler::new();
        assert!(!scheduler.is_running());

        let (count, task) = counter();
        scheduler.schedule_once(Duration::from_secs(10), task());
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let scheduler = TimerScheduler::new();
        let (count, task) = counter();

        let handle = scheduler.schedule_once(Duration::from_secs(5), task());
        handle.cancel();
        handle.cancel();
        assert!(handle.is_canceled());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_until_canceled() {
        let scheduler = TimerScheduler::new();
        let (count, task) = counter();

        let handle = scheduler.schedule_repeating(Duration::from_secs(1), Duration::from_secs(2), task);

        // Fires at 1s, 3s, 5s
        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_releases_and_recreates_driver() {
        let scheduler = TimerScheduler::new();
        let (count, task) = counter();

        scheduler.schedule_once(Duration::from_secs(5), task());
        scheduler.cancel_all();
        assert!(!scheduler.is_running());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        scheduler.schedule_once(Duration::from_secs(1), task());
        assert!(scheduler.is_running());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
