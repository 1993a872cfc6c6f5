//! Periodic tasks: sequential, non-overlapping timers with instant cancellation.
//!
//! ```text
//! start ─┬─ now  ─▶ run ─▶ arm
//!        └─ else ─▶ arm
//! arm   ─▶ sleep(period) ─▶ fire
//! fire  ─▶ run callback (errors logged) ─▶ arm again unless cancelled
//! ```
//!
//! `cancel()` and the re-arm step share one lock, so no timer is ever armed
//! after cancellation. `join()` waits for the last armed timer only, not for
//! a callback that is still executing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::task::JoinHandle;

/// Blocking task body. Runs on the blocking thread pool.
pub type TaskCallback = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

struct TimerState {
    cancelled: bool,
    timer: Option<JoinHandle<()>>,
}

pub struct PeriodicTask {
    name: String,
    period: Duration,
    now: bool,
    callback: TaskCallback,
    state: Mutex<TimerState>,
    runs: AtomicU64,
}

impl PeriodicTask {
    pub fn new(name: &str, period: Duration, now: bool, callback: TaskCallback) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            period,
            now,
            callback,
            state: Mutex::new(TimerState {
                cancelled: false,
                timer: None,
            }),
            runs: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Callback executions so far.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Begin the schedule. With `now`, the first run completes before this returns.
    pub async fn start(self: &Arc<Self>) {
        tracing::info!(
            "⏰ Periodic task `{}` started (every {:?}{})",
            self.name,
            self.period,
            if self.now { ", running now" } else { "" }
        );
        if self.now {
            self.clone().fire().await;
        } else {
            let mut state = self.lock();
            if !state.cancelled {
                self.arm(&mut state);
            }
        }
    }

    fn arm(self: &Arc<Self>, state: &mut TimerState) {
        let task = self.clone();
        let period = self.period;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(period).await;
            tokio::spawn(task.fire());
        }));
    }

    fn fire(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            if self.is_cancelled() {
                return;
            }
            self.run_once().await;
            {
                let mut state = self.lock();
                if !state.cancelled {
                    self.arm(&mut state);
                }
            }
        }
        .boxed()
    }

    async fn run_once(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let callback = self.callback.clone();
        match tokio::task::spawn_blocking(move || callback()).await {
            Ok(Ok(())) => tracing::debug!("Periodic task `{}` ran", self.name),
            Ok(Err(e)) => tracing::error!(
                "❌ Exception while running periodic task `{}`: {:#}",
                self.name,
                e
            ),
            Err(e) => tracing::error!("❌ Periodic task `{}` panicked: {}", self.name, e),
        }
    }

    /// Stop rescheduling and disarm any pending timer.
    pub fn cancel(&self) {
        let mut state = self.lock();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        if let Some(timer) = &state.timer {
            timer.abort();
        }
        tracing::info!("🛑 Periodic task `{}` cancelled", self.name);
    }

    /// Wait until the last armed timer has finished waiting or was disarmed.
    pub async fn join(&self) {
        let timer = self.lock().timer.take();
        if let Some(timer) = timer {
            // An aborted timer resolves with a cancellation error.
            let _ = timer.await;
        }
    }
}

/// The set of periodic tasks owned by one router.
#[derive(Default)]
pub struct PeriodicScheduler {
    tasks: Vec<Arc<PeriodicTask>>,
}

impl PeriodicScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, task: Arc<PeriodicTask>) {
        self.tasks.push(task);
    }

    pub fn tasks(&self) -> &[Arc<PeriodicTask>] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub async fn start_all(&self) {
        for task in &self.tasks {
            task.start().await;
        }
    }

    pub fn cancel_all(&self) {
        for task in &self.tasks {
            task.cancel();
        }
    }

    pub async fn join_all(&self) {
        for task in &self.tasks {
            task.join().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: Arc<AtomicU64>) -> TaskCallback {
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_cadence_and_cancel() {
        let counter = Arc::new(AtomicU64::new(0));
        let task = PeriodicTask::new("tick", Duration::from_millis(500), true, counting(counter.clone()));

        task.start().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(counter.load(Ordering::SeqCst) >= 3);

        task.cancel();
        task.join().await;
        let after_cancel = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_cancel);
        assert!(task.is_cancelled());
    }

    #[tokio::test]
    async fn test_delayed_first_run() {
        let counter = Arc::new(AtomicU64::new(0));
        let task = PeriodicTask::new("later", Duration::from_millis(200), false, counting(counter.clone()));

        task.start().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(counter.load(Ordering::SeqCst) >= 1);
        task.cancel();
        task.join().await;
    }

    #[tokio::test]
    async fn test_cancel_before_first_fire() {
        let counter = Arc::new(AtomicU64::new(0));
        let task = PeriodicTask::new("never", Duration::from_millis(100), false, counting(counter.clone()));

        task.start().await;
        task.cancel();
        task.join().await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(task.runs(), 0);
    }

    #[tokio::test]
    async fn test_errors_do_not_stop_schedule() {
        let task = PeriodicTask::new(
            "failing",
            Duration::from_millis(50),
            true,
            Arc::new(|| Err(anyhow::anyhow!("always broken"))),
        );
        task.start().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        task.cancel();
        task.join().await;
        assert!(task.runs() >= 3);
    }

    #[tokio::test]
    async fn test_runs_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let callback: TaskCallback = {
            let (active, peak) = (active.clone(), peak.clone());
            Arc::new(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(80));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let task = PeriodicTask::new("slow", Duration::from_millis(10), true, callback);
        task.start().await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        task.cancel();
        task.join().await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(task.runs() >= 2);
    }

    #[tokio::test]
    async fn test_scheduler_lifecycle() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut scheduler = PeriodicScheduler::new();
        scheduler.add(PeriodicTask::new("a", Duration::from_millis(100), true, counting(counter.clone())));
        scheduler.add(PeriodicTask::new("b", Duration::from_millis(100), true, counting(counter.clone())));
        assert_eq!(scheduler.len(), 2);

        scheduler.start_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        scheduler.cancel_all();
        scheduler.join_all().await;
        assert!(scheduler.tasks().iter().all(|t| t.is_cancelled()));
    }
}
