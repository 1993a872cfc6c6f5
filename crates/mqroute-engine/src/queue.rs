//! Job Queue: unbounded FIFO shared by the inbound path, periodic tasks and workers.
//!
//! Enqueue never blocks. `pop()` waits until a job arrives or the queue is
//! closed and empty. `join()` waits until every job ever pushed has been
//! acknowledged with `task_done()`.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use mqroute_core::error::{Result, RouterError};
use mqroute_core::types::Job;

struct QueueState {
    jobs: VecDeque<Job>,
    unfinished: usize,
    closed: bool,
    total_enqueued: u64,
    total_processed: u64,
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Notify,
    drained: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                unfinished: 0,
                closed: false,
                total_enqueued: 0,
                total_processed: 0,
            }),
            available: Notify::new(),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job. Fails once the queue is closed.
    pub fn push(&self, job: Job) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(RouterError::QueueClosed);
            }
            tracing::debug!(
                "📥 Queue enqueue: {}:{} for {} (depth: {})",
                job.handler_name,
                job.target_name.as_deref().unwrap_or("*"),
                job.topic,
                state.jobs.len()
            );
            state.jobs.push_back(job);
            state.unfinished += 1;
            state.total_enqueued += 1;
        }
        self.available.notify_one();
        Ok(())
    }

    /// Next job in arrival order; `None` once closed and empty.
    pub async fn pop(&self) -> Option<Job> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(job) = state.jobs.pop_front() {
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<Job> {
        self.lock().jobs.pop_front()
    }

    /// Acknowledge one popped job as processed, whatever its outcome.
    pub fn task_done(&self) {
        let drained = {
            let mut state = self.lock();
            state.unfinished = state.unfinished.saturating_sub(1);
            state.total_processed += 1;
            state.unfinished == 0
        };
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Wait until every pushed job has been acknowledged.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().unfinished == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Refuse further pushes and wake idle workers. Queued jobs stay poppable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Jobs waiting to be popped.
    pub fn depth(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            depth: state.jobs.len(),
            unfinished: state.unfinished,
            total_enqueued: state.total_enqueued,
            total_processed: state.total_processed,
            closed: state.closed,
        }
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue statistics.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct QueueStats {
    pub depth: usize,
    /// Pushed but not yet acknowledged.
    pub unfinished: usize,
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub closed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqroute_core::types::{Payload, TransformData};
    use std::sync::Arc;
    use std::time::Duration;

    fn make_job(target: &str) -> Job {
        Job {
            priority: 1,
            handler_name: "log".into(),
            rule_name: "r".into(),
            topic: "t".into(),
            payload: Payload::from("x"),
            data: Arc::new(TransformData::new()),
            target_name: Some(target.into()),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = JobQueue::new();
        for t in ["a", "b", "c"] {
            queue.push(make_job(t)).unwrap();
        }
        assert_eq!(queue.depth(), 3);
        for t in ["a", "b", "c"] {
            assert_eq!(queue.pop().await.unwrap().target_name.as_deref(), Some(t));
        }
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(JobQueue::new());
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.pop().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        queue.push(make_job("late")).unwrap();
        let job = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(job.unwrap().target_name.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_close_wakes_all_waiters() {
        let queue = Arc::new(JobQueue::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.close();
        for waiter in waiters {
            let popped = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
            assert!(popped.is_none());
        }
    }

    #[tokio::test]
    async fn test_closed_queue_still_drains() {
        let queue = JobQueue::new();
        queue.push(make_job("a")).unwrap();
        assert!(!queue.is_closed());
        queue.close();
        assert!(queue.is_closed());
        assert!(matches!(queue.push(make_job("b")), Err(RouterError::QueueClosed)));
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_join_waits_for_task_done() {
        let queue = Arc::new(JobQueue::new());
        queue.join().await;

        queue.push(make_job("a")).unwrap();
        queue.push(make_job("b")).unwrap();
        let joiner = tokio::spawn({
            let queue = queue.clone();
            async move { queue.join().await }
        });

        queue.pop().await.unwrap();
        queue.task_done();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!joiner.is_finished());

        queue.pop().await.unwrap();
        queue.task_done();
        tokio::time::timeout(Duration::from_secs(1), joiner).await.unwrap().unwrap();

        let stats = queue.stats();
        assert_eq!(stats.total_enqueued, 2);
        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.unfinished, 0);
    }
}
