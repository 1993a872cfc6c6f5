//! Worker Pool: N long-lived tasks draining the job queue.
//!
//! ```text
//! JobQueue::pop ─▶ look up handler + target address
//!                 ─▶ render title / image / message / priority (+ template)
//!                 ─▶ empty message? suppressed
//!                 ─▶ handler.handle(ctx, item) under a hard timeout
//!                 ─▶ JobOutcome, queue.task_done()
//! ```
//!
//! No retries: every outcome is terminal for its job.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::Instrument;

use mqroute_core::traits::Handler;
use mqroute_core::types::{Job, RoutingRule, WorkItem};
use mqroute_core::ServiceContext;

use crate::format::value_text;
use crate::queue::JobQueue;
use crate::registry::{HandlerEntry, HandlerRegistry};
use crate::transform::Pipeline;

/// Terminal state of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum JobOutcome {
    /// Handler returned `true`.
    Delivered,
    /// Handler returned `false` or an error.
    Failed,
    TimedOut,
    /// Rendered message was empty; handler not called.
    Suppressed,
    /// Unknown handler or target.
    Dropped,
}

/// What came back from a timed handler call.
#[derive(Debug)]
pub enum Invocation {
    Returned(bool),
    Raised(String),
    TimedOut,
}

/// Run `handler.handle` on a dedicated thread and stop waiting after `limit`.
///
/// The thread drives the call on its own single-threaded runtime, so a
/// handler that blocks (synchronous I/O, `std::thread::sleep`) stalls neither
/// the worker nor the runtime the worker lives on. On timeout the thread is
/// abandoned: it keeps running detached and its result is discarded.
pub async fn invoke_with_timeout(
    handler: Arc<dyn Handler>,
    ctx: ServiceContext,
    item: WorkItem,
    limit: Duration,
) -> Invocation {
    let (tx, rx) = oneshot::channel();
    let thread_name = format!("handler-{}", item.handler);
    let spawned = std::thread::Builder::new().name(thread_name).spawn(move || {
        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| format!("cannot start handler runtime: {e}"))
            .and_then(|runtime| {
                let span = ctx.span();
                runtime
                    .block_on(handler.handle(&ctx, &item).instrument(span))
                    .map_err(|e| e.to_string())
            });
        // The receiver is gone when the caller already timed out.
        let _ = tx.send(result);
    });
    if let Err(e) = spawned {
        return Invocation::Raised(format!("cannot spawn handler thread: {e}"));
    }

    match tokio::time::timeout(limit, rx).await {
        Ok(Ok(Ok(notified))) => Invocation::Returned(notified),
        Ok(Ok(Err(e))) => Invocation::Raised(e),
        Ok(Err(_)) => Invocation::Raised("handler thread panicked".into()),
        Err(_) => Invocation::TimedOut,
    }
}

/// Per-outcome counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    suppressed: AtomicU64,
    dropped: AtomicU64,
}

impl DispatchStats {
    pub fn record(&self, outcome: JobOutcome) {
        let counter = match outcome {
            JobOutcome::Delivered => &self.delivered,
            JobOutcome::Failed => &self.failed,
            JobOutcome::TimedOut => &self.timed_out,
            JobOutcome::Suppressed => &self.suppressed,
            JobOutcome::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchSnapshot {
    pub delivered: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub suppressed: u64,
    pub dropped: u64,
}

/// Turns jobs into handler invocations. Shared by every worker task.
pub struct JobProcessor {
    registry: Arc<HandlerRegistry>,
    rules: Arc<HashMap<String, RoutingRule>>,
    pipeline: Pipeline,
    services: ServiceContext,
    timeout: Duration,
    stats: Arc<DispatchStats>,
}

impl JobProcessor {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        rules: Arc<HashMap<String, RoutingRule>>,
        pipeline: Pipeline,
        services: ServiceContext,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            rules,
            pipeline,
            services,
            timeout,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        self.stats.clone()
    }

    /// Process one job. A job without a target is delivered to every target of its handler.
    pub async fn process(&self, job: &Job) -> Vec<JobOutcome> {
        let targets = match &job.target_name {
            Some(target) => vec![target.clone()],
            None => self.registry.target_names(&job.handler_name),
        };

        let mut outcomes = Vec::with_capacity(targets.len());
        for target in targets {
            let outcome = self.deliver(job, &target).await;
            self.stats.record(outcome);
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn deliver(&self, job: &Job, target: &str) -> JobOutcome {
        let handler = &job.handler_name;
        let Some(entry) = self.registry.get(handler) else {
            tracing::error!("❌ Cannot handle handler={}, target={}: not launched", handler, target);
            return JobOutcome::Dropped;
        };
        let Some(addrs) = entry.targets.get(target) else {
            tracing::error!(
                "❌ Invalid configuration: topic '{}' points to non-existing target '{}' in handler '{}'",
                job.topic,
                target,
                handler
            );
            return JobOutcome::Dropped;
        };

        let item = self.build_work_item(job, entry, target, addrs.clone());
        if item.message.is_empty() {
            tracing::warn!(
                "⚠️ Notification of {} for `{}` suppressed: text is empty",
                handler,
                job.topic
            );
            return JobOutcome::Suppressed;
        }

        tracing::info!("🔔 Invoking handler `{}` target `{}`", handler, target);
        let ctx = self.services.for_handler(handler);
        match invoke_with_timeout(entry.handler.clone(), ctx, item, self.timeout).await {
            Invocation::Returned(true) => {
                tracing::debug!("✅ Notification of {}:{} for `{}` delivered", handler, target, job.topic);
                JobOutcome::Delivered
            }
            Invocation::Returned(false) => {
                tracing::warn!("⚠️ Notification of {}:{} for `{}` FAILED", handler, target, job.topic);
                JobOutcome::Failed
            }
            Invocation::Raised(e) => {
                tracing::error!(
                    "❌ Cannot invoke handler {}:{} for `{}`: {}",
                    handler,
                    target,
                    job.topic,
                    e
                );
                JobOutcome::Failed
            }
            Invocation::TimedOut => {
                tracing::warn!(
                    "⏱️ Notification of {}:{} for `{}` TIMED OUT after {:?}",
                    handler,
                    target,
                    job.topic,
                    self.timeout
                );
                JobOutcome::TimedOut
            }
        }
    }

    /// Render the per-delivery fields from the job's shared data.
    pub fn build_work_item(&self, job: &Job, entry: &HandlerEntry, target: &str, addrs: Value) -> WorkItem {
        let rule = self.rules.get(&job.rule_name);
        let data = job.data.as_ref();

        let origin_title = format!("{}: {}", self.services.script_name(), job.topic);
        let title = self.pipeline.render_field_or(
            rule.and_then(|r| r.title.as_deref()),
            Value::String(origin_title),
            data,
        );
        let image = self.pipeline.render_field_or(
            rule.and_then(|r| r.image.as_deref()),
            Value::String(String::new()),
            data,
        );
        let mut message = value_text(&self.pipeline.render_field_or(
            rule.and_then(|r| r.format.as_deref()),
            Value::String(job.payload.as_text().into_owned()),
            data,
        ));
        let priority = self
            .pipeline
            .render_priority(rule.and_then(|r| r.priority.as_deref()), data);

        if let Some(template) = rule.and_then(|r| r.template.as_deref())
            && let Some(text) = self.pipeline.render_template(template, data)
        {
            message = text;
        }

        WorkItem {
            handler: job.handler_name.clone(),
            rule: job.rule_name.clone(),
            target: target.to_string(),
            config: entry.config.clone(),
            addrs,
            topic: job.topic.clone(),
            payload: job.payload.clone(),
            data: data.clone(),
            title: value_text(&title),
            image: value_text(&image),
            message,
            priority,
        }
    }
}

/// Spawn `count` workers on the current runtime.
pub fn spawn_workers(processor: Arc<JobProcessor>, queue: Arc<JobQueue>, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| tokio::spawn(worker_loop(id, processor.clone(), queue.clone())))
        .collect()
}

async fn worker_loop(id: usize, processor: Arc<JobProcessor>, queue: Arc<JobQueue>) {
    tracing::debug!("👷 Worker {} started", id);
    while let Some(job) = queue.pop().await {
        tracing::debug!(
            "Worker {} took {} for `{}`, queue depth: {}",
            id,
            job.handler_name,
            job.topic,
            queue.depth()
        );
        if AssertUnwindSafe(processor.process(&job)).catch_unwind().await.is_err() {
            tracing::error!(
                "❌ Worker {} panicked while processing {} for `{}`",
                id,
                job.handler_name,
                job.topic
            );
        }
        queue.task_done();
    }
    tracing::debug!("👷 Worker {} exiting", id);
}
