//! Dispatcher: the router's inbound entry point and lifecycle owner.
//!
//! ```text
//! on_message(topic, payload, retained)
//!   └── for each rule whose pattern matches (failover excluded)
//!         ├── filter? skip
//!         └── send_to_targets(rule, topic, payload)
//!               ├── Pipeline::decode
//!               ├── TargetResolver::resolve_jobs
//!               └── JobQueue::push ──▶ workers ──▶ handlers
//!
//! [cron] entries ──▶ PeriodicTask ──▶ user function(services)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use mqroute_core::config::{RouterConfig, FAILOVER_RULE};
use mqroute_core::error::Result;
use mqroute_core::traits::{FunctionResolver, PeriodicFn, Publisher, TemplateEngine};
use mqroute_core::types::{Payload, RoutingRule, TransformData};
use mqroute_core::ServiceContext;

use crate::format::truncate;
use crate::periodic::{PeriodicScheduler, PeriodicTask, TaskCallback};
use crate::queue::{JobQueue, QueueStats};
use crate::registry::HandlerRegistry;
use crate::targets::TargetResolver;
use crate::templates::DirTemplates;
use crate::topic::topic_matches;
use crate::transform::Pipeline;
use crate::worker::{spawn_workers, DispatchSnapshot, DispatchStats, JobProcessor};

/// Runtime knobs taken from `[defaults]`.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub script_name: String,
    pub num_workers: usize,
    pub skip_retained: bool,
    pub handler_timeout: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            script_name: "mqroute".into(),
            num_workers: 1,
            skip_retained: false,
            handler_timeout: Duration::from_secs(10),
        }
    }
}

impl DispatchOptions {
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            script_name: config.defaults.script_name.clone(),
            num_workers: config.defaults.num_workers,
            skip_retained: config.defaults.skip_retained,
            handler_timeout: config.handler_timeout(),
        }
    }
}

#[derive(Default)]
struct InboundCounters {
    received: AtomicU64,
    skipped_retained: AtomicU64,
    filtered: AtomicU64,
    enqueued: AtomicU64,
}

pub struct Dispatcher {
    options: DispatchOptions,
    rules: Vec<RoutingRule>,
    by_name: Arc<HashMap<String, RoutingRule>>,
    functions: Arc<dyn FunctionResolver>,
    services: ServiceContext,
    pipeline: Pipeline,
    resolver: TargetResolver,
    processor: Arc<JobProcessor>,
    dispatch_stats: Arc<DispatchStats>,
    queue: Arc<JobQueue>,
    periodic: PeriodicScheduler,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: InboundCounters,
}

impl Dispatcher {
    pub fn new(
        rules: Vec<RoutingRule>,
        functions: Arc<dyn FunctionResolver>,
        registry: Arc<HandlerRegistry>,
        templates: Option<Arc<dyn TemplateEngine>>,
        publisher: Arc<dyn Publisher>,
        options: DispatchOptions,
    ) -> Self {
        let script = options.script_name.clone();
        let services = ServiceContext::new(&format!("{script}.context"), &script, publisher);
        let by_name: Arc<HashMap<String, RoutingRule>> =
            Arc::new(rules.iter().map(|r| (r.name.clone(), r.clone())).collect());

        let pipeline = Pipeline::new(functions.clone(), templates, services.clone());
        let resolver = TargetResolver::new(functions.clone(), registry.clone(), services.clone());
        let processor = Arc::new(JobProcessor::new(
            registry,
            by_name.clone(),
            pipeline.clone(),
            services.clone(),
            options.handler_timeout,
        ));
        let dispatch_stats = processor.stats();

        Self {
            options,
            rules,
            by_name,
            functions,
            services,
            pipeline,
            resolver,
            processor,
            dispatch_stats,
            queue: Arc::new(JobQueue::new()),
            periodic: PeriodicScheduler::new(),
            workers: Mutex::new(Vec::new()),
            counters: InboundCounters::default(),
        }
    }

    /// Wire a dispatcher from configuration, including `[cron]` tasks and templates.
    pub fn from_config(
        config: &RouterConfig,
        functions: Arc<dyn FunctionResolver>,
        registry: HandlerRegistry,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self> {
        let templates = config
            .defaults
            .templates_dir
            .as_ref()
            .map(|dir| Arc::new(DirTemplates::new(dir)) as Arc<dyn TemplateEngine>);

        let mut dispatcher = Self::new(
            config.routing_rules(),
            functions,
            Arc::new(registry),
            templates,
            publisher,
            DispatchOptions::from_config(config),
        );

        for (name, spec) in &config.cron {
            let options = match spec.options() {
                Ok(options) => options,
                Err(e) => {
                    tracing::error!("❌ [cron] entry `{}` skipped: {}", name, e);
                    continue;
                }
            };
            match dispatcher.functions.resolve_periodic(name) {
                Ok(function) => {
                    tracing::debug!(
                        "Scheduling function `{}` as periodic task every {:?}",
                        name,
                        options.interval
                    );
                    dispatcher.add_periodic(name, options.interval, options.now, function);
                }
                Err(e) => {
                    tracing::error!("❌ [cron] has function `{}` specified, but: {}", name, e);
                }
            }
        }

        Ok(dispatcher)
    }

    /// Register a periodic task. Takes effect on `start()`.
    pub fn add_periodic(&mut self, name: &str, period: Duration, now: bool, function: PeriodicFn) {
        let ctx = self.services.named(&format!("{}.cron", self.options.script_name));
        let callback: TaskCallback = Arc::new(move || function(&ctx));
        self.periodic.add(PeriodicTask::new(name, period, now, callback));
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&RoutingRule> {
        self.by_name.get(name)
    }

    pub fn services(&self) -> &ServiceContext {
        &self.services
    }

    /// Distinct `(pattern, qos)` pairs to subscribe to, first rule wins per pattern.
    pub fn subscriptions(&self) -> Vec<(String, u8)> {
        let mut subscribed: Vec<(String, u8)> = Vec::new();
        for rule in self.rules.iter().filter(|r| r.name != FAILOVER_RULE) {
            if subscribed.iter().any(|(topic, _)| *topic == rule.topic) {
                continue;
            }
            tracing::debug!("Subscribing to {} (qos={})", rule.topic, rule.qos);
            subscribed.push((rule.topic.clone(), rule.qos));
        }
        subscribed
    }

    /// Inbound message from the transport. Returns the number of jobs enqueued.
    pub fn on_message(&self, topic: &str, payload: Payload, retained: bool) -> usize {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Message received on {}: {}",
            topic,
            truncate(&payload.as_text(), 200)
        );

        if retained && self.options.skip_retained {
            self.counters.skipped_retained.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Skipping retained message on {}", topic);
            return 0;
        }

        let mut enqueued = 0;
        for rule in &self.rules {
            if rule.name == FAILOVER_RULE || !topic_matches(&rule.topic, topic) {
                continue;
            }
            tracing::debug!("Rule [{}] matches message on {}. Processing...", rule.name, topic);
            if self.pipeline.is_filtered(rule, topic, &payload) {
                self.counters.filtered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Filter in rule [{}] has skipped message on {}", rule.name, topic);
                continue;
            }
            enqueued += self.dispatch(rule, topic, &payload);
        }
        enqueued
    }

    /// Route a message through one named rule, bypassing topic matching and filters.
    pub fn send_to_targets(&self, rule_name: &str, topic: &str, payload: Payload) -> usize {
        let Some(rule) = self.by_name.get(rule_name) else {
            tracing::warn!(
                "⚠️ Rule [{}] does not exist, skipping message on {}",
                rule_name,
                topic
            );
            return 0;
        };
        self.dispatch(rule, topic, &payload)
    }

    /// Log `message` and route it through the failover rule with `reason` as topic.
    pub fn send_failover(&self, reason: &str, message: &str) -> usize {
        tracing::warn!("⚠️ {}", message);
        self.send_to_targets(FAILOVER_RULE, reason, Payload::from(message))
    }

    fn dispatch(&self, rule: &RoutingRule, topic: &str, payload: &Payload) -> usize {
        if self.queue.is_closed() {
            tracing::warn!("⚠️ Shutting down, dropping message on {} for rule [{}]", topic, rule.name);
            return 0;
        }
        let data: Arc<TransformData> = Arc::new(self.pipeline.decode(Some(rule), topic, payload));
        let jobs = self.resolver.resolve_jobs(rule, topic, payload, data);

        let mut enqueued = 0;
        for job in jobs {
            tracing::debug!(
                "Message on {} going to {}:{}",
                topic,
                job.handler_name,
                job.target_name.as_deref().unwrap_or("*")
            );
            if let Err(e) = self.queue.push(job) {
                tracing::warn!("⚠️ Dropping message on {} for rule [{}]: {}", topic, rule.name, e);
                break;
            }
            enqueued += 1;
        }
        self.counters.enqueued.fetch_add(enqueued as u64, Ordering::Relaxed);
        enqueued
    }

    /// Spawn the worker pool and start periodic tasks.
    pub async fn start(&self) {
        tracing::info!("🚀 Starting {} worker(s)", self.options.num_workers);
        let handles = spawn_workers(self.processor.clone(), self.queue.clone(), self.options.num_workers);
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);

        if !self.periodic.is_empty() {
            tracing::info!("⏰ Starting {} periodic task(s)", self.periodic.len());
        }
        self.periodic.start_all().await;
    }

    /// Graceful stop: cancel timers, refuse new jobs, drain the queue, then retire workers.
    pub async fn shutdown(&self) {
        self.periodic.cancel_all();
        self.periodic.join_all().await;

        self.queue.close();
        tracing::info!("⏳ Waiting for queue to drain ({} pending)", self.queue.depth());
        self.queue.join().await;

        let workers: Vec<_> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!("⚠️ Worker ended abnormally: {}", e);
            }
        }
        tracing::info!("👋 Dispatcher stopped");
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            received: self.counters.received.load(Ordering::Relaxed),
            skipped_retained: self.counters.skipped_retained.load(Ordering::Relaxed),
            filtered: self.counters.filtered.load(Ordering::Relaxed),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            queue: self.queue.stats(),
            outcomes: self.dispatch_stats.snapshot(),
            periodic: self
                .periodic
                .tasks()
                .iter()
                .map(|t| PeriodicStats {
                    name: t.name().to_string(),
                    runs: t.runs(),
                    cancelled: t.is_cancelled(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PeriodicStats {
    pub name: String,
    pub runs: u64,
    pub cancelled: bool,
}

/// Counters for diagnostics and `--stats` output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatcherStats {
    pub received: u64,
    pub skipped_retained: u64,
    pub filtered: u64,
    pub enqueued: u64,
    pub queue: QueueStats,
    pub outcomes: DispatchSnapshot,
    pub periodic: Vec<PeriodicStats>,
}
