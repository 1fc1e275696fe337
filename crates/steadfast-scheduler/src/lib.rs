//! Scheduler: recurring jobs driven through the resilience pipeline.
//!
//! A scheduler owns a set of jobs and one handler. Each tick (default
//! 1 s) it scans for due, non-running jobs and dispatches up to
//! `max_parallel` of them as function operations through the shared
//! [`Runner`], so the same circuit breakers, limiters and timeouts apply
//! to every job. Failures re-arm per the job's retry policy; state
//! persists (debounced) through a [`SnapshotStore`] and restores before
//! any dispatch.
//!
//! # Example
//!
//! ```
//! use steadfast_scheduler::{JobSpec, Scheduler};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let scheduler: Scheduler<u32> = Scheduler::builder("nightly")
//!     .handler(|invocation| async move {
//!         tracing::info!(job = %invocation.job_id, "running");
//!         Ok(0u32)
//!     })
//!     .build();
//!
//! scheduler
//!     .add_job(JobSpec::new("cleanup").cron("0 3 * * *"))
//!     .unwrap();
//! scheduler.start();
//! # }
//! ```

mod cron;
mod job;

pub use cron::CronExpr;
pub use job::{JobRetry, JobSnapshot, JobSpec, Schedule, SchedulerSnapshot};

use futures::future::BoxFuture;
use job::Job;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use steadfast_bulkhead::Bulkhead;
use steadfast_circuitbreaker::CircuitBreaker;
use steadfast_core::{ConfigError, Debouncer, ExecutionContext, OperationError, SnapshotStore};
use steadfast_executor::{Operation, ProfilePatch, Runner, SharedBuffer, StateValue};
use steadfast_metrics::{Anomaly, GuardrailSources, Guardrails, MetricMap};
use steadfast_ratelimiter::RateLimiter;

/// Resilience primitives shared by every job of a scheduler (and possibly
/// by several schedulers).
#[derive(Clone, Default)]
pub struct SharedInfrastructure {
    pub circuit_breaker: Option<Arc<CircuitBreaker>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub bulkhead: Option<Arc<Bulkhead>>,
}

impl SharedInfrastructure {
    /// Re-hydrate every component from its bound persistence store.
    pub async fn reload_from_persistence(&self) {
        if let Some(breaker) = &self.circuit_breaker {
            breaker.reload_from_persistence().await;
        }
        if let Some(limiter) = &self.rate_limiter {
            limiter.reload_from_persistence().await;
        }
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.reload_from_persistence().await;
        }
    }
}

/// What a job handler receives on each invocation.
pub struct JobInvocation {
    pub job_id: String,
    pub payload: Option<StateValue>,
    pub infrastructure: SharedInfrastructure,
    pub buffer: Option<SharedBuffer>,
    pub context: ExecutionContext,
}

/// The handler every job runs through.
pub type JobHandler<T> =
    Arc<dyn Fn(JobInvocation) -> BoxFuture<'static, Result<T, OperationError>> + Send + Sync>;

/// Cumulative scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerMetrics {
    pub ticks: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
    pub jobs: usize,
    pub running: usize,
}

impl SchedulerMetrics {
    /// Flatten for guardrail checks.
    pub fn metric_map(&self) -> MetricMap {
        MetricMap::from([
            ("ticks".into(), self.ticks as f64),
            ("dispatched".into(), self.dispatched as f64),
            ("completed".into(), self.completed as f64),
            ("failed".into(), self.failed as f64),
            ("retries".into(), self.retries as f64),
            ("jobs".into(), self.jobs as f64),
            ("running".into(), self.running as f64),
            (
                "failure_rate".into(),
                if self.dispatched == 0 {
                    0.0
                } else {
                    self.failed as f64 / self.dispatched as f64
                },
            ),
        ])
    }
}

struct SchedulerInner<T> {
    name: String,
    tick: Duration,
    max_parallel: usize,
    execution_timeout: Option<Duration>,
    handler: JobHandler<T>,
    runner: Runner<T>,
    infrastructure: SharedInfrastructure,
    buffer: Option<SharedBuffer>,
    guardrails: Option<Guardrails>,
    jobs: Mutex<HashMap<String, Job>>,
    running: AtomicBool,
    in_flight: AtomicUsize,
    ticks: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    store: Option<(Arc<dyn SnapshotStore>, String)>,
    debouncer: Debouncer,
}

/// A recurring-job scheduler over the steadfast execution pipeline.
pub struct Scheduler<T> {
    inner: Arc<SchedulerInner<T>>,
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`Scheduler`].
pub struct SchedulerBuilder<T> {
    name: String,
    tick: Duration,
    max_parallel: usize,
    execution_timeout: Option<Duration>,
    handler: Option<JobHandler<T>>,
    runner: Runner<T>,
    infrastructure: SharedInfrastructure,
    buffer: Option<SharedBuffer>,
    guardrails: Option<Guardrails>,
    store: Option<(Arc<dyn SnapshotStore>, String)>,
    persistence_debounce: Duration,
}

impl<T: Clone + Send + Sync + 'static> SchedulerBuilder<T> {
    fn new(name: String) -> Self {
        Self {
            name,
            tick: Duration::from_secs(1),
            max_parallel: 4,
            execution_timeout: None,
            handler: None,
            runner: Runner::new(),
            infrastructure: SharedInfrastructure::default(),
            buffer: None,
            guardrails: None,
            store: None,
            persistence_debounce: Duration::from_secs(1),
        }
    }

    /// Install the job handler. Required.
    pub fn handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(JobInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |invocation| Box::pin(f(invocation))));
        self
    }

    /// Scan interval. Default 1 s.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Concurrent handler runs. Default 4.
    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Abort a handler run after this long.
    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    /// Use a runner with a transport or custom wiring.
    pub fn runner(mut self, runner: Runner<T>) -> Self {
        self.runner = runner;
        self
    }

    /// Share circuit breaker / limiters across every job (and any other
    /// scheduler holding the same handles).
    pub fn infrastructure(mut self, infrastructure: SharedInfrastructure) -> Self {
        self.infrastructure = infrastructure;
        self
    }

    /// Shared buffer handed to every handler invocation.
    pub fn buffer(mut self, buffer: SharedBuffer) -> Self {
        self.buffer = Some(buffer);
        self
    }

    /// Guardrails evaluated by [`Scheduler::check_guardrails`].
    pub fn guardrails(mut self, guardrails: Guardrails) -> Self {
        self.guardrails = Some(guardrails);
        self
    }

    /// Persist job state through a store, debounced.
    pub fn persistence(mut self, store: Arc<dyn SnapshotStore>, key: impl Into<String>) -> Self {
        self.store = Some((store, key.into()));
        self
    }

    pub fn persistence_debounce(mut self, interval: Duration) -> Self {
        self.persistence_debounce = interval;
        self
    }

    pub fn build(self) -> Scheduler<T> {
        let handler = self
            .handler
            .expect("scheduler requires a handler; call .handler(...)");
        Scheduler {
            inner: Arc::new(SchedulerInner {
                name: self.name,
                tick: self.tick,
                max_parallel: self.max_parallel,
                execution_timeout: self.execution_timeout,
                handler,
                runner: self.runner,
                infrastructure: self.infrastructure,
                buffer: self.buffer,
                guardrails: self.guardrails,
                jobs: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                ticks: AtomicU64::new(0),
                dispatched: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retries: AtomicU64::new(0),
                store: self.store,
                debouncer: Debouncer::new(self.persistence_debounce),
            }),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Scheduler<T> {
    pub fn builder(name: impl Into<String>) -> SchedulerBuilder<T> {
        SchedulerBuilder::new(name.into())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register a job. Cron expressions are validated here.
    pub fn add_job(&self, spec: JobSpec) -> Result<(), ConfigError> {
        let job = Job::from_spec(spec, SystemTime::now())?;
        let mut jobs = self.inner.jobs.lock().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(ConfigError::new(
                self.inner.name.clone(),
                format!("duplicate job id '{}'", job.id),
            ));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    pub fn remove_job(&self, id: &str) -> bool {
        self.inner.jobs.lock().unwrap().remove(id).is_some()
    }

    /// Begin ticking in the background. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.inner.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while scheduler.inner.running.load(Ordering::SeqCst) {
                interval.tick().await;
                scheduler.tick_once().await;
            }
            tracing::info!(scheduler = %scheduler.inner.name, "scheduler stopped");
        });
    }

    /// Stop dispatching. In-flight handlers run to completion.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// One synchronous scan-and-dispatch pass. The background loop calls
    /// this; tests may call it directly for determinism.
    pub async fn tick_once(&self) {
        self.inner.ticks.fetch_add(1, Ordering::SeqCst);
        let now = SystemTime::now();

        let budget = self
            .inner
            .max_parallel
            .saturating_sub(self.inner.in_flight.load(Ordering::SeqCst));
        if budget == 0 {
            return;
        }

        let due: Vec<Job> = {
            let mut jobs = self.inner.jobs.lock().unwrap();
            let mut due: Vec<&mut Job> = jobs.values_mut().filter(|job| job.due(now)).collect();
            due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at));
            due.into_iter()
                .take(budget)
                .map(|job| {
                    job.running = true;
                    job.clone()
                })
                .collect()
        };

        for job in due {
            self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
            self.inner.dispatched.fetch_add(1, Ordering::SeqCst);
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.run_job(job).await;
                scheduler.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    async fn run_job(&self, job: Job) {
        let inner = &self.inner;
        let handler = Arc::clone(&inner.handler);
        let invocation_template = (
            job.id.clone(),
            job.payload.clone(),
            inner.infrastructure.clone(),
            inner.buffer.clone(),
        );
        let context = ExecutionContext::new()
            .in_workflow(format!("scheduler:{}", inner.name))
            .with_request(job.id.clone());

        let mut profile: ProfilePatch<T> = ProfilePatch::new();
        if let Some(breaker) = &inner.infrastructure.circuit_breaker {
            profile = profile.circuit_breaker(Arc::clone(breaker));
        }
        if let Some(limiter) = &inner.infrastructure.rate_limiter {
            profile = profile.rate_limiter(Arc::clone(limiter));
        }
        if let Some(bulkhead) = &inner.infrastructure.bulkhead {
            profile = profile.bulkhead(Arc::clone(bulkhead));
        }
        if let Some(timeout) = inner.execution_timeout {
            profile = profile.timeout(timeout);
        }

        let op = Operation::call(job.id.clone(), move |input| {
            let handler = Arc::clone(&handler);
            let (job_id, payload, infrastructure, buffer) = invocation_template.clone();
            async move {
                handler(JobInvocation {
                    job_id,
                    payload,
                    infrastructure,
                    buffer,
                    context: input.context,
                })
                .await
            }
        })
        .with_context(context)
        .with_profile(profile);

        let result = inner.runner.execute(&op).await;
        let success = result.success;
        if success {
            inner.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            inner.failed.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                scheduler = %inner.name,
                job = %job.id,
                error = ?result.effective_error().map(|e| &e.message),
                "job run failed"
            );
        }

        {
            let mut jobs = inner.jobs.lock().unwrap();
            if let Some(live) = jobs.get_mut(&job.id) {
                let attempts_before = live.attempts_made;
                live.settle(success, SystemTime::now());
                if live.attempts_made > attempts_before {
                    inner.retries.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        self.persist_debounced();
    }

    /// Cumulative metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            ticks: self.inner.ticks.load(Ordering::SeqCst),
            dispatched: self.inner.dispatched.load(Ordering::SeqCst),
            completed: self.inner.completed.load(Ordering::SeqCst),
            failed: self.inner.failed.load(Ordering::SeqCst),
            retries: self.inner.retries.load(Ordering::SeqCst),
            jobs: self.inner.jobs.lock().unwrap().len(),
            running: self.inner.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Evaluate configured guardrails against scheduler and infrastructure
    /// metrics. Violations come back as anomalies; nothing is raised.
    pub fn check_guardrails(&self) -> Vec<Anomaly> {
        let Some(guardrails) = &self.inner.guardrails else {
            return Vec::new();
        };
        let sources = GuardrailSources {
            scheduler: Some(self.metrics().metric_map()),
            circuit_breaker: self
                .inner
                .infrastructure
                .circuit_breaker
                .as_ref()
                .map(|cb| steadfast_metrics::circuit_breaker_metric_map(&cb.metrics())),
            rate_limiter: self
                .inner
                .infrastructure
                .rate_limiter
                .as_ref()
                .map(|rl| steadfast_metrics::rate_limiter_metric_map(&rl.metrics())),
            concurrency_limiter: self
                .inner
                .infrastructure
                .bulkhead
                .as_ref()
                .map(|bh| steadfast_metrics::bulkhead_metric_map(&bh.metrics())),
            ..Default::default()
        };
        let anomalies = guardrails.validate(&sources);
        for anomaly in &anomalies {
            tracing::warn!(
                scheduler = %self.inner.name,
                section = %anomaly.section,
                metric = %anomaly.metric,
                value = anomaly.value,
                "guardrail violation"
            );
        }
        anomalies
    }

    /// Current serialisable state.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let jobs = self.inner.jobs.lock().unwrap();
        let mut snapshots: Vec<JobSnapshot> = jobs.values().map(|job| job.snapshot()).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        SchedulerSnapshot { jobs: snapshots }
    }

    /// Replace job state from a snapshot. Jobs mid-run when the snapshot
    /// was taken come back idle and re-fire on their next eligibility.
    pub fn apply_snapshot(&self, snapshot: SchedulerSnapshot) -> Result<(), ConfigError> {
        let mut restored = HashMap::new();
        for job_snapshot in snapshot.jobs {
            let job = Job::from_snapshot(job_snapshot)?;
            restored.insert(job.id.clone(), job);
        }
        *self.inner.jobs.lock().unwrap() = restored;
        Ok(())
    }

    /// Restore state from the bound store and re-hydrate shared
    /// infrastructure before any job dispatches.
    pub async fn restore_state(&self) -> Result<(), ConfigError> {
        if let Some((store, key)) = &self.inner.store {
            if let Some(value) = store.load(key).await {
                let snapshot: SchedulerSnapshot = serde_json::from_value(value).map_err(|e| {
                    ConfigError::new(self.inner.name.clone(), format!("malformed snapshot: {e}"))
                })?;
                self.apply_snapshot(snapshot)?;
            }
        }
        self.inner.infrastructure.reload_from_persistence().await;
        Ok(())
    }

    /// Persist immediately, bypassing the debounce.
    pub async fn persist_now(&self) {
        let Some((store, key)) = &self.inner.store else {
            return;
        };
        if let Ok(value) = serde_json::to_value(self.snapshot()) {
            store.store(key, value).await;
        }
    }

    fn persist_debounced(&self) {
        let Some((store, key)) = &self.inner.store else {
            return;
        };
        if !self.inner.debouncer.should_fire() {
            return;
        }
        let Ok(value) = serde_json::to_value(self.snapshot()) else {
            return;
        };
        let store = Arc::clone(store);
        let key = key.clone();
        tokio::spawn(async move {
            store.store(&key, value).await;
        });
    }
}
