//! The single-operation retry loop.
//!
//! Per attempt, in order: admission gates (circuit breaker → rate limiter
//! → bulkhead around the invocation), cache consult, pre-execution hook,
//! trial-mode roll, the invocation itself under its deadline, response
//! analysis, then bookkeeping. Retryable failures sleep the computed
//! backoff and go around again; non-retryable ones exit immediately.

use crate::backoff::compute_backoff;
use crate::operation::{
    Analysis, AnalyzerInput, CallInput, FinalDisposition, FinalErrorInput, HookInput, Operation,
    OperationKind,
};
use crate::profile::ResilienceProfile;
use crate::result::{clip_for_log, AttemptOutcome, AttemptRecord, OperationResult, Verdict};
use crate::transport::Transport;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use steadfast_cache::{function_fingerprint, KeyMaterial, WriteContext};
use steadfast_core::{CancelToken, ErrorKind, OperationError};

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter, histogram};

/// Cross-cutting execution inputs: cancellation and an optional outer
/// deadline (e.g. the remaining workflow budget).
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub token: CancelToken,
    pub deadline: Option<Instant>,
}

impl RunOptions {
    pub fn cancellable(token: CancelToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }
}

/// Executes operations through the resilience pipeline.
///
/// A runner is cheap to clone and safe to share; all mutable state lives in
/// the primitives referenced by each operation's profile.
pub struct Runner<T> {
    transport: Option<Arc<dyn Transport<T>>>,
}

impl<T> Clone for Runner<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
        }
    }
}

impl<T> Default for Runner<T> {
    fn default() -> Self {
        Self { transport: None }
    }
}

struct InvokeOutput<T> {
    payload: T,
    status: Option<u16>,
    cache_control: Option<String>,
}

impl<T: Clone + Send + Sync + 'static> Runner<T> {
    /// A runner for function operations only.
    pub fn new() -> Self {
        Self::default()
    }

    /// A runner that can also dispatch request operations.
    pub fn with_transport(transport: Arc<dyn Transport<T>>) -> Self {
        Self {
            transport: Some(transport),
        }
    }

    /// Execute with default options.
    pub async fn execute(&self, op: &Operation<T>) -> OperationResult<T> {
        self.run(op, &RunOptions::default()).await
    }

    /// Execute under a cancellation token and optional deadline.
    pub async fn run(&self, op: &Operation<T>, opts: &RunOptions) -> OperationResult<T> {
        #[cfg(feature = "metrics")]
        describe_counter!(
            "steadfast_executor_attempts_total",
            "Operation attempts by outcome"
        );

        let started = Instant::now();
        let profile = match ResilienceProfile::resolve(&[&op.profile]) {
            Ok(profile) => profile,
            Err(error) => {
                return OperationResult::assemble(
                    op.id.clone(),
                    op.group.clone(),
                    op.context.clone(),
                    Vec::new(),
                    None,
                    Some(error.with_context(op.context.clone())),
                    false,
                    started.elapsed(),
                );
            }
        };

        let mut rng = match profile.trial.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let per_attempt_recording = profile
            .circuit_breaker
            .as_ref()
            .map(|cb| cb.records_individual_attempts())
            .unwrap_or(false);

        let cache_key = profile.cache.as_ref().map(|cache| match &op.kind {
            OperationKind::Request(spec) => cache.request_key(&KeyMaterial {
                method: spec.method.to_string(),
                url: spec.url(),
                body: spec.body.as_ref().map(|b| b.to_string()),
                headers: spec.headers.clone(),
            }),
            OperationKind::Call { identity, args, .. } => function_fingerprint(identity, args),
        });

        let mut records: Vec<AttemptRecord<T>> = Vec::new();
        let mut final_payload: Option<T> = None;
        let mut final_error: Option<OperationError> = None;
        // Final outcome of the last attempt that actually ran the
        // operation; drives per-operation breaker recording.
        let mut last_invoked_outcome: Option<bool> = None;

        'attempts: for attempt in 1..=profile.attempts {
            if opts.token.is_cancelled() {
                final_error = Some(self.cancelled_error(op));
                break;
            }

            let attempt_started_wall = SystemTime::now();
            let attempt_started = Instant::now();
            let mut effective = profile.clone();

            // Gate 1: circuit breaker. Rejections are final for this call.
            if let Some(breaker) = &effective.circuit_breaker {
                if !breaker.can_execute() {
                    let error = breaker.rejection().with_context(op.context.clone());
                    records.push(self.failure_record(
                        attempt,
                        attempt_started_wall,
                        attempt_started.elapsed(),
                        error.clone(),
                        false,
                    ));
                    self.handle_failure(op, &error, effective.max_serializable_chars);
                    final_error = Some(error);
                    break;
                }
            }

            // Gate 2: rate limiter.
            if let Some(limiter) = &effective.rate_limiter {
                match limiter.acquire_cancellable(&opts.token).await {
                    Ok(_) => {}
                    Err(error) => {
                        let error = error.with_context(op.context.clone());
                        if error.is_cancelled() {
                            final_error = Some(error);
                            break;
                        }
                        records.push(self.failure_record(
                            attempt,
                            attempt_started_wall,
                            attempt_started.elapsed(),
                            error.clone(),
                            false,
                        ));
                        self.handle_failure(op, &error, effective.max_serializable_chars);
                        final_error = Some(error);
                        if attempt == profile.attempts {
                            break;
                        }
                        self.sleep_backoff(attempt, &effective, &opts.token, &mut rng).await;
                        continue;
                    }
                }
            }

            // Cache consult ends the loop on a hit.
            if let (Some(cache), Some(key)) = (&effective.cache, &cache_key) {
                if let Some(payload) = cache.get(key) {
                    let record = AttemptRecord {
                        number: attempt,
                        started_at: attempt_started_wall,
                        duration: attempt_started.elapsed(),
                        outcome: AttemptOutcome::Success,
                        payload: Some(payload.clone()),
                        error: None,
                        verdict: Verdict::NotRun,
                        from_cache: true,
                        synthetic: false,
                    };
                    if op.log_all_successes {
                        if let Some(handler) = &op.on_success {
                            handler(&record, &op.context);
                        }
                    }
                    records.push(record);
                    final_payload = Some(payload);
                    final_error = None;
                    self.count_attempt("cache_hit");
                    break;
                }
            }

            // Pre-execution hook, optionally overriding this attempt.
            if let Some(hook) = &op.pre_hook {
                let input = HookInput {
                    context: op.context.clone(),
                    params: op.pre_hook_params.clone(),
                    buffer: op.buffer.clone(),
                };
                match hook(input).await {
                    Ok(Some(patch)) if op.apply_pre_hook_override => effective.apply(&patch),
                    Ok(_) => {}
                    Err(hook_error) => {
                        let mut error = OperationError::new(
                            ErrorKind::PreHookFailure,
                            format!("pre-execution hook failed: {}", hook_error.message),
                        )
                        .with_context(op.context.clone());
                        if !op.continue_on_pre_hook_failure {
                            error = error.not_retryable();
                        }
                        records.push(self.failure_record(
                            attempt,
                            attempt_started_wall,
                            attempt_started.elapsed(),
                            error.clone(),
                            false,
                        ));
                        self.handle_failure(op, &error, effective.max_serializable_chars);
                        final_error = Some(error.clone());
                        if !error.retryable || attempt == profile.attempts {
                            break;
                        }
                        self.sleep_backoff(attempt, &effective, &opts.token, &mut rng).await;
                        continue;
                    }
                }
            }

            // Trial mode rolls a synthetic failure before invoking.
            let synthetic = if effective.trial.enabled {
                let probability = if attempt == 1 {
                    effective.trial.req_failure_probability
                } else {
                    effective.trial.retry_failure_probability
                };
                probability > 0.0 && rng.random::<f64>() < probability
            } else {
                false
            };

            let outcome: Result<InvokeOutput<T>, OperationError> = if synthetic {
                Err(OperationError::transport("trial mode synthetic failure")
                    .with_context(op.context.clone()))
            } else {
                self.invoke(op, &effective, opts).await
            };

            let duration = attempt_started.elapsed();

            match outcome {
                Ok(output) => {
                    let mut verdict = Verdict::NotRun;
                    let mut analyzed_failure: Option<OperationError> = None;

                    if let Some(analyzer) = &op.response_analyzer {
                        let input = AnalyzerInput {
                            payload: output.payload.clone(),
                            status: output.status,
                            context: op.context.clone(),
                            buffer: op.buffer.clone(),
                        };
                        match analyzer(input).await {
                            Ok(Analysis::Pass) => verdict = Verdict::Pass,
                            Ok(Analysis::Fail { message, retryable }) => {
                                verdict = Verdict::Fail;
                                let mut error =
                                    OperationError::new(ErrorKind::AnalyzerFailure, message)
                                        .with_context(op.context.clone());
                                error.retryable = retryable;
                                analyzed_failure = Some(error);
                            }
                            Err(analyzer_error) => {
                                if effective.throw_on_failed_error_analysis {
                                    let error = OperationError::new(
                                        ErrorKind::AnalyzerFailure,
                                        format!(
                                            "response analyzer failed: {}",
                                            analyzer_error.message
                                        ),
                                    )
                                    .with_context(op.context.clone())
                                    .not_retryable();
                                    records.push(self.failure_record(
                                        attempt,
                                        attempt_started_wall,
                                        duration,
                                        error.clone(),
                                        synthetic,
                                    ));
                                    self.handle_failure(op, &error, effective.max_serializable_chars);
                                    last_invoked_outcome = Some(false);
                                    if per_attempt_recording {
                                        self.record_breaker(&effective, false);
                                    }
                                    final_error = Some(error);
                                    break 'attempts;
                                }
                                tracing::warn!(
                                    operation = %op.id,
                                    error = %analyzer_error,
                                    "response analyzer failed; keeping raw outcome"
                                );
                            }
                        }
                    }

                    if let Some(error) = analyzed_failure {
                        // Semantically bad despite transport success.
                        records.push(self.failure_record(
                            attempt,
                            attempt_started_wall,
                            duration,
                            error.clone(),
                            synthetic,
                        ));
                        self.handle_failure(op, &error, effective.max_serializable_chars);
                        last_invoked_outcome = Some(false);
                        if per_attempt_recording {
                            self.record_breaker(&effective, false);
                        }
                        self.count_attempt("analyzer_failure");
                        final_error = Some(error.clone());
                        if !error.retryable || attempt == profile.attempts {
                            break;
                        }
                        self.sleep_backoff(attempt, &effective, &opts.token, &mut rng).await;
                        continue;
                    }

                    // Genuine success.
                    if let (Some(cache), Some(key)) = (&effective.cache, &cache_key) {
                        let method = match &op.kind {
                            OperationKind::Request(spec) => Some(spec.method.as_str()),
                            OperationKind::Call { .. } => None,
                        };
                        cache.store_if_admitted(
                            key.clone(),
                            output.payload.clone(),
                            &WriteContext {
                                method,
                                status: output.status,
                                cache_control: output.cache_control.as_deref(),
                            },
                        );
                    }

                    let record = AttemptRecord {
                        number: attempt,
                        started_at: attempt_started_wall,
                        duration,
                        outcome: AttemptOutcome::Success,
                        payload: Some(output.payload.clone()),
                        error: None,
                        verdict,
                        from_cache: false,
                        synthetic,
                    };
                    if op.log_all_successes {
                        if let Some(handler) = &op.on_success {
                            handler(&record, &op.context);
                        }
                    }
                    records.push(record);

                    last_invoked_outcome = Some(true);
                    if per_attempt_recording {
                        self.record_breaker(&effective, true);
                    }
                    self.count_attempt("success");

                    final_payload = Some(output.payload);
                    final_error = None;
                    if !effective.perform_all_attempts {
                        break;
                    }
                }
                Err(error) => {
                    let error = error.with_context(op.context.clone());
                    records.push(self.failure_record(
                        attempt,
                        attempt_started_wall,
                        duration,
                        error.clone(),
                        synthetic,
                    ));
                    self.handle_failure(op, &error, effective.max_serializable_chars);
                    last_invoked_outcome = Some(false);
                    if per_attempt_recording {
                        self.record_breaker(&effective, false);
                    }
                    self.count_attempt("failure");

                    if error.is_cancelled() {
                        final_error = Some(error);
                        break;
                    }
                    final_error = Some(error.clone());
                    if !error.retryable || attempt == profile.attempts {
                        break;
                    }
                    self.sleep_backoff(attempt, &effective, &opts.token, &mut rng).await;
                    if opts.token.is_cancelled() {
                        final_error = Some(self.cancelled_error(op));
                        break;
                    }
                }
            }
        }

        // A success anywhere in the attempt log wins, even in
        // perform-all-attempts mode where later attempts may have failed.
        if final_payload.is_some() {
            final_error = None;
        }

        if !per_attempt_recording {
            if let Some(success) = last_invoked_outcome {
                self.record_breaker(&profile, success);
            }
        }

        let mut error_suppressed = false;
        if let Some(error) = &final_error {
            if let Some(analyzer) = &op.final_error_analyzer {
                let disposition = analyzer(FinalErrorInput {
                    error: error.clone(),
                    attempts_made: records.len() as u32,
                    context: op.context.clone(),
                    buffer: op.buffer.clone(),
                })
                .await;
                if disposition == FinalDisposition::Suppress {
                    error_suppressed = true;
                    tracing::debug!(
                        operation = %op.id,
                        "final error analyzer suppressed the failure"
                    );
                }
            }
        }

        OperationResult::assemble(
            op.id.clone(),
            op.group.clone(),
            op.context.clone(),
            records,
            final_payload,
            final_error,
            error_suppressed,
            started.elapsed(),
        )
    }

    async fn invoke(
        &self,
        op: &Operation<T>,
        effective: &ResilienceProfile<T>,
        opts: &RunOptions,
    ) -> Result<InvokeOutput<T>, OperationError> {
        // Effective attempt deadline: the shorter of the profile timeout,
        // the request's own timeout and the remaining outer budget.
        let mut attempt_timeout = effective.timeout;
        if let OperationKind::Request(spec) = &op.kind {
            attempt_timeout = match (attempt_timeout, spec.timeout) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        if let Some(deadline) = opts.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(OperationError::timeout("execution budget exhausted"));
            }
            attempt_timeout = Some(attempt_timeout.map_or(remaining, |t| t.min(remaining)));
        }

        let token = &opts.token;
        let invocation = async {
            let invoke = async {
                match &op.kind {
                    OperationKind::Request(spec) => {
                        let transport = self.transport.as_ref().ok_or_else(|| {
                            OperationError::validation(
                                "request operation dispatched without a transport",
                            )
                        })?;
                        let response = transport.send(spec, &op.context).await?;
                        let cache_control =
                            response.header("cache-control").map(ToString::to_string);
                        Ok(InvokeOutput {
                            payload: response.body,
                            status: Some(response.status),
                            cache_control,
                        })
                    }
                    OperationKind::Call { f, .. } => {
                        let payload = f(CallInput {
                            context: op.context.clone(),
                            buffer: op.buffer.clone(),
                        })
                        .await?;
                        Ok(InvokeOutput {
                            payload,
                            status: None,
                            cache_control: None,
                        })
                    }
                }
            };

            let timed = async {
                match attempt_timeout {
                    Some(limit) => match tokio::time::timeout(limit, invoke).await {
                        Ok(result) => result,
                        Err(_) => Err(OperationError::timeout(format!(
                            "attempt exceeded {limit:?}"
                        ))),
                    },
                    None => invoke.await,
                }
            };

            tokio::select! {
                result = timed => result,
                _ = token.cancelled() => Err(self.cancelled_error(op)),
            }
        };

        match &effective.bulkhead {
            Some(bulkhead) => bulkhead.execute_cancellable(invocation, token).await,
            None => invocation.await,
        }
    }

    async fn sleep_backoff(
        &self,
        attempt: u32,
        effective: &ResilienceProfile<T>,
        token: &CancelToken,
        rng: &mut StdRng,
    ) {
        let backoff = compute_backoff(
            attempt,
            effective.strategy,
            effective.wait,
            effective.max_allowed_wait,
            effective.jitter,
            rng,
        );
        tracing::debug!(backoff_ms = backoff.as_millis() as u64, attempt, "retrying after backoff");

        #[cfg(feature = "metrics")]
        histogram!("steadfast_executor_backoff_seconds").record(backoff.as_secs_f64());

        if backoff.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = token.cancelled() => {}
        }
    }

    fn failure_record(
        &self,
        number: u32,
        started_at: SystemTime,
        duration: Duration,
        error: OperationError,
        synthetic: bool,
    ) -> AttemptRecord<T> {
        AttemptRecord {
            number,
            started_at,
            duration,
            outcome: AttemptOutcome::Failure,
            payload: None,
            error: Some(error),
            verdict: Verdict::NotRun,
            from_cache: false,
            synthetic,
        }
    }

    fn handle_failure(&self, op: &Operation<T>, error: &OperationError, max_chars: usize) {
        tracing::debug!(
            operation = %op.id,
            kind = %error.kind,
            message = %clip_for_log(&error.message, max_chars),
            "attempt failed"
        );
        if op.log_all_errors {
            if let Some(handler) = &op.on_error {
                handler(error, &op.context);
            }
        }
    }

    fn record_breaker(&self, effective: &ResilienceProfile<T>, success: bool) {
        if let Some(breaker) = &effective.circuit_breaker {
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    fn cancelled_error(&self, op: &Operation<T>) -> OperationError {
        OperationError::cancelled(format!("Cancelled: operation '{}'", op.id))
            .with_context(op.context.clone())
    }

    #[allow(unused_variables)]
    fn count_attempt(&self, outcome: &'static str) {
        #[cfg(feature = "metrics")]
        counter!("steadfast_executor_attempts_total", "outcome" => outcome).increment(1);
    }
}
