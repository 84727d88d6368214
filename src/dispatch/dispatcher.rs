//! The retrying dispatcher.
//!
//! # Responsibilities
//! - Pick a backend per attempt, skipping failed and open-circuit ones
//! - Keep the in-flight count exact through [`InFlightLease`]
//! - Bound every attempt by the remaining request deadline
//! - Retry on a different backend within the retry budget

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::DispatchConfig;
use crate::dispatch::{DispatchError, Upstream, UpstreamError};
use crate::load_balancer::backend::BackendView;
use crate::load_balancer::context::RequestContext;
use crate::load_balancer::{InFlightLease, PolicyHandle, Registry, SelectError};
use crate::observability::metrics::MetricsSink;
use crate::resilience::circuit_breaker::{BreakerPermit, CircuitBreakers};
use crate::resilience::retries::{RetryBudget, RetryPolicy};
use crate::resilience::timeouts::{within, Deadline};

/// A successful dispatch.
///
/// The backend stays counted as in flight until this value (or its lease) is
/// dropped or [`Routed::release`] is called.
#[derive(Debug)]
pub struct Routed<R> {
    pub response: R,
    pub backend: BackendView,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Latency of the successful attempt.
    pub latency: Duration,
    lease: InFlightLease,
}

impl<R> Routed<R> {
    pub fn release(&self) -> bool {
        self.lease.release()
    }

    pub fn lease(&self) -> &InFlightLease {
        &self.lease
    }

    /// Split into the response and the lease that keeps the backend busy.
    pub fn into_parts(self) -> (R, InFlightLease) {
        (self.response, self.lease)
    }
}

pub struct Dispatcher<U> {
    registry: Arc<Registry>,
    policy: Arc<PolicyHandle>,
    breakers: Arc<CircuitBreakers>,
    metrics: Arc<MetricsSink>,
    retry: RetryPolicy,
    budget: RetryBudget,
    deadline: Duration,
    attempt_timeout: Duration,
    upstream: U,
}

impl<U: Upstream> Dispatcher<U> {
    pub fn new(
        registry: Arc<Registry>,
        policy: Arc<PolicyHandle>,
        breakers: Arc<CircuitBreakers>,
        metrics: Arc<MetricsSink>,
        upstream: U,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            registry,
            policy,
            breakers,
            metrics,
            retry: RetryPolicy::from_config(config),
            budget: RetryBudget::new(config.retry_budget_ratio, config.min_retries),
            deadline: config.deadline(),
            attempt_timeout: config.attempt_timeout(),
            upstream,
        }
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    /// Serve `request`, retrying on other backends until it succeeds, the
    /// attempts or the deadline run out, or no candidate is left.
    pub async fn handle(
        &self,
        request: &U::Request,
        mut ctx: RequestContext,
    ) -> Result<Routed<U::Response>, DispatchError> {
        self.budget.record_request();
        let deadline = *ctx.deadline.get_or_insert_with(|| Deadline::after(self.deadline));

        let mut attempts: u32 = 0;
        let mut last_error: Option<UpstreamError> = None;

        while attempts < self.retry.max_attempts {
            if attempts > 0 {
                if !self.budget.try_spend() {
                    tracing::debug!(attempts, "Retry budget exhausted");
                    break;
                }
                let pause = self.retry.delay_before(attempts + 1).min(deadline.remaining());
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
            if deadline.is_expired() {
                last_error.get_or_insert(UpstreamError::Timeout(self.deadline));
                break;
            }

            ctx.attempt = attempts + 1;
            let (target, lease, permit) = match self.pick(&ctx) {
                Ok(picked) => picked,
                Err(SelectError::NoAvailableBackend) if last_error.is_none() => {
                    return Err(DispatchError::NoAvailableBackend);
                }
                Err(SelectError::NoAvailableBackend) => break,
            };
            attempts += 1;
            self.metrics.record_attempt(&target.id);

            let budget = deadline.attempt_budget(self.attempt_timeout);
            let started = Instant::now();
            let outcome = match within(budget, self.upstream.call(&target, request)).await {
                Ok(result) => result,
                Err(limit) => Err(UpstreamError::Timeout(limit)),
            };
            let latency = started.elapsed();
            // Dropped at the end of this iteration, after the outcome is recorded.
            let _permit = permit;

            match outcome {
                Ok(response) => {
                    self.breakers.record_success(&target.id);
                    self.metrics.record_success(&target.id, latency);
                    tracing::debug!(
                        backend = %target.id,
                        attempt = attempts,
                        latency_ms = latency.as_millis() as u64,
                        "Dispatched"
                    );
                    return Ok(Routed {
                        response,
                        backend: target,
                        attempts,
                        latency,
                        lease,
                    });
                }
                Err(err) => {
                    lease.release();
                    self.breakers.record_failure(&target.id, Instant::now());
                    self.metrics.record_failure(&target.id, latency, err.kind());
                    tracing::warn!(
                        backend = %target.id,
                        attempt = attempts,
                        error = %err,
                        "Upstream attempt failed"
                    );
                    ctx.exclude(target.id.clone());
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(last) => Err(DispatchError::UpstreamUnavailable { attempts, last }),
            None => Err(DispatchError::NoAvailableBackend),
        }
    }

    /// Select a backend, take its in-flight lease and claim its breaker.
    ///
    /// Backends whose breaker rejects, or that left the registry since the
    /// snapshot was taken, are skipped for this attempt only. If the caller
    /// is cancelled while holding a half-open trial, dropping the permit
    /// hands the trial back.
    fn pick(&self, ctx: &RequestContext) -> Result<(BackendView, InFlightLease, BreakerPermit), SelectError> {
        let snapshot = self.registry.snapshot();
        let now = Instant::now();

        let mut view = ctx.clone();
        for backend in snapshot.backends() {
            if !self.breakers.permits(&backend.id, now) {
                view.exclude(backend.id.clone());
            }
        }

        loop {
            let target = self.policy.select(&snapshot, &view)?;
            let lease = match self.registry.acquire(&target.id) {
                Ok(lease) => lease,
                Err(_) => {
                    view.exclude(target.id.clone());
                    continue;
                }
            };
            match self.breakers.try_acquire(&target.id, now) {
                Some(permit) => return Ok((target, lease, permit)),
                None => {
                    drop(lease);
                    view.exclude(target.id.clone());
                }
            }
        }
    }
}
