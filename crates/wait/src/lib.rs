//! Pilot wait: block until every resource in a set passes its readiness check.
//!
//! Each poll round evaluates a snapshot of the pending set concurrently and
//! commits removals only once the whole round has finished. Check errors count
//! as "not ready yet"; only the overall deadline or cancellation ends a wait
//! early.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::{counter, histogram};
use pilot_core::{CheckContext, PendingResource, PilotError, ResourceDescriptor, Result, WaitRequest};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a wait that converged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitReport {
    /// Poll rounds run, including the one that emptied the set.
    pub rounds: u64,
    pub elapsed: Duration,
}

enum Verdict {
    Ready,
    NotReady,
    Errored(String),
}

struct Entry<H> {
    res: Arc<ResourceDescriptor<H>>,
    last_error: Option<String>,
}

/// Polls readiness checks against a shared backend handle `H`.
pub struct ReadinessPoller<H> {
    backend: H,
}

impl<H> ReadinessPoller<H>
where
    H: Clone + Send + Sync + 'static,
{
    pub fn new(backend: H) -> Self { Self { backend } }

    pub fn backend(&self) -> &H { &self.backend }

    /// Wait without an external cancellation source.
    pub async fn wait(&self, req: WaitRequest<H>) -> Result<WaitReport> {
        self.wait_with_cancel(req, &CancellationToken::new()).await
    }

    pub async fn wait_with_cancel(&self, req: WaitRequest<H>, cancel: &CancellationToken) -> Result<WaitReport> {
        req.validate()?;
        let started = Instant::now();
        let deadline = add_or_far(started, req.timeout);
        let mut pending = dedup(req.resources);
        let mut round = 0u64;
        info!(resources = pending.len(), interval = ?req.poll_interval, timeout = ?req.timeout, "waiting for resources");

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(round));
            }
            round += 1;
            let round_started = Instant::now();
            // A round started at the deadline still gets one interval to answer.
            let round_deadline = deadline.max(add_or_far(round_started, req.poll_interval));
            counter!("wait_rounds_total", 1u64);
            debug!(itr = round, pending = pending.len(), "starting new wait poll event");

            let verdicts = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(round)),
                v = self.evaluate(round, &pending, cancel) => v,
                _ = sleep_until(round_deadline) => {
                    warn!(itr = round, "readiness round did not finish before the deadline");
                    return Err(timed_out(started, &pending));
                }
            };
            pending = commit(pending, verdicts);

            if pending.is_empty() {
                let elapsed = started.elapsed();
                histogram!("wait_duration_ms", elapsed.as_secs_f64() * 1000.0);
                info!(rounds = round, elapsed = ?elapsed, "all resources ready");
                return Ok(WaitReport { rounds: round, elapsed });
            }
            if Instant::now() >= deadline {
                return Err(timed_out(started, &pending));
            }

            let next = add_or_far(round_started, req.poll_interval).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(round)),
                _ = sleep_until(next) => {}
            }
        }
    }

    async fn evaluate(&self, round: u64, pending: &[Entry<H>], cancel: &CancellationToken) -> Vec<Verdict> {
        let checks = pending.iter().map(|entry| {
            let res = &entry.res;
            let ctx = CheckContext { round, cancel: cancel.clone() };
            let fut = res.check(ctx, self.backend.clone());
            async move {
                debug!(itr = round, name = %res.name, namespace = %res.namespace, "checking resource readiness");
                match fut.await {
                    Ok(true) => {
                        debug!(itr = round, name = %res.name, namespace = %res.namespace, "resource ready");
                        Verdict::Ready
                    }
                    Ok(false) => {
                        debug!(itr = round, name = %res.name, namespace = %res.namespace, "resource not ready");
                        Verdict::NotReady
                    }
                    Err(e) => {
                        counter!("wait_predicate_errors_total", 1u64);
                        debug!(itr = round, name = %res.name, namespace = %res.namespace, error = %e, "resource not ready");
                        Verdict::Errored(format!("{:#}", e))
                    }
                }
            }
        });
        join_all(checks).await
    }
}

/// Roughly 30 years; what tokio uses for "never" as well.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `base + d`, with durations too large for the clock treated as "never".
fn add_or_far(base: Instant, d: Duration) -> Instant {
    base.checked_add(d).unwrap_or_else(|| base + FAR_FUTURE)
}

/// Collapse repeated instances; equal names on distinct instances stay separate.
fn dedup<H>(resources: Vec<Arc<ResourceDescriptor<H>>>) -> Vec<Entry<H>> {
    let mut out: Vec<Entry<H>> = Vec::with_capacity(resources.len());
    for res in resources {
        if !out.iter().any(|e| Arc::ptr_eq(&e.res, &res)) {
            out.push(Entry { res, last_error: None });
        }
    }
    out
}

fn commit<H>(pending: Vec<Entry<H>>, verdicts: Vec<Verdict>) -> Vec<Entry<H>> {
    debug_assert_eq!(pending.len(), verdicts.len());
    pending
        .into_iter()
        .zip(verdicts)
        .filter_map(|(mut entry, verdict)| match verdict {
            Verdict::Ready => None,
            Verdict::NotReady => {
                entry.last_error = None;
                Some(entry)
            }
            Verdict::Errored(msg) => {
                entry.last_error = Some(msg);
                Some(entry)
            }
        })
        .collect()
}

fn timed_out<H>(started: Instant, pending: &[Entry<H>]) -> PilotError {
    let elapsed = started.elapsed();
    warn!(pending = pending.len(), elapsed = ?elapsed, "timed out waiting for resources");
    PilotError::Timeout {
        elapsed,
        pending: pending
            .iter()
            .map(|e| PendingResource {
                namespace: e.res.namespace.clone(),
                name: e.res.name.clone(),
                last_error: e.last_error.clone(),
            })
            .collect(),
    }
}

fn cancelled(round: u64) -> PilotError {
    info!(itr = round, "wait cancelled");
    PilotError::Cancelled
}
