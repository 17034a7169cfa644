//! One processing cycle for one object: fetch, resolve, schedule or apply.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use stagehand_apply::{apply_plan, plan, with_timeout, ApplyError, PlanError};
use stagehand_core::{ClientError, ManagedResource, ObjectKey, Stage};
use stagehand_resolver::selector_matches;
use stagehand_schedule::compute_delay;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{Shared, Trigger};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CycleError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

impl CycleError {
    pub fn client_error(&self) -> Option<&ClientError> {
        match self {
            CycleError::Client(e) => Some(e),
            CycleError::Apply(e) => Some(&e.source),
            CycleError::Plan(_) => None,
        }
    }

    pub fn is_retryable(&self) -> bool { self.client_error().map(|e| e.is_retryable()).unwrap_or(false) }

    fn is_conflict(&self) -> bool { matches!(self.client_error(), Some(ClientError::Conflict(_))) }

    fn is_transient(&self) -> bool { self.client_error().map(|e| e.is_transient()).unwrap_or(false) }

    fn is_not_found(&self) -> bool { matches!(self.client_error(), Some(ClientError::NotFound(_))) }
}

/// What a cycle decided; the dispatcher updates its pending state from this.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// A delayed stage was parked until `at`.
    Scheduled { stage: String, at: Instant },
    /// The re-resolved stage equals the pending one; its fire time stands.
    KeepPending,
    Applied { stage: String, immediate: bool },
    /// Nothing matches (or the object left the management scope).
    Idle,
    /// The object no longer exists.
    Gone,
    Dropped { reason: &'static str },
}

/// Run one cycle with conflict and transient-error retries.
pub(crate) async fn run_cycle(
    shared: Arc<Shared>,
    key: ObjectKey,
    trigger: Trigger,
    pending: Option<String>,
) -> CycleOutcome {
    metrics::counter!("stage_cycles_total", 1u64);
    let cfg = &shared.config;
    let mut conflicts = 0u32;
    let mut transient = 0u32;
    loop {
        let err = match attempt(&shared, &key, &trigger, pending.as_deref()).await {
            Ok(outcome) => return outcome,
            Err(e) => e,
        };
        if err.is_not_found() {
            debug!(key = %key, "object gone");
            return CycleOutcome::Gone;
        }
        if err.is_conflict() {
            conflicts += 1;
            metrics::counter!("stage_conflicts_total", 1u64);
            if conflicts > cfg.max_conflict_retries {
                warn!(key = %key, conflicts, error = %err, "giving up after repeated conflicts");
                shared.stats.record_dropped();
                metrics::counter!("stage_dropped_total", 1u64, "reason" => "conflict");
                return CycleOutcome::Dropped { reason: "conflict" };
            }
            debug!(key = %key, attempt = conflicts, error = %err, "conflict; retrying from a fresh read");
            shared.stats.record_conflict();
            continue;
        }
        if err.is_transient() {
            transient += 1;
            if transient > cfg.max_transient_retries {
                warn!(key = %key, attempts = transient, error = %err, "giving up after transient failures");
                shared.stats.record_dropped();
                metrics::counter!("stage_dropped_total", 1u64, "reason" => "transient");
                return CycleOutcome::Dropped { reason: "transient" };
            }
            let delay = backoff(transient, cfg.retry_initial_delay, cfg.retry_max_delay);
            warn!(key = %key, attempt = transient, error = %err, delay_ms = delay.as_millis() as u64, "transient failure, retrying");
            tokio::time::sleep(delay).await;
            continue;
        }
        let reason = match &err {
            CycleError::Plan(_) => "eval",
            _ => err.client_error().map(|e| e.class()).unwrap_or("other"),
        };
        warn!(key = %key, error = %err, reason, "cycle failed");
        shared.stats.record_dropped();
        metrics::counter!("stage_dropped_total", 1u64, "reason" => reason);
        return CycleOutcome::Dropped { reason };
    }
}

/// Exponential backoff with 0.5x..1.5x jitter, capped at `max`.
pub fn backoff(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exp = initial.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1).min(30) as i32);
    let capped = exp.min(max.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(capped * jitter)
}

enum Decision {
    Apply(Arc<Stage>),
    Park(Arc<Stage>, Duration),
    KeepPending,
    Idle,
}

async fn attempt(
    shared: &Shared,
    key: &ObjectKey,
    trigger: &Trigger,
    pending: Option<&str>,
) -> Result<CycleOutcome, CycleError> {
    let cfg = &shared.config;
    let res = with_timeout(cfg.request_timeout, shared.deps.client.get(key)).await?;
    // Matching stages whose plan writes nothing are set aside so another match can run.
    let mut excluded: Vec<String> = Vec::new();
    let (stage, plan) = loop {
        let stage = match decide(shared, &res, trigger, pending, &excluded) {
            Decision::Idle => return Ok(CycleOutcome::Idle),
            Decision::KeepPending => return Ok(CycleOutcome::KeepPending),
            Decision::Park(stage, delay) => {
                debug!(key = %key, stage = %stage.name, delay_ms = delay.as_millis() as u64, "stage parked");
                return Ok(CycleOutcome::Scheduled { stage: stage.name.clone(), at: Instant::now() + delay });
            }
            Decision::Apply(stage) => stage,
        };
        let plan = plan(&res, &stage, shared.deps.evaluator.as_ref(), Utc::now())?;
        if plan.is_empty() {
            debug!(key = %key, stage = %stage.name, "stage changes nothing");
            excluded.push(stage.name.clone());
            continue;
        }
        break (stage, plan);
    };

    let t0 = std::time::Instant::now();
    let applied =
        apply_plan(&plan, shared.deps.client.as_ref(), shared.deps.events.as_ref(), cfg.request_timeout).await?;
    metrics::histogram!("stage_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
    metrics::counter!("stage_applied_total", 1u64, "stage" => stage.name.clone());
    shared.stats.record_applied();
    info!(key = %key, stage = %stage.name, writes = applied.writes, deleted = applied.deleted, "stage applied");
    let immediate = stage.next.immediate_next_stage && applied.writes > 0 && !applied.deleted;
    Ok(CycleOutcome::Applied { stage: stage.name.clone(), immediate })
}

fn decide(
    shared: &Shared,
    res: &ManagedResource,
    trigger: &Trigger,
    pending: Option<&str>,
    excluded: &[String],
) -> Decision {
    let ev = shared.deps.evaluator.as_ref();
    if !shared.config.scope.is_empty() && !selector_matches(&shared.config.scope, res, ev) {
        debug!(key = %res.key, "object outside management scope");
        return Decision::Idle;
    }
    let index = shared.deps.rules.current();
    if let Trigger::Fired { stage } = trigger {
        if !excluded.contains(stage) {
            match index.stage(&res.key.group_kind(), stage) {
                Some(s) if selector_matches(&s.selector, res, ev) => return Decision::Apply(s),
                _ => {
                    debug!(key = %res.key, stage = %stage, "fired stage no longer matches; resolving again");
                    metrics::counter!("stage_dropped_total", 1u64, "reason" => "stale");
                }
            }
        }
    }
    let mut rng = rand::thread_rng();
    let Some(stage) = index.resolve_excluding(res, ev, excluded, &mut rng) else { return Decision::Idle };
    if stage.delay.is_none() {
        return Decision::Apply(stage);
    }
    if pending == Some(stage.name.as_str()) {
        return Decision::KeepPending;
    }
    let delay = compute_delay(res, &stage, Utc::now(), ev, &mut rng);
    if delay.is_zero() { Decision::Apply(stage) } else { Decision::Park(stage, delay) }
}
