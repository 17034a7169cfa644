//! Execution pipeline: a bounded-concurrency dispatcher that runs at most one
//! cycle per object at a time.
//!
//! A single dispatcher task owns all scheduling state (ready queue, in-flight map
//! with rerun flags, delay queue), so none of it needs locking. Workers only run
//! cycles and report a [`CycleOutcome`] back.

#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rustc_hash::FxHashMap;
use stagehand_core::{
    Delta, DeltaKind, EngineConfig, EventSink, Evaluator, GroupKind, ManagedResource, ObjectKey, ResourceClient,
    RuleError, Selector,
};
use stagehand_resolver::{selector_matches, RuleStore};
use stagehand_schedule::DelayQueue;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod cycle;
mod queue;

pub use cycle::{backoff, CycleError, CycleOutcome};
pub use queue::Coalescer;

/// Why a cycle runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Watch notification, explicit submit, conflict restart or immediate rerun.
    Changed,
    /// A parked stage came due; it is re-validated before applying.
    Fired { stage: String },
}

impl Trigger {
    /// Queue merge rule: a due stage is kept over a plain change, since its cycle
    /// falls back to a fresh resolution anyway.
    fn merge(existing: &mut Trigger, new: Trigger) {
        if matches!(new, Trigger::Fired { .. }) {
            *existing = new;
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub kind: GroupKind,
    pub parallelism: usize,
    pub queue_cap: usize,
    pub max_conflict_retries: u32,
    pub max_transient_retries: u32,
    pub request_timeout: Duration,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    /// Objects outside this selector are never touched.
    pub scope: Selector,
}

impl PipelineConfig {
    pub fn new(kind: GroupKind) -> Self { Self::from_engine(&EngineConfig::default(), kind, Selector::default()) }

    pub fn from_engine(cfg: &EngineConfig, kind: GroupKind, scope: Selector) -> Self {
        Self {
            parallelism: cfg.parallelism_for(&kind).max(1),
            kind,
            queue_cap: cfg.queue_cap,
            max_conflict_retries: cfg.max_conflict_retries,
            max_transient_retries: cfg.max_transient_retries,
            request_timeout: cfg.request_timeout,
            retry_initial_delay: cfg.retry_initial_delay,
            retry_max_delay: cfg.retry_max_delay,
            scope,
        }
    }

    /// Parse the engine's manage selector into a scope.
    pub fn scope_from(cfg: &EngineConfig) -> Result<Selector, RuleError> {
        match cfg.manage_selector.as_deref() {
            Some(s) => Selector::from_label_selector(s),
            None => Ok(Selector::default()),
        }
    }
}

/// Collaborators shared by every cycle.
#[derive(Clone)]
pub struct PipelineDeps {
    pub rules: Arc<RuleStore>,
    pub client: Arc<dyn ResourceClient>,
    pub events: Arc<dyn EventSink>,
    pub evaluator: Arc<dyn Evaluator>,
}

/// Counters readable while the pipeline runs.
#[derive(Debug, Default)]
pub struct PipelineStats {
    cycles: AtomicU64,
    applied: AtomicU64,
    conflicts: AtomicU64,
    dropped: AtomicU64,
    queue_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub applied: u64,
    pub conflicts: u64,
    pub dropped: u64,
    pub queue_dropped: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_cycle(&self) { self.cycles.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn record_applied(&self) { self.applied.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn record_conflict(&self) { self.conflicts.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn record_dropped(&self) { self.dropped.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn record_queue_dropped(&self) { self.queue_dropped.fetch_add(1, Ordering::Relaxed); }
}

pub(crate) struct Shared {
    pub(crate) config: PipelineConfig,
    pub(crate) deps: PipelineDeps,
    pub(crate) stats: Arc<PipelineStats>,
}

enum Command {
    Submit(ObjectKey),
    Observe(Delta),
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
#[error("pipeline stopped")]
pub struct PipelineClosed;

/// Cheap, cloneable entry point into a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    kind: GroupKind,
    tx: mpsc::Sender<Command>,
    stats: Arc<PipelineStats>,
}

impl PipelineHandle {
    pub fn kind(&self) -> &GroupKind { &self.kind }

    /// Request a resolution for `key`.
    pub async fn submit(&self, key: ObjectKey) -> Result<(), PipelineClosed> {
        self.tx.send(Command::Submit(key)).await.map_err(|_| PipelineClosed)
    }

    /// Feed a watch notification. Deletions cancel pending work.
    pub async fn observe(&self, delta: Delta) -> Result<(), PipelineClosed> {
        self.tx.send(Command::Observe(delta)).await.map_err(|_| PipelineClosed)
    }

    pub fn stats(&self) -> StatsSnapshot { self.stats.snapshot() }
}

pub struct Pipeline {
    shared: Arc<Shared>,
    rx: mpsc::Receiver<Command>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, deps: PipelineDeps) -> (Self, PipelineHandle) {
        let (tx, rx) = mpsc::channel(config.queue_cap.clamp(16, 8192));
        let stats = Arc::new(PipelineStats::default());
        let handle = PipelineHandle { kind: config.kind.clone(), tx, stats: Arc::clone(&stats) };
        (Self { shared: Arc::new(Shared { config, deps, stats }), rx }, handle)
    }

    /// Spawn [`Pipeline::run`] on the current runtime.
    pub fn spawn(
        config: PipelineConfig,
        deps: PipelineDeps,
        shutdown: CancellationToken,
    ) -> (PipelineHandle, tokio::task::JoinHandle<StatsSnapshot>) {
        let (pipeline, handle) = Self::new(config, deps);
        (handle, tokio::spawn(pipeline.run(shutdown)))
    }

    /// Dispatch until `shutdown` fires or every handle is dropped. In-flight cycles
    /// are awaited; queued and parked work is discarded.
    pub async fn run(mut self, shutdown: CancellationToken) -> StatsSnapshot {
        let kind = self.shared.config.kind.to_string();
        let parallelism = self.shared.config.parallelism.max(1);
        let mut d = Dispatcher {
            shared: Arc::clone(&self.shared),
            ready: Coalescer::with_capacity(self.shared.config.queue_cap),
            inflight: FxHashMap::default(),
            delayed: DelayQueue::new(),
            workers: JoinSet::new(),
            kind: kind.clone(),
        };
        info!(kind = %kind, parallelism, "pipeline started");
        let mut open = true;
        loop {
            d.fill(parallelism);
            d.publish_gauges();
            if !open && d.workers.is_empty() && d.ready.is_empty() && d.delayed.is_empty() {
                break;
            }
            let deadline = d.delayed.next_deadline();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = d.workers.join_next(), if !d.workers.is_empty() => match joined {
                    Ok((key, outcome)) => d.finish(key, outcome),
                    Err(e) => warn!(kind = %kind, error = %e, "pipeline worker aborted"),
                },
                cmd = self.rx.recv(), if open => match cmd {
                    Some(Command::Submit(key)) => d.enqueue(key, Trigger::Changed),
                    Some(Command::Observe(delta)) => d.observe(delta),
                    None => {
                        debug!(kind = %kind, "all handles dropped; draining");
                        open = false;
                        d.delayed.clear();
                    }
                },
                _ = sleep_until(deadline), if deadline.is_some() => {
                    for (key, stage) in d.delayed.pop_due(tokio::time::Instant::now()) {
                        d.enqueue(key, Trigger::Fired { stage });
                    }
                }
            }
        }
        let parked = d.delayed.len() + d.ready.len();
        d.delayed.clear();
        d.ready.clear();
        while let Some(joined) = d.workers.join_next().await {
            if let Ok((key, outcome)) = joined {
                debug!(key = %key, ?outcome, "cycle finished during shutdown");
            }
        }
        d.inflight.clear();
        d.publish_gauges();
        info!(kind = %kind, discarded = parked, "pipeline stopped");
        self.shared.stats.snapshot()
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

struct Dispatcher {
    shared: Arc<Shared>,
    ready: Coalescer<ObjectKey, Trigger>,
    /// Keys with a running cycle, plus the trigger to rerun with once it ends.
    inflight: FxHashMap<ObjectKey, Option<Trigger>>,
    delayed: DelayQueue<ObjectKey, String>,
    workers: JoinSet<(ObjectKey, CycleOutcome)>,
    kind: String,
}

impl Dispatcher {
    fn enqueue(&mut self, key: ObjectKey, trigger: Trigger) {
        if let Some(rerun) = self.inflight.get_mut(&key) {
            match rerun {
                Some(existing) => Trigger::merge(existing, trigger),
                None => *rerun = Some(trigger),
            }
            return;
        }
        if let Some(evicted) = self.ready.push_with(key, trigger, Trigger::merge) {
            warn!(key = %evicted, "ready queue full; dropped oldest");
            self.shared.stats.record_queue_dropped();
            metrics::counter!("pipeline_queue_dropped_total", 1u64);
        }
    }

    fn observe(&mut self, delta: Delta) {
        if delta.key.group_kind() != self.shared.config.kind {
            return;
        }
        match delta.kind {
            DeltaKind::Deleted => self.forget(&delta.key),
            DeltaKind::Applied => {
                let scope = &self.shared.config.scope;
                if !scope.is_empty() {
                    let in_scope = ManagedResource::from_raw(delta.raw)
                        .map(|r| selector_matches(scope, &r, self.shared.deps.evaluator.as_ref()))
                        .unwrap_or(false);
                    if !in_scope {
                        self.forget(&delta.key);
                        return;
                    }
                }
                self.enqueue(delta.key, Trigger::Changed);
            }
        }
    }

    fn forget(&mut self, key: &ObjectKey) {
        if self.delayed.cancel(key).is_some() {
            debug!(key = %key, "pending stage cancelled");
        }
        self.ready.remove(key);
        if let Some(rerun) = self.inflight.get_mut(key) {
            *rerun = None;
        }
    }

    fn fill(&mut self, parallelism: usize) {
        while self.workers.len() < parallelism {
            let Some((key, trigger)) = self.ready.pop_front() else { break };
            let pending = match trigger {
                Trigger::Fired { .. } => None,
                Trigger::Changed => self.delayed.get(&key).map(|(_, s)| s.clone()),
            };
            self.inflight.insert(key.clone(), None);
            self.shared.stats.record_cycle();
            let shared = Arc::clone(&self.shared);
            self.workers.spawn(async move {
                let stats = Arc::clone(&shared.stats);
                let outcome = AssertUnwindSafe(cycle::run_cycle(shared, key.clone(), trigger, pending))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!(key = %key, "cycle panicked");
                        stats.record_dropped();
                        metrics::counter!("stage_dropped_total", 1u64, "reason" => "panic");
                        CycleOutcome::Dropped { reason: "panic" }
                    });
                (key, outcome)
            });
        }
    }

    fn finish(&mut self, key: ObjectKey, outcome: CycleOutcome) {
        let mut rerun = self.inflight.remove(&key).flatten();
        match &outcome {
            CycleOutcome::KeepPending => {}
            CycleOutcome::Scheduled { stage, at } => {
                self.delayed.schedule(key.clone(), *at, stage.clone());
            }
            other => {
                self.delayed.cancel(&key);
                if let CycleOutcome::Applied { immediate: true, .. } = other {
                    rerun.get_or_insert(Trigger::Changed);
                }
            }
        }
        if matches!(outcome, CycleOutcome::Gone) {
            rerun = None;
        }
        if !matches!(outcome, CycleOutcome::KeepPending) {
            // a stage that fired mid-cycle was superseded by this cycle's decision
            if let Some(Trigger::Fired { .. }) = rerun {
                rerun = Some(Trigger::Changed);
            }
        }
        if let Some(trigger) = rerun {
            self.enqueue(key, trigger);
        }
    }

    fn publish_gauges(&self) {
        metrics::gauge!("pipeline_inflight", self.workers.len() as f64, "kind" => self.kind.clone());
        metrics::gauge!("pipeline_pending", self.delayed.len() as f64, "kind" => self.kind.clone());
    }
}
