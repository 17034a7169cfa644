//! Stagehand engine façade.
//!
//! Owns the rule store and one pipeline per managed kind, plus the lease loop.
//! Watch feeds push [`Delta`]s in through [`Engine::observe`] or [`Engine::run_feed`];
//! the engine itself never talks to a cluster directly.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashMap;
use stagehand_core::{
    Delta, DeltaKind, EngineConfig, EventSink, Evaluator, GroupKind, LeaseClient, ManagedResource, ObjectKey,
    ResourceClient, RuleError, RuleSource, Selector,
};
use stagehand_expr::PathEvaluator;
use stagehand_lease::{HeartbeatLoop, LeaseConfig, LeaseHandle};
use stagehand_pipeline::{Pipeline, PipelineConfig, PipelineDeps, PipelineHandle, StatsSnapshot};
use stagehand_resolver::{selector_matches, RuleStore, StageIndex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("rules: {0}")]
    Rules(#[from] RuleError),
    #[error("no managed kinds (load rules or pass kinds explicitly)")]
    NoKinds,
    #[error("engine stopped")]
    Stopped,
}

pub type EngineResult<T> = Result<T, EngineError>;

/// External collaborators. `evaluator` defaults to [`PathEvaluator`].
#[derive(Clone)]
pub struct EngineDeps {
    pub client: Arc<dyn ResourceClient>,
    pub events: Arc<dyn EventSink>,
    pub leases: Arc<dyn LeaseClient>,
    pub evaluator: Arc<dyn Evaluator>,
}

impl EngineDeps {
    pub fn new(client: Arc<dyn ResourceClient>, events: Arc<dyn EventSink>, leases: Arc<dyn LeaseClient>) -> Self {
        Self { client, events, leases, evaluator: Arc::new(PathEvaluator::new()) }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }
}

fn node_kind() -> GroupKind { GroupKind::new("", "Node") }

pub struct Engine {
    rules: Arc<RuleStore>,
    source: Arc<dyn RuleSource>,
    evaluator: Arc<dyn Evaluator>,
    scope: Selector,
    pipelines: FxHashMap<GroupKind, PipelineHandle>,
    lease: LeaseHandle,
    shutdown: CancellationToken,
    pipeline_tasks: Vec<(GroupKind, JoinHandle<StatsSnapshot>)>,
    lease_task: JoinHandle<()>,
}

impl Engine {
    /// Load rules from `source`, then start a pipeline for every kind in `kinds`
    /// (or every kind the rules target when `kinds` is empty) and the lease loop.
    pub async fn start(
        cfg: &EngineConfig,
        source: Arc<dyn RuleSource>,
        deps: EngineDeps,
        kinds: Vec<GroupKind>,
    ) -> EngineResult<Self> {
        let t0 = Instant::now();
        let rules = Arc::new(RuleStore::new(StageIndex::default()));
        let loaded = rules.reload(source.as_ref()).await?;
        let scope = PipelineConfig::scope_from(cfg)?;
        let mut kinds = if kinds.is_empty() { rules.current().kinds() } else { kinds };
        kinds.sort();
        kinds.dedup();
        if kinds.is_empty() {
            return Err(EngineError::NoKinds);
        }

        let shutdown = CancellationToken::new();
        let pdeps = PipelineDeps {
            rules: Arc::clone(&rules),
            client: deps.client,
            events: deps.events,
            evaluator: Arc::clone(&deps.evaluator),
        };
        let mut pipelines = FxHashMap::default();
        let mut pipeline_tasks = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let pcfg = PipelineConfig::from_engine(cfg, kind.clone(), scope.clone());
            let (handle, task) = Pipeline::spawn(pcfg, pdeps.clone(), shutdown.child_token());
            pipelines.insert(kind.clone(), handle);
            pipeline_tasks.push((kind, task));
        }
        let (lease, lease_task) =
            HeartbeatLoop::spawn(LeaseConfig::from_engine(cfg), deps.leases, shutdown.child_token());
        info!(
            rules = loaded,
            kinds = pipeline_tasks.len(),
            source = %source.describe(),
            took_ms = %t0.elapsed().as_millis(),
            "engine started"
        );
        Ok(Self {
            rules,
            source,
            evaluator: deps.evaluator,
            scope,
            pipelines,
            lease,
            shutdown,
            pipeline_tasks,
            lease_task,
        })
    }

    /// Kinds with a running pipeline, sorted.
    pub fn kinds(&self) -> Vec<GroupKind> {
        let mut v: Vec<GroupKind> = self.pipelines.keys().cloned().collect();
        v.sort();
        v
    }

    pub fn rules(&self) -> Arc<StageIndex> { self.rules.current() }

    pub fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }

    /// Reload rules from the original source. A failed load keeps the old rules.
    pub async fn reload(&self) -> EngineResult<usize> {
        let t0 = Instant::now();
        match self.rules.reload(self.source.as_ref()).await {
            Ok(n) => {
                let unmanaged: Vec<String> = self
                    .rules
                    .current()
                    .kinds()
                    .into_iter()
                    .filter(|k| !self.pipelines.contains_key(k))
                    .map(|k| k.to_string())
                    .collect();
                if !unmanaged.is_empty() {
                    warn!(kinds = ?unmanaged, "rules target kinds without a pipeline; restart to manage them");
                }
                metrics::counter!("rules_reload_total", 1u64, "result" => "ok");
                info!(rules = n, took_ms = %t0.elapsed().as_millis(), "rules reloaded");
                Ok(n)
            }
            Err(e) => {
                metrics::counter!("rules_reload_total", 1u64, "result" => "error");
                warn!(error = %e, "rule reload failed; keeping previous rules");
                Err(e.into())
            }
        }
    }

    fn in_scope(&self, delta: &Delta) -> bool {
        if self.scope.is_empty() {
            return true;
        }
        match ManagedResource::from_raw(delta.raw.clone()) {
            Ok(res) => selector_matches(&self.scope, &res, self.evaluator.as_ref()),
            Err(_) => false,
        }
    }

    /// Route one watch notification. Node notifications also drive lease tracking.
    pub async fn observe(&self, delta: Delta) -> EngineResult<()> {
        let gk = delta.key.group_kind();
        if gk == node_kind() {
            match delta.kind {
                DeltaKind::Applied if self.in_scope(&delta) => self.lease.track(delta.key.name.clone()),
                _ => self.lease.untrack(delta.key.name.clone()),
            }
        }
        match self.pipelines.get(&gk) {
            Some(p) => p.observe(delta).await.map_err(|_| EngineError::Stopped),
            None => {
                debug!(key = %delta.key, "no pipeline for kind; ignoring");
                Ok(())
            }
        }
    }

    /// Request a resolution of one object outside the watch feed.
    pub async fn submit(&self, key: ObjectKey) -> EngineResult<()> {
        match self.pipelines.get(&key.group_kind()) {
            Some(p) => p.submit(key).await.map_err(|_| EngineError::Stopped),
            None => {
                debug!(key = %key, "no pipeline for kind; ignoring submit");
                Ok(())
            }
        }
    }

    /// Drain `rx` into [`Engine::observe`] until it closes or the engine shuts down.
    pub async fn run_feed(&self, mut rx: mpsc::Receiver<Delta>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(delta) => {
                        if self.observe(delta).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("engine feed ended");
    }

    pub fn stats(&self) -> Vec<(GroupKind, StatsSnapshot)> {
        let mut v: Vec<_> = self.pipelines.iter().map(|(k, p)| (k.clone(), p.stats())).collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        v
    }

    /// Stop admitting work, let in-flight cycles finish and return final counters.
    pub async fn shutdown(self) -> Vec<(GroupKind, StatsSnapshot)> {
        let t0 = Instant::now();
        self.shutdown.cancel();
        drop(self.pipelines);
        let mut out = Vec::with_capacity(self.pipeline_tasks.len());
        for (kind, task) in self.pipeline_tasks {
            match task.await {
                Ok(stats) => out.push((kind, stats)),
                Err(e) => warn!(kind = %kind, error = %e, "pipeline task failed"),
            }
        }
        if let Err(e) = self.lease_task.await {
            warn!(error = %e, "lease task failed");
        }
        info!(took_ms = %t0.elapsed().as_millis(), "engine stopped");
        out
    }
}
