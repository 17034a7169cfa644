//! Stage resolver: rule index keyed by (group, kind), selector matching and a
//! weighted random pick among matching stages.
//!
//! The index is immutable once built; [`RuleStore`] swaps whole indexes
//! atomically so readers never lock.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::Rng;
use rustc_hash::FxHashMap;
use serde::Serialize;
use stagehand_core::{
    EvalContext, Evaluator, GroupKind, Json, ManagedResource, RuleError, RuleSource, Selector, SelectorOperator,
    Stage,
};
use stagehand_expr::to_plain_string;
use tracing::{debug, info};

mod source;

pub use source::{parse_stages, FileRuleSource};

/// Immutable rule index.
#[derive(Debug, Default)]
pub struct StageIndex {
    by_kind: FxHashMap<GroupKind, Vec<Arc<Stage>>>,
    total: usize,
}

/// One row of [`StageIndex::explain`].
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub stage: String,
    pub matched: bool,
    pub weight: u64,
}

impl StageIndex {
    /// Build from validated stages. Stage names must be unique per kind; load order
    /// is kept within each kind.
    pub fn build(stages: Vec<Stage>) -> Result<Self, RuleError> {
        let mut by_kind: FxHashMap<GroupKind, Vec<Arc<Stage>>> = FxHashMap::default();
        let total = stages.len();
        for stage in stages {
            stage.validate()?;
            let bucket = by_kind.entry(stage.group_kind()).or_default();
            if bucket.iter().any(|s| s.name == stage.name) {
                return Err(RuleError::Invalid {
                    stage: stage.name.clone(),
                    message: format!("duplicate stage name for {}", stage.group_kind()),
                });
            }
            bucket.push(Arc::new(stage));
        }
        Ok(Self { by_kind, total })
    }

    pub fn len(&self) -> usize { self.total }

    pub fn is_empty(&self) -> bool { self.total == 0 }

    /// Managed kinds, sorted for stable output.
    pub fn kinds(&self) -> Vec<GroupKind> {
        let mut out: Vec<_> = self.by_kind.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn candidates(&self, gk: &GroupKind) -> &[Arc<Stage>] {
        self.by_kind.get(gk).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn stage(&self, gk: &GroupKind, name: &str) -> Option<Arc<Stage>> {
        self.candidates(gk).iter().find(|s| s.name == name).cloned()
    }

    /// Stages whose selector holds for `res`, in load order.
    pub fn matches(&self, res: &ManagedResource, ev: &dyn Evaluator) -> Vec<Arc<Stage>> {
        let ctx = EvalContext::new(&res.raw);
        self.candidates(&res.key.group_kind())
            .iter()
            .filter(|s| selector_matches_in(&s.selector, res, ev, &ctx))
            .cloned()
            .collect()
    }

    pub fn resolve(&self, res: &ManagedResource, ev: &dyn Evaluator) -> Option<Arc<Stage>> {
        self.resolve_with(res, ev, &mut rand::thread_rng())
    }

    /// Resolve using a caller-supplied RNG.
    pub fn resolve_with<R: Rng + ?Sized>(
        &self,
        res: &ManagedResource,
        ev: &dyn Evaluator,
        rng: &mut R,
    ) -> Option<Arc<Stage>> {
        self.resolve_excluding(res, ev, &[], rng)
    }

    /// Like [`StageIndex::resolve_with`], leaving out the stages named in `excluded`.
    pub fn resolve_excluding<R: Rng + ?Sized>(
        &self,
        res: &ManagedResource,
        ev: &dyn Evaluator,
        excluded: &[String],
        rng: &mut R,
    ) -> Option<Arc<Stage>> {
        let mut matched = self.matches(res, ev);
        matched.retain(|s| !excluded.contains(&s.name));
        match matched.len() {
            0 => None,
            1 => matched.into_iter().next(),
            _ => {
                let weighted: Vec<(Arc<Stage>, u64)> =
                    matched.into_iter().map(|s| { let w = stage_weight(&s, res, ev); (s, w) }).collect();
                pick_weighted(&weighted, rng).cloned()
            }
        }
    }

    /// Every candidate for the resource's kind with its verdict and resolved weight.
    pub fn explain(&self, res: &ManagedResource, ev: &dyn Evaluator) -> Vec<Candidate> {
        let ctx = EvalContext::new(&res.raw);
        self.candidates(&res.key.group_kind())
            .iter()
            .map(|s| Candidate {
                stage: s.name.clone(),
                matched: selector_matches_in(&s.selector, res, ev, &ctx),
                weight: stage_weight(s, res, ev),
            })
            .collect()
    }
}

/// Selector verdict for a resource. An empty selector matches everything.
pub fn selector_matches(sel: &Selector, res: &ManagedResource, ev: &dyn Evaluator) -> bool {
    let ctx = EvalContext::new(&res.raw);
    selector_matches_in(sel, res, ev, &ctx)
}

fn selector_matches_in(sel: &Selector, res: &ManagedResource, ev: &dyn Evaluator, ctx: &EvalContext<'_>) -> bool {
    if !sel.match_labels.iter().all(|(k, v)| res.labels.get(k) == Some(v)) {
        return false;
    }
    if !sel.match_annotations.iter().all(|(k, v)| res.annotations.get(k) == Some(v)) {
        return false;
    }
    sel.match_expressions.iter().all(|req| {
        let value = match ev.evaluate(&req.key, ctx) {
            Ok(v) => v,
            Err(e) => {
                debug!(key = %res.key, expr = %req.key, error = %e, "selector key failed to evaluate; treating as null");
                Json::Null
            }
        };
        let present = !value.is_null();
        match req.operator {
            SelectorOperator::Exists => present,
            SelectorOperator::DoesNotExist => !present,
            SelectorOperator::In => present && req.values.contains(&to_plain_string(&value)),
            SelectorOperator::NotIn => !present || !req.values.contains(&to_plain_string(&value)),
        }
    })
}

/// Literal weight, or the `weightFrom` expression result when it yields a
/// non-negative integer.
pub fn stage_weight(stage: &Stage, res: &ManagedResource, ev: &dyn Evaluator) -> u64 {
    let literal = stage.weight as u64;
    let Some(from) = &stage.weight_from else { return literal };
    let ctx = EvalContext::new(&res.raw);
    match ev.evaluate(&from.expression_from, &ctx) {
        Ok(Json::Number(n)) => n.as_u64().unwrap_or(literal),
        Ok(Json::String(s)) => s.trim().parse::<u64>().unwrap_or(literal),
        Ok(_) => literal,
        Err(e) => {
            debug!(stage = %stage.name, error = %e, "weightFrom failed; using literal weight");
            literal
        }
    }
}

/// Weighted pick. A zero total falls back to a uniform pick.
pub fn pick_weighted<'a, T, R: Rng + ?Sized>(items: &'a [(T, u64)], rng: &mut R) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    let total: u64 = items.iter().map(|(_, w)| *w).fold(0u64, u64::saturating_add);
    if total == 0 {
        return items.get(rng.gen_range(0..items.len())).map(|(t, _)| t);
    }
    let mut roll = rng.gen_range(0..total);
    for (item, w) in items {
        if roll < *w {
            return Some(item);
        }
        roll -= *w;
    }
    items.last().map(|(t, _)| t)
}

/// Atomically swappable holder of the current [`StageIndex`].
pub struct RuleStore {
    current: ArcSwap<StageIndex>,
}

impl RuleStore {
    pub fn new(index: StageIndex) -> Self {
        metrics::gauge!("rules_loaded", index.len() as f64);
        Self { current: ArcSwap::from_pointee(index) }
    }

    pub fn current(&self) -> Arc<StageIndex> { self.current.load_full() }

    pub fn swap(&self, index: StageIndex) {
        metrics::gauge!("rules_loaded", index.len() as f64);
        self.current.store(Arc::new(index));
    }

    /// Load from `source` and swap on success; on failure the old index stays live.
    pub async fn reload(&self, source: &dyn RuleSource) -> Result<usize, RuleError> {
        let stages = source.load().await?;
        let index = StageIndex::build(stages)?;
        let n = index.len();
        info!(source = %source.describe(), stages = n, kinds = index.kinds().len(), "rules loaded");
        self.swap(index);
        Ok(n)
    }
}
