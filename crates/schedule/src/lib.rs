//! Delay scheduler: fire-time computation and a time-ordered pending queue.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use rustc_hash::FxHashMap;
use stagehand_core::{EvalContext, Evaluator, ExpressionFrom, Json, ManagedResource, Stage};
use stagehand_expr::delay_from_value;
use tokio::time::Instant;
use tracing::debug;

/// Delay before `stage` fires for `res`, planned at `planned_at`.
///
/// The base comes from `durationFrom` when it evaluates to a duration or time,
/// otherwise from `durationMilliseconds`. A jitter bound above the base widens the
/// delay to a uniform pick in `[base, jitter]`.
pub fn compute_delay<R: Rng + ?Sized>(
    res: &ManagedResource,
    stage: &Stage,
    planned_at: DateTime<Utc>,
    ev: &dyn Evaluator,
    rng: &mut R,
) -> Duration {
    let Some(delay) = &stage.delay else { return Duration::ZERO };
    let ctx = EvalContext::new(&res.raw)
        .with_var("now", Json::String(planned_at.to_rfc3339_opts(SecondsFormat::Secs, true)))
        .with_var("stage", Json::String(stage.name.clone()));
    let base = part(&stage.name, delay.duration_from.as_ref(), delay.duration_milliseconds, planned_at, ev, &ctx)
        .unwrap_or(Duration::ZERO);
    let jitter = part(
        &stage.name,
        delay.jitter_duration_from.as_ref(),
        delay.jitter_duration_milliseconds,
        planned_at,
        ev,
        &ctx,
    );
    match jitter {
        Some(j) if j > base => {
            let lo = base.as_millis() as u64;
            let hi = j.as_millis() as u64;
            Duration::from_millis(rng.gen_range(lo..=hi))
        }
        _ => base,
    }
}

fn part(
    stage: &str,
    from: Option<&ExpressionFrom>,
    literal_ms: Option<i64>,
    planned_at: DateTime<Utc>,
    ev: &dyn Evaluator,
    ctx: &EvalContext<'_>,
) -> Option<Duration> {
    let literal = literal_ms.map(|ms| Duration::from_millis(ms.max(0) as u64));
    let Some(from) = from else { return literal };
    match ev.evaluate(&from.expression_from, ctx) {
        Ok(v) => match delay_from_value(&v) {
            Some(d) => Some(d.resolve(planned_at)),
            None => {
                if !v.is_null() {
                    debug!(stage, expr = %from.expression_from, value = %v, "delay expression is not a duration or time");
                }
                literal
            }
        },
        Err(e) => {
            debug!(stage, expr = %from.expression_from, error = %e, "delay expression failed; using literal");
            literal
        }
    }
}

struct Entry<K> {
    at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Entry<K> {
    fn eq(&self, other: &Self) -> bool { self.at == other.at && self.seq == other.seq }
}

impl<K> Eq for Entry<K> {}

impl<K> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl<K> Ord for Entry<K> {
    // reversed: BinaryHeap is a max-heap
    fn cmp(&self, other: &Self) -> Ordering { other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq)) }
}

/// Min-heap of pending items, at most one live item per key.
///
/// Scheduling an existing key supersedes the previous item; stale heap entries are
/// skipped lazily using per-key sequence numbers.
pub struct DelayQueue<K, V> {
    heap: BinaryHeap<Entry<K>>,
    live: FxHashMap<K, (u64, Instant, V)>,
    seq: u64,
}

impl<K: Hash + Eq + Clone, V> Default for DelayQueue<K, V> {
    fn default() -> Self { Self::new() }
}

impl<K: Hash + Eq + Clone, V> DelayQueue<K, V> {
    pub fn new() -> Self { Self { heap: BinaryHeap::new(), live: FxHashMap::default(), seq: 0 } }

    pub fn len(&self) -> usize { self.live.len() }

    pub fn is_empty(&self) -> bool { self.live.is_empty() }

    /// Insert or supersede. Returns the superseded value, if any.
    pub fn schedule(&mut self, key: K, at: Instant, value: V) -> Option<V> {
        self.seq += 1;
        let seq = self.seq;
        self.heap.push(Entry { at, seq, key: key.clone() });
        let prev = self.live.insert(key, (seq, at, value)).map(|(_, _, v)| v);
        if self.heap.len() > 2 * self.live.len() + 64 {
            self.compact();
        }
        prev
    }

    pub fn get(&self, key: &K) -> Option<(Instant, &V)> {
        self.live.get(key).map(|(_, at, v)| (*at, v))
    }

    pub fn contains(&self, key: &K) -> bool { self.live.contains_key(key) }

    pub fn cancel(&mut self, key: &K) -> Option<V> {
        self.live.remove(key).map(|(_, _, v)| v)
    }

    /// Earliest live fire time.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if self.is_live(top) {
                return Some(top.at);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every item due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(K, V)> {
        let mut out = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.at > now {
                break;
            }
            let entry = match self.heap.pop() {
                Some(e) => e,
                None => break,
            };
            let live = matches!(self.live.get(&entry.key), Some((seq, _, _)) if *seq == entry.seq);
            if live {
                if let Some((_, _, v)) = self.live.remove(&entry.key) {
                    out.push((entry.key, v));
                }
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    fn is_live(&self, e: &Entry<K>) -> bool {
        matches!(self.live.get(&e.key), Some((seq, _, _)) if *seq == e.seq)
    }

    fn compact(&mut self) {
        let live = &self.live;
        let kept: Vec<Entry<K>> = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .filter(|e| matches!(live.get(&e.key), Some((seq, _, _)) if *seq == e.seq))
            .collect();
        self.heap = BinaryHeap::from(kept);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;
    use stagehand_core::{Delay, ResourceRef, Selector};
    use stagehand_expr::PathEvaluator;

    fn pod(extra: Json) -> ManagedResource {
        let mut raw = json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p", "namespace": "d"}});
        if let (Some(obj), Some(add)) = (raw.as_object_mut(), extra.as_object()) {
            for (k, v) in add { obj.insert(k.clone(), v.clone()); }
        }
        ManagedResource::from_raw(raw).unwrap()
    }

    fn stage(delay: Option<Delay>) -> Stage {
        Stage {
            name: "s".into(),
            resource_ref: ResourceRef { api_group: "v1".into(), kind: "Pod".into() },
            selector: Selector::default(),
            weight: 0,
            weight_from: None,
            delay,
            next: Default::default(),
        }
    }

    fn from(expr: &str) -> Option<ExpressionFrom> { Some(ExpressionFrom { expression_from: expr.into() }) }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn no_delay_fires_immediately() {
        let ev = PathEvaluator::new();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(compute_delay(&pod(json!({})), &stage(None), now(), &ev, &mut rng), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let ev = PathEvaluator::new();
        let mut rng = StdRng::seed_from_u64(42);
        let s = stage(Some(Delay {
            duration_milliseconds: Some(1000),
            jitter_duration_milliseconds: Some(5000),
            ..Default::default()
        }));
        let res = pod(json!({}));
        let mut seen_above_base = false;
        for _ in 0..500 {
            let d = compute_delay(&res, &s, now(), &ev, &mut rng);
            assert!(d >= Duration::from_millis(1000) && d <= Duration::from_millis(5000), "{d:?}");
            seen_above_base |= d > Duration::from_millis(1000);
        }
        assert!(seen_above_base);
    }

    #[test]
    fn jitter_below_base_is_ignored() {
        let ev = PathEvaluator::new();
        let mut rng = StdRng::seed_from_u64(3);
        let s = stage(Some(Delay {
            duration_milliseconds: Some(2000),
            jitter_duration_milliseconds: Some(500),
            ..Default::default()
        }));
        assert_eq!(compute_delay(&pod(json!({})), &s, now(), &ev, &mut rng), Duration::from_millis(2000));
    }

    #[test]
    fn expression_durations_times_and_fallback() {
        let ev = PathEvaluator::new();
        let mut rng = StdRng::seed_from_u64(3);
        let res = pod(json!({
            "metadata": {
                "name": "p", "namespace": "d",
                "annotations": { "delay": "1m30s", "at": "2024-05-01T12:00:30Z", "past": "2024-05-01T11:00:00Z" }
            }
        }));
        let with = |expr: &str| {
            stage(Some(Delay { duration_milliseconds: Some(7), duration_from: from(expr), ..Default::default() }))
        };
        assert_eq!(compute_delay(&res, &with(".metadata.annotations.delay"), now(), &ev, &mut rng), Duration::from_secs(90));
        assert_eq!(compute_delay(&res, &with(".metadata.annotations.at"), now(), &ev, &mut rng), Duration::from_secs(30));
        assert_eq!(compute_delay(&res, &with(".metadata.annotations.past"), now(), &ev, &mut rng), Duration::ZERO);
        assert_eq!(compute_delay(&res, &with(".metadata.annotations.none"), now(), &ev, &mut rng), Duration::from_millis(7));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_orders_by_fire_time_and_supersedes() {
        let t0 = Instant::now();
        let mut q: DelayQueue<&str, u32> = DelayQueue::new();
        q.schedule("b", t0 + Duration::from_secs(2), 2);
        q.schedule("a", t0 + Duration::from_secs(1), 1);
        q.schedule("c", t0 + Duration::from_secs(3), 3);
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_secs(1)));

        // supersede "a" to later than "b"
        assert_eq!(q.schedule("a", t0 + Duration::from_millis(2500), 10), Some(1));
        assert_eq!(q.len(), 3);
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_secs(2)));

        assert_eq!(q.cancel(&"c"), Some(3));
        let due = q.pop_due(t0 + Duration::from_secs(10));
        assert_eq!(due, vec![("b", 2), ("a", 10)]);
        assert!(q.is_empty());
        assert_eq!(q.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn pop_due_leaves_future_items() {
        let t0 = Instant::now();
        let mut q: DelayQueue<u32, ()> = DelayQueue::new();
        for i in 0..10u32 {
            q.schedule(i, t0 + Duration::from_millis(i as u64 * 100), ());
        }
        let due: Vec<u32> = q.pop_due(t0 + Duration::from_millis(450)).into_iter().map(|(k, _)| k).collect();
        assert_eq!(due, vec![0, 1, 2, 3, 4]);
        assert_eq!(q.len(), 5);
        q.clear();
        assert!(q.is_empty());
    }
}
