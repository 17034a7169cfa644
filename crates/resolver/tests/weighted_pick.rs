use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use stagehand_core::ManagedResource;
use stagehand_expr::PathEvaluator;
use stagehand_resolver::{parse_stages, StageIndex};

const RULES: &str = r#"
kind: Stage
metadata: { name: light }
spec:
  resourceRef: { apiGroup: v1, kind: Pod }
  weight: 1
  selector:
    matchExpressions:
      - { key: .status.phase, operator: In, values: [Pending] }
  next: { statusTemplate: { phase: Running } }
---
kind: Stage
metadata: { name: heavy }
spec:
  resourceRef: { apiGroup: v1, kind: Pod }
  weight: 3
  selector:
    matchExpressions:
      - { key: .status.phase, operator: In, values: [Pending] }
  next: { statusTemplate: { phase: Failed } }
---
kind: Stage
metadata: { name: unrelated }
spec:
  resourceRef: { apiGroup: v1, kind: Pod }
  weight: 100
  selector:
    matchExpressions:
      - { key: .status.phase, operator: In, values: [Running] }
  next: { delete: true }
"#;

fn pending_pod() -> ManagedResource {
    ManagedResource::from_raw(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": "p0", "namespace": "default" },
        "status": { "phase": "Pending" }
    }))
    .unwrap()
}

#[test]
fn seeded_picks_follow_weights() {
    let idx = StageIndex::build(parse_stages(RULES).unwrap()).unwrap();
    let ev = PathEvaluator::new();
    let pod = pending_pod();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut light = 0usize;
    let mut heavy = 0usize;
    for _ in 0..10_000 {
        match idx.resolve_with(&pod, &ev, &mut rng).unwrap().name.as_str() {
            "light" => light += 1,
            "heavy" => heavy += 1,
            other => panic!("unexpected stage {other}"),
        }
    }
    // 25% / 75% within a generous band
    assert!((2_200..=2_800).contains(&light), "light={light}");
    assert!((7_200..=7_800).contains(&heavy), "heavy={heavy}");
}

#[test]
fn explain_reports_every_candidate() {
    let idx = StageIndex::build(parse_stages(RULES).unwrap()).unwrap();
    let rows = idx.explain(&pending_pod(), &PathEvaluator::new());
    let summary: Vec<_> = rows.iter().map(|c| (c.stage.as_str(), c.matched, c.weight)).collect();
    assert_eq!(summary, [("light", true, 1), ("heavy", true, 3), ("unrelated", false, 100)]);
}
