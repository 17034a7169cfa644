//! Template rendering: `{{ expr }}` placeholders inside arbitrary JSON trees.

use serde_json::{Map, Value as Json};
use stagehand_core::{EvalContext, EvalError, Evaluator};

use crate::to_plain_string;

/// Render every string (and object key) in `template`.
///
/// A string that is exactly one placeholder is replaced by the typed result, so
/// `"{{ .spec.replicas }}"` renders as a number. Otherwise results are spliced in
/// as plain text.
pub fn render(template: &Json, ev: &dyn Evaluator, ctx: &EvalContext<'_>) -> Result<Json, EvalError> {
    match template {
        Json::String(s) => render_value(s, ev, ctx),
        Json::Array(items) => items.iter().map(|v| render(v, ev, ctx)).collect::<Result<Vec<_>, _>>().map(Json::Array),
        Json::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                let key = if k.contains("{{") { render_string(k, ev, ctx)? } else { k.clone() };
                out.insert(key, render(v, ev, ctx)?);
            }
            Ok(Json::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn render_value(s: &str, ev: &dyn Evaluator, ctx: &EvalContext<'_>) -> Result<Json, EvalError> {
    let trimmed = s.trim();
    if let Some(inner) = trimmed.strip_prefix("{{").and_then(|r| r.strip_suffix("}}")) {
        if !inner.contains("{{") && !inner.contains("}}") {
            return ev.evaluate(inner.trim(), ctx);
        }
    }
    if !s.contains("{{") {
        return Ok(Json::String(s.to_string()));
    }
    render_string(s, ev, ctx).map(Json::String)
}

/// Interpolate placeholders into a string.
pub fn render_string(s: &str, ev: &dyn Evaluator, ctx: &EvalContext<'_>) -> Result<String, EvalError> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or_else(|| EvalError::Parse {
            expr: s.to_string(),
            message: "unterminated '{{'".into(),
        })?;
        let v = ev.evaluate(after[..close].trim(), ctx)?;
        out.push_str(&to_plain_string(&v));
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PathEvaluator;
    use serde_json::json;

    #[test]
    fn typed_and_interpolated_placeholders() {
        let root = json!({"metadata": {"name": "p0", "labels": {"zone": "a"}}, "spec": {"replicas": 3}});
        let ctx = EvalContext::new(&root).with_var("now", json!("2024-01-01T00:00:00Z"));
        let ev = PathEvaluator::new();
        let tpl = json!({
            "replicas": "{{ .spec.replicas }}",
            "message": "pod {{ .metadata.name }} in {{ .metadata.labels.zone }}",
            "startTime": "{{ $now }}",
            "conditions": [{"type": "Ready", "status": "True"}],
            "{{ .metadata.name }}-key": true,
            "count": 1
        });
        let out = render(&tpl, &ev, &ctx).unwrap();
        assert_eq!(out["replicas"], json!(3));
        assert_eq!(out["message"], json!("pod p0 in a"));
        assert_eq!(out["startTime"], json!("2024-01-01T00:00:00Z"));
        assert_eq!(out["conditions"][0]["status"], json!("True"));
        assert_eq!(out["p0-key"], json!(true));
        assert_eq!(out["count"], json!(1));
    }

    #[test]
    fn unterminated_placeholder_is_a_parse_error() {
        let root = json!({});
        let ctx = EvalContext::new(&root);
        let err = render(&json!("x {{ .a"), &PathEvaluator::new(), &ctx).unwrap_err();
        assert!(matches!(err, EvalError::Parse { .. }));
    }
}
