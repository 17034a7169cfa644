//! Stage rules: declarative transitions for managed resources.
//!
//! Rules are written in the same shape as cluster objects:
//!
//! ```yaml
//! apiVersion: stagehand.dev/v1alpha1
//! kind: Stage
//! metadata: { name: pod-ready }
//! spec:
//!   resourceRef: { apiGroup: v1, kind: Pod }
//!   selector:
//!     matchExpressions:
//!       - { key: .status.phase, operator: In, values: [Pending] }
//!   delay: { durationMilliseconds: 1000, jitterDurationMilliseconds: 5000 }
//!   next:
//!     statusTemplate: { phase: Running }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resource::GroupKind;
use crate::Json;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule source io: {0}")]
    Io(String),
    #[error("rule decode: {0}")]
    Decode(String),
    #[error("stage {stage}: {message}")]
    Invalid { stage: String, message: String },
    #[error("label selector {selector:?}: {message}")]
    LabelSelector { selector: String, message: String },
}

/// Serialized form of a rule as found in YAML/JSON rule files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDocument {
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    pub metadata: StageMetadata,
    pub spec: StageSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMetadata {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSpec {
    pub resource_ref: ResourceRef,
    #[serde(default)]
    pub selector: Option<Selector>,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub weight_from: Option<ExpressionFrom>,
    #[serde(default)]
    pub delay: Option<Delay>,
    #[serde(default)]
    pub next: Next,
}

/// A validated stage rule. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub resource_ref: ResourceRef,
    pub selector: Selector,
    pub weight: u32,
    pub weight_from: Option<ExpressionFrom>,
    pub delay: Option<Delay>,
    pub next: Next,
}

impl TryFrom<StageDocument> for Stage {
    type Error = RuleError;

    fn try_from(doc: StageDocument) -> Result<Self, Self::Error> {
        if let Some(kind) = doc.kind.as_deref() {
            if kind != "Stage" {
                return Err(RuleError::Invalid { stage: doc.metadata.name, message: format!("unexpected kind {kind}") });
            }
        }
        let stage = Stage {
            name: doc.metadata.name,
            resource_ref: doc.spec.resource_ref,
            selector: doc.spec.selector.unwrap_or_default(),
            weight: doc.spec.weight,
            weight_from: doc.spec.weight_from,
            delay: doc.spec.delay,
            next: doc.spec.next,
        };
        stage.validate()?;
        Ok(stage)
    }
}

impl Stage {
    pub fn group_kind(&self) -> GroupKind { self.resource_ref.group_kind() }

    pub fn validate(&self) -> Result<(), RuleError> {
        let invalid = |message: String| RuleError::Invalid { stage: self.name.clone(), message };
        if self.name.is_empty() {
            return Err(RuleError::Invalid { stage: "<unnamed>".into(), message: "metadata.name is required".into() });
        }
        if self.resource_ref.kind.is_empty() {
            return Err(invalid("resourceRef.kind is required".into()));
        }
        for req in &self.selector.match_expressions {
            if req.key.is_empty() {
                return Err(invalid("matchExpressions key must not be empty".into()));
            }
            match req.operator {
                SelectorOperator::In | SelectorOperator::NotIn if req.values.is_empty() => {
                    return Err(invalid(format!("{:?} on {} requires values", req.operator, req.key)));
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist if !req.values.is_empty() => {
                    return Err(invalid(format!("{:?} on {} takes no values", req.operator, req.key)));
                }
                _ => {}
            }
        }
        if let Some(d) = &self.delay {
            if d.duration_milliseconds.map(|v| v < 0).unwrap_or(false)
                || d.jitter_duration_milliseconds.map(|v| v < 0).unwrap_or(false)
            {
                return Err(invalid("delay milliseconds must be non-negative".into()));
            }
        }
        for p in self.next.effective_patches() {
            if p.patch_type == PatchType::Json && p.root.is_some() {
                return Err(invalid("json patches address paths directly and take no root".into()));
            }
            if p.patch_type == PatchType::Json && !(p.template.is_array() || p.template.is_string()) {
                return Err(invalid("json patch template must be a list of operations".into()));
            }
        }
        if let Some(f) = &self.next.finalizers {
            if f.empty && !f.add.is_empty() {
                return Err(invalid("finalizers.empty cannot be combined with add".into()));
            }
        }
        Ok(())
    }
}

/// Target type of a rule. `apiGroup` accepts `v1`, `apps/v1` or a bare group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(default)]
    pub api_group: String,
    pub kind: String,
}

impl ResourceRef {
    pub fn group_kind(&self) -> GroupKind {
        let group = match self.api_group.split_once('/') {
            Some((g, _v)) => g,
            None if looks_like_version(&self.api_group) => "",
            None => self.api_group.as_str(),
        };
        GroupKind::new(group, self.kind.clone())
    }
}

fn looks_like_version(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next() == Some('v') && chars.next().map(|c| c.is_ascii_digit()).unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl Selector {
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_annotations.is_empty() && self.match_expressions.is_empty()
    }

    /// Parse a label selector string (`a=b,c!=d,e,!f`) into a selector.
    /// Equality terms become `matchLabels`; the rest become label expressions.
    pub fn from_label_selector(s: &str) -> Result<Self, RuleError> {
        let mut sel = Selector::default();
        let err = |message: &str| RuleError::LabelSelector { selector: s.to_string(), message: message.to_string() };
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if let Some((k, v)) = term.split_once("!=") {
                let k = k.trim();
                if k.is_empty() { return Err(err("empty key")); }
                sel.match_expressions.push(SelectorRequirement {
                    key: label_path(k),
                    operator: SelectorOperator::NotIn,
                    values: vec![v.trim().to_string()],
                });
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                let k = k.trim();
                if k.is_empty() { return Err(err("empty key")); }
                sel.match_labels.insert(k.to_string(), v.trim().to_string());
            } else if let Some(k) = term.strip_prefix('!') {
                let k = k.trim();
                if k.is_empty() { return Err(err("empty key")); }
                sel.match_expressions.push(SelectorRequirement {
                    key: label_path(k),
                    operator: SelectorOperator::DoesNotExist,
                    values: Vec::new(),
                });
            } else if term.contains(' ') {
                return Err(err("set-based terms are not supported"));
            } else {
                sel.match_expressions.push(SelectorRequirement {
                    key: label_path(term),
                    operator: SelectorOperator::Exists,
                    values: Vec::new(),
                });
            }
        }
        Ok(sel)
    }
}

fn label_path(key: &str) -> String {
    format!(".metadata.labels[{}]", serde_json::Value::String(key.to_string()))
}

/// One `matchExpressions` entry; `key` is an expression evaluated against the object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionFrom {
    pub expression_from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Delay {
    #[serde(default)]
    pub duration_milliseconds: Option<i64>,
    #[serde(default)]
    pub duration_from: Option<ExpressionFrom>,
    #[serde(default)]
    pub jitter_duration_milliseconds: Option<i64>,
    #[serde(default)]
    pub jitter_duration_from: Option<ExpressionFrom>,
}

/// What happens when a stage is applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Next {
    /// Shorthand for a merge patch on the `status` subresource rooted at `status`.
    #[serde(default)]
    pub status_template: Option<Json>,
    #[serde(default)]
    pub patches: Vec<PatchSpec>,
    #[serde(default)]
    pub finalizers: Option<FinalizerSpec>,
    #[serde(default)]
    pub event: Option<EventSpec>,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub immediate_next_stage: bool,
}

impl Next {
    /// Declared patches in application order, status template first.
    pub fn effective_patches(&self) -> Vec<PatchSpec> {
        let mut out = Vec::with_capacity(self.patches.len() + 1);
        if let Some(t) = &self.status_template {
            out.push(PatchSpec {
                subresource: Some("status".into()),
                root: Some("status".into()),
                template: t.clone(),
                patch_type: PatchType::Merge,
                impersonation: None,
            });
        }
        out.extend(self.patches.iter().cloned());
        out
    }

    pub fn is_noop(&self) -> bool {
        self.status_template.is_none()
            && self.patches.is_empty()
            && self.finalizers.is_none()
            && self.event.is_none()
            && !self.delete
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatchSpec {
    #[serde(default)]
    pub subresource: Option<String>,
    /// Dotted path the rendered template is nested under (`status`, `metadata.labels`).
    #[serde(default)]
    pub root: Option<String>,
    pub template: Json,
    #[serde(rename = "type", default)]
    pub patch_type: PatchType,
    #[serde(default)]
    pub impersonation: Option<Impersonation>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    Json,
    #[default]
    Merge,
    Strategic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Impersonation {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FinalizerSpec {
    #[serde(default)]
    pub add: Vec<FinalizerItem>,
    #[serde(default)]
    pub remove: Vec<FinalizerItem>,
    #[serde(default)]
    pub empty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinalizerItem {
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventSpec {
    #[serde(rename = "type", default = "default_event_type")]
    pub event_type: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

fn default_event_type() -> String { "Normal".to_string() }

#[cfg(test)]
mod tests {
    use super::*;

    const POD_READY: &str = r#"
apiVersion: stagehand.dev/v1alpha1
kind: Stage
metadata:
  name: pod-ready
spec:
  resourceRef:
    apiGroup: v1
    kind: Pod
  selector:
    matchLabels:
      app: web
    matchExpressions:
      - key: .status.phase
        operator: In
        values: [Pending]
  weight: 2
  delay:
    durationMilliseconds: 1000
    jitterDurationMilliseconds: 5000
  next:
    statusTemplate:
      phase: Running
    finalizers:
      add:
        - value: stagehand.dev/fake
    event:
      reason: Started
      message: pod started
"#;

    #[test]
    fn decodes_stage_document() {
        let doc: StageDocument = serde_yaml::from_str(POD_READY).unwrap();
        let stage = Stage::try_from(doc).unwrap();
        assert_eq!(stage.name, "pod-ready");
        assert_eq!(stage.group_kind(), GroupKind::new("", "Pod"));
        assert_eq!(stage.weight, 2);
        assert_eq!(stage.selector.match_expressions[0].operator, SelectorOperator::In);
        let patches = stage.next.effective_patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].subresource.as_deref(), Some("status"));
        assert_eq!(stage.next.event.as_ref().unwrap().event_type, "Normal");
        assert!(!stage.next.immediate_next_stage);
    }

    #[test]
    fn resource_ref_normalizes_api_group() {
        let r = |g: &str| ResourceRef { api_group: g.into(), kind: "K".into() }.group_kind().group;
        assert_eq!(r("v1"), "");
        assert_eq!(r(""), "");
        assert_eq!(r("apps/v1"), "apps");
        assert_eq!(r("coordination.k8s.io"), "coordination.k8s.io");
        assert_eq!(r("apps"), "apps");
    }

    #[test]
    fn validation_rejects_bad_operators() {
        let mut doc: StageDocument = serde_yaml::from_str(POD_READY).unwrap();
        doc.spec.selector.as_mut().unwrap().match_expressions[0].values.clear();
        let err = Stage::try_from(doc).unwrap_err();
        assert!(err.to_string().contains("requires values"), "{err}");
    }

    #[test]
    fn label_selector_terms() {
        let sel = Selector::from_label_selector("type=kwok, tier!=db,managed,!skip").unwrap();
        assert_eq!(sel.match_labels.get("type").map(|s| s.as_str()), Some("kwok"));
        assert_eq!(sel.match_expressions.len(), 3);
        assert_eq!(sel.match_expressions[0].key, ".metadata.labels[\"tier\"]");
        assert_eq!(sel.match_expressions[0].operator, SelectorOperator::NotIn);
        assert_eq!(sel.match_expressions[1].operator, SelectorOperator::Exists);
        assert_eq!(sel.match_expressions[2].operator, SelectorOperator::DoesNotExist);
        assert!(Selector::from_label_selector("").unwrap().is_empty());
        assert!(Selector::from_label_selector("=x").is_err());
        assert!(Selector::from_label_selector("env in (a,b)").is_err());
    }
}
