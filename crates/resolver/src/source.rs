//! YAML/JSON rule loading.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use stagehand_core::{RuleError, RuleSource, Stage, StageDocument};
use tracing::debug;

/// Parse every `kind: Stage` document in a multi-document YAML string. Documents of
/// other kinds are skipped; empty documents are ignored.
pub fn parse_stages(text: &str) -> Result<Vec<Stage>, RuleError> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(doc).map_err(|e| RuleError::Decode(e.to_string()))?;
        if value.is_null() {
            continue;
        }
        if let Some(kind) = value.get("kind").and_then(|k| k.as_str()) {
            if kind != "Stage" {
                debug!(kind, "skipping non-stage document");
                continue;
            }
        }
        let doc: StageDocument = serde_yaml::from_value(value).map_err(|e| RuleError::Decode(e.to_string()))?;
        out.push(Stage::try_from(doc)?);
    }
    Ok(out)
}

/// Reads rule files, or every `*.yaml`/`*.yml`/`*.json` file directly inside a
/// directory (sorted by name).
#[derive(Debug, Clone)]
pub struct FileRuleSource {
    paths: Vec<PathBuf>,
}

impl FileRuleSource {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self { paths: paths.into_iter().map(Into::into).collect() }
    }

    async fn files(&self) -> Result<Vec<PathBuf>, RuleError> {
        let io_err = |p: &Path, e: std::io::Error| RuleError::Io(format!("{}: {e}", p.display()));
        let mut files = Vec::new();
        for p in &self.paths {
            let meta = tokio::fs::metadata(p).await.map_err(|e| io_err(p, e))?;
            if !meta.is_dir() {
                files.push(p.clone());
                continue;
            }
            let mut dir = tokio::fs::read_dir(p).await.map_err(|e| io_err(p, e))?;
            let mut entries = Vec::new();
            while let Some(entry) = dir.next_entry().await.map_err(|e| io_err(p, e))? {
                let path = entry.path();
                // metadata follows symlinks, as in mounted ConfigMaps
                let is_file = tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false);
                if is_file && is_rule_file(&path) {
                    entries.push(path);
                }
            }
            entries.sort();
            files.extend(entries);
        }
        Ok(files)
    }
}

fn is_rule_file(p: &Path) -> bool { matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json")) }

#[async_trait::async_trait]
impl RuleSource for FileRuleSource {
    async fn load(&self) -> Result<Vec<Stage>, RuleError> {
        let mut out = Vec::new();
        for file in self.files().await? {
            let text = tokio::fs::read_to_string(&file)
                .await
                .map_err(|e| RuleError::Io(format!("{}: {e}", file.display())))?;
            let stages = parse_stages(&text).map_err(|e| match e {
                RuleError::Decode(m) => RuleError::Decode(format!("{}: {m}", file.display())),
                other => other,
            })?;
            debug!(file = %file.display(), stages = stages.len(), "parsed rule file");
            out.extend(stages);
        }
        Ok(out)
    }

    fn describe(&self) -> String {
        self.paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(",")
    }
}
