//! Routing table (spec §4.B): stateless mapping of (requested model,
//! currently-selected config) to (new model, override config). Persisted at
//! `~/.clp/data/model_router_config.json`. Grounded on
//! `original_source/src/core/base_proxy.py`'s `_apply_model_routing` /
//! `_apply_model_mapping` / `_apply_config_mapping`.

use std::{fs, path::PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    Default,
    ModelMapping,
    ConfigMapping,
}

impl Default for RoutingMode {
    fn default() -> Self {
        RoutingMode::Default
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Model,
    Config,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelMappingRule {
    pub source: String,
    pub source_type: SourceType,
    pub target: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfigMappingRule {
    pub model: String,
    pub config: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoutingRules {
    #[serde(default)]
    pub mode: RoutingMode,
    #[serde(default)]
    pub model_mappings: Vec<ModelMappingRule>,
    #[serde(default)]
    pub config_mappings: Vec<ConfigMappingRule>,
}

pub struct RoutingTable {
    path: PathBuf,
}

/// Result of applying the routing table to one request.
pub struct RoutingResult {
    pub body: Bytes,
    pub override_config: Option<String>,
}

impl RoutingTable {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> RoutingRules {
        match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => RoutingRules::default(),
        }
    }

    /// `visible_configs` is used only by `config-mapping` mode, to verify
    /// `rule.config` is actually a live upstream (spec §4.B rule 4).
    pub fn apply(
        &self,
        body: Bytes,
        current_config: Option<&str>,
        visible_configs: &[String],
    ) -> RoutingResult {
        let rules = self.load();

        if rules.mode == RoutingMode::Default {
            return RoutingResult {
                body,
                override_config: None,
            };
        }

        let Ok(mut json) = serde_json::from_slice::<Value>(&body) else {
            return RoutingResult {
                body,
                override_config: None,
            };
        };
        let Some(model) = json.get("model").and_then(Value::as_str).map(str::to_string) else {
            return RoutingResult {
                body,
                override_config: None,
            };
        };

        match rules.mode {
            RoutingMode::Default => unreachable!(),
            RoutingMode::ModelMapping => {
                for rule in &rules.model_mappings {
                    let hit = match rule.source_type {
                        SourceType::Model => model == rule.source,
                        SourceType::Config => current_config == Some(rule.source.as_str()),
                    };
                    if !hit {
                        continue;
                    }
                    if let Some(obj) = json.as_object_mut() {
                        obj.insert("model".to_string(), Value::String(rule.target.clone()));
                    }
                    let encoded = match serde_json::to_vec(&json) {
                        Ok(bytes) => Bytes::from(bytes),
                        Err(_) => body,
                    };
                    return RoutingResult {
                        body: encoded,
                        override_config: None,
                    };
                }
                RoutingResult {
                    body,
                    override_config: None,
                }
            }
            RoutingMode::ConfigMapping => {
                for rule in &rules.config_mappings {
                    if model == rule.model && visible_configs.iter().any(|c| c == &rule.config) {
                        return RoutingResult {
                            body,
                            override_config: Some(rule.config.clone()),
                        };
                    }
                }
                RoutingResult {
                    body,
                    override_config: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("model_router_config.json");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn default_mode_is_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"mode": "default"}"#);
        let table = RoutingTable::new(path);
        let body = Bytes::from_static(br#"{"model":"gpt-4"}"#);
        let result = table.apply(body.clone(), None, &[]);
        assert_eq!(result.body, body);
        assert!(result.override_config.is_none());
    }

    #[test]
    fn model_mapping_rewrites_first_match_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"{
                "mode": "model-mapping",
                "model_mappings": [
                    {"source": "gpt-4", "source_type": "model", "target": "gpt-4-turbo"},
                    {"source": "gpt-4", "source_type": "model", "target": "should-not-apply"}
                ]
            }"#,
        );
        let table = RoutingTable::new(path);
        let body = Bytes::from_static(br#"{"model":"gpt-4"}"#);
        let result = table.apply(body, None, &[]);
        let v: Value = serde_json::from_slice(&result.body).unwrap();
        assert_eq!(v["model"], "gpt-4-turbo");
    }

    #[test]
    fn config_mapping_requires_visible_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"{
                "mode": "config-mapping",
                "config_mappings": [{"model": "gpt-4", "config": "backup"}]
            }"#,
        );
        let table = RoutingTable::new(path);
        let body = Bytes::from_static(br#"{"model":"gpt-4"}"#);

        let miss = table.apply(body.clone(), None, &[]);
        assert!(miss.override_config.is_none());

        let hit = table.apply(body, None, &["backup".to_string()]);
        assert_eq!(hit.override_config.as_deref(), Some("backup"));
    }

    #[test]
    fn malformed_body_is_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"mode": "model-mapping", "model_mappings": []}"#);
        let table = RoutingTable::new(path);
        let body = Bytes::from_static(b"not json");
        let result = table.apply(body.clone(), None, &[]);
        assert_eq!(result.body, body);
    }
}
