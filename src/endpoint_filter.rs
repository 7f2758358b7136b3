//! Endpoint filter (spec §4.C): stateless pattern match of (service, method,
//! path, query) to a block verdict. Persisted at `~/.clp/endpoint_filter.json`.
//! Grounded on `original_source/src/filter/cached_endpoint_filter.py`, with
//! the REDESIGN FLAGS tagged-union matcher (spec §9 "Dynamic-typed config
//! objects → tagged unions"): a rule that sets zero or more than one of
//! `path`/`prefix`/`regex` is rejected at load time instead of the original's
//! silent path > prefix > regex precedence.

use std::{collections::BTreeMap, fs, path::PathBuf};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
struct RawRule {
    id: Option<String>,
    #[serde(default)]
    services: Option<Vec<String>>,
    #[serde(default)]
    methods: Option<Vec<String>>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    prefix: Option<String>,
    #[serde(default)]
    regex: Option<String>,
    #[serde(default)]
    query: Option<BTreeMap<String, String>>,
    #[serde(default)]
    action: Option<RawAction>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawAction {
    #[serde(rename = "type", default)]
    action_type: Option<String>,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    rules: Vec<RawRule>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
enum PathMatcher {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub struct Rule {
    id: Option<String>,
    services: Option<Vec<String>>,
    methods: Option<Vec<String>>,
    matcher: PathMatcher,
    query: BTreeMap<String, String>,
    status: u16,
    message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub rule_id: Option<String>,
    pub status: u16,
    pub message: String,
}

pub struct EndpointFilter {
    path: PathBuf,
}

impl EndpointFilter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> (bool, Vec<Rule>) {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return (true, Vec::new()),
        };
        let raw: RawConfig = match serde_json::from_str(&content) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "endpoint filter: config parse failure, disabling");
                return (false, Vec::new());
            }
        };

        let mut rules = Vec::with_capacity(raw.rules.len());
        for raw_rule in raw.rules {
            match Self::compile_rule(raw_rule) {
                Ok(rule) => rules.push(rule),
                Err(reason) => {
                    tracing::warn!(reason = %reason, "endpoint filter: rejecting malformed rule");
                }
            }
        }
        (raw.enabled, rules)
    }

    fn compile_rule(raw: RawRule) -> Result<Rule, &'static str> {
        let matcher_count = [raw.path.is_some(), raw.prefix.is_some(), raw.regex.is_some()]
            .into_iter()
            .filter(|b| *b)
            .count();
        if matcher_count != 1 {
            return Err("rule must set exactly one of path/prefix/regex");
        }

        let matcher = if let Some(path) = raw.path {
            PathMatcher::Exact(path)
        } else if let Some(prefix) = raw.prefix {
            PathMatcher::Prefix(prefix)
        } else if let Some(pattern) = raw.regex {
            let compiled = Regex::new(&pattern).map_err(|_| "invalid regex")?;
            PathMatcher::Regex(compiled)
        } else {
            unreachable!("matcher_count == 1 guarantees one branch taken")
        };

        let action = raw.action.ok_or("rule has no action")?;
        let action_type = action
            .action_type
            .unwrap_or_else(|| "block".to_string())
            .to_ascii_lowercase();
        if action_type != "block" {
            return Err("unsupported action type");
        }

        Ok(Rule {
            id: raw.id,
            services: raw
                .services
                .map(|v| v.into_iter().map(|s| s.trim().to_ascii_lowercase()).collect()),
            methods: raw
                .methods
                .map(|v| v.into_iter().map(|s| s.trim().to_ascii_uppercase()).collect()),
            matcher,
            query: raw.query.unwrap_or_default(),
            status: action.status.unwrap_or(403),
            message: action
                .message
                .unwrap_or_else(|| "Endpoint is blocked by proxy".to_string()),
        })
    }

    pub fn matches(
        &self,
        service: &str,
        method: &str,
        path: &str,
        query: &BTreeMap<String, String>,
    ) -> Option<MatchResult> {
        let (enabled, rules) = self.load();
        if !enabled || rules.is_empty() {
            return None;
        }

        let service = service.trim().to_ascii_lowercase();
        let method = method.trim().to_ascii_uppercase();
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };

        for rule in &rules {
            if let Some(services) = &rule.services {
                if !services.is_empty() && !services.iter().any(|s| s == &service) {
                    continue;
                }
            }
            if let Some(methods) = &rule.methods {
                if !methods.is_empty()
                    && !methods.iter().any(|m| m == "*")
                    && !methods.iter().any(|m| m == &method)
                {
                    continue;
                }
            }
            if !Self::path_matches(&rule.matcher, &path) {
                continue;
            }
            if !Self::query_matches(&rule.query, query) {
                continue;
            }
            return Some(MatchResult {
                rule_id: rule.id.clone(),
                status: rule.status,
                message: rule.message.clone(),
            });
        }
        None
    }

    fn path_matches(matcher: &PathMatcher, path: &str) -> bool {
        match matcher {
            PathMatcher::Exact(p) => path == p,
            PathMatcher::Prefix(p) => path.starts_with(p.as_str()),
            PathMatcher::Regex(re) => re.is_match(path),
        }
    }

    fn query_matches(rule_query: &BTreeMap<String, String>, actual: &BTreeMap<String, String>) -> bool {
        for (k, v) in rule_query {
            match actual.get(k) {
                None => return false,
                Some(actual_v) => {
                    if v != "*" && actual_v != v {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// Parses a URI query string (`a=1&b=2`) into a first-value-wins map,
/// matching the original's "query: first value wins" contract.
pub fn parse_query(raw: Option<&str>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    let Some(raw) = raw else { return map };
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        if key.is_empty() {
            continue;
        }
        map.entry(key.into_owned()).or_insert_with(|| value.into_owned());
    }
    map
}

/// Exposed only so other components (e.g. future admin tooling) can express
/// the shape of a rule without round-tripping through the `Value`-based raw
/// form. Not used by the matcher itself.
pub fn is_block_action(action: &Value) -> bool {
    action
        .get("type")
        .and_then(Value::as_str)
        .map(|t| t.eq_ignore_ascii_case("block"))
        .unwrap_or(true)
}
