//! Header-blocklist filter: an external collaborator per spec §1/§6, whose
//! file contract (`~/.clp/header_filter.json`) the dispatcher still consumes
//! directly as part of outbound header handling (spec §4.H). Grounded on
//! `original_source/src/filter/cached_header_filter.py`; only the read-side
//! contract is implemented here — no admin surface for editing the file.

use std::{collections::HashSet, fs, path::PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct RawHeaderFilterConfig {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    blocked_headers: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_blocked_headers() -> Vec<String> {
    vec![
        "x-forwarded-for".to_string(),
        "x-forwarded-proto".to_string(),
        "x-forwarded-scheme".to_string(),
        "x-real-ip".to_string(),
        "x-forwarded-host".to_string(),
        "x-forwarded-port".to_string(),
        "x-forwarded-server".to_string(),
    ]
}

pub struct HeaderFilter {
    path: PathBuf,
}

impl HeaderFilter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> (bool, HashSet<String>) {
        match fs::read_to_string(&self.path) {
            Err(_) => (true, default_blocked_headers().into_iter().collect()),
            Ok(content) => match serde_json::from_str::<RawHeaderFilterConfig>(&content) {
                Ok(cfg) => {
                    let blocked = cfg
                        .blocked_headers
                        .into_iter()
                        .map(|h| h.trim().to_ascii_lowercase())
                        .filter(|h| !h.is_empty())
                        .collect();
                    (cfg.enabled, blocked)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "header filter: parse failure, using defaults");
                    (true, default_blocked_headers().into_iter().collect())
                }
            },
        }
    }

    /// Returns the lower-cased set of header names to strip from the
    /// outbound request, or an empty set if disabled.
    pub fn blocked_headers(&self) -> HashSet<String> {
        let (enabled, blocked) = self.load();
        if enabled { blocked } else { HashSet::new() }
    }
}
