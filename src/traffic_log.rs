//! Traffic log (spec §4.F): a bounded (`N = 1000`) append-only JSONL journal
//! of request/response summaries, rewritten whole under an exclusive
//! advisory OS lock on every append. Grounded on
//! `original_source/src/core/base_proxy.py`'s `log_request` /
//! `_maintain_log_limit` / `_ensure_log_cache_loaded`.

use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write as _},
    path::PathBuf,
    sync::Mutex,
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::usage::UsageRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub timestamp: u64,
    pub service: String,
    pub method: String,
    pub path: String,
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_headers: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtered_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_headers: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_truncated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_bytes: Option<usize>,
    pub usage: UsageRecordPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecordPayload {
    pub service: String,
    pub metrics: Value,
    pub raw: Value,
}

impl From<&UsageRecord> for UsageRecordPayload {
    fn from(record: &UsageRecord) -> Self {
        Self {
            service: record.service.clone(),
            metrics: serde_json::json!({
                "input": record.metrics.input,
                "cached_create": record.metrics.cached_create,
                "cached_read": record.metrics.cached_read,
                "output": record.metrics.output,
                "reasoning": record.metrics.reasoning,
                "total": record.metrics.total,
            }),
            raw: record.raw.clone(),
        }
    }
}

/// Base64-encodes a response body, truncating to `max_bytes` first and
/// reporting whether truncation occurred (spec §4.F, §3 `L.response_truncated`).
pub fn encode_response_body(body: &[u8], max_bytes: usize) -> (String, bool) {
    let truncated = body.len() > max_bytes;
    let slice = &body[..body.len().min(max_bytes)];
    (BASE64.encode(slice), truncated)
}

pub fn encode_body(body: &[u8]) -> String {
    BASE64.encode(body)
}

struct Cache {
    loaded: bool,
    entries: VecDeque<String>,
}

pub struct TrafficLog {
    path: PathBuf,
    limit: usize,
    cache: Mutex<Cache>,
}

impl TrafficLog {
    pub fn new(path: PathBuf, limit: usize) -> Self {
        Self {
            path,
            limit,
            cache: Mutex::new(Cache {
                loaded: false,
                entries: VecDeque::new(),
            }),
        }
    }

    fn ensure_loaded_locked(&self, cache: &mut Cache) {
        if cache.loaded {
            return;
        }
        cache.loaded = true;
        let Ok(file) = File::open(&self.path) else {
            return;
        };
        let reader = BufReader::new(file);
        for line in reader.lines().map_while(Result::ok) {
            if line.trim().is_empty() {
                continue;
            }
            if serde_json::from_str::<Value>(&line).is_ok() {
                cache.entries.push_back(line);
            }
            // malformed lines are skipped, matching the read contract (§4.F).
        }
        while cache.entries.len() > self.limit {
            cache.entries.pop_front();
        }
    }

    /// Appends one entry, then rewrites the whole file under an exclusive
    /// advisory lock (spec §4.F, §5). On write failure, logs and attempts a
    /// best-effort append-only fallback so a transient failure doesn't lose
    /// the entry entirely (spec §7, "Log-write failure").
    pub fn append(&self, entry: &LogEntry) {
        let Ok(line) = serde_json::to_string(entry) else {
            tracing::error!("traffic log: failed to serialize entry");
            return;
        };

        let mut cache = self.cache.lock().expect("traffic log cache poisoned");
        self.ensure_loaded_locked(&mut cache);
        cache.entries.push_back(line.clone());
        while cache.entries.len() > self.limit {
            cache.entries.pop_front();
        }

        if let Err(e) = self.rewrite_locked(&cache.entries) {
            tracing::error!(error = %e, "traffic log: rewrite failed, attempting append fallback");
            if let Err(e2) = self.append_fallback(&line) {
                tracing::error!(error = %e2, "traffic log: append fallback also failed");
            }
        }
    }

    fn rewrite_locked(&self, entries: &VecDeque<String>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let mut writer = &file;
        for line in entries {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        fs2::FileExt::unlock(&file)?;
        Ok(())
    }

    fn append_fallback(&self, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().append(true).create(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Read-only iterator for the (out-of-scope) admin UI: line by line,
    /// skipping malformed lines (spec §4.F).
    pub fn read_entries(&self) -> Vec<LogEntry> {
        let Ok(file) = File::open(&self.path) else {
            return Vec::new();
        };
        let reader = BufReader::new(file);
        reader
            .lines()
            .map_while(Result::ok)
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<LogEntry>(&l).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        let mut cache = self.cache.lock().expect("traffic log cache poisoned");
        self.ensure_loaded_locked(&mut cache);
        cache.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::normalize_usage;

    fn sample_entry(id: &str) -> LogEntry {
        let usage = normalize_usage("claude", None);
        LogEntry {
            id: id.to_string(),
            timestamp: 0,
            service: "claude".to_string(),
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            status_code: Some(200),
            duration_ms: 12,
            channel: Some("primary".to_string()),
            target_headers: None,
            filtered_body: None,
            original_headers: None,
            original_body: None,
            response_content: None,
            response_truncated: None,
            response_bytes: None,
            usage: (&usage).into(),
            blocked: None,
            blocked_by: None,
            blocked_reason: None,
        }
    }

    #[test]
    fn retains_at_most_limit_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log = TrafficLog::new(dir.path().join("log.jsonl"), 3);
        for i in 0..5 {
            log.append(&sample_entry(&format!("id-{i}")));
        }
        let entries = log.read_entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].id, "id-2");
        assert_eq!(entries[2].id, "id-4");
    }

    #[test]
    fn retention_after_1100_requests_keeps_last_1000() {
        let dir = tempfile::tempdir().unwrap();
        let log = TrafficLog::new(dir.path().join("log.jsonl"), 1000);
        for i in 0..1100 {
            log.append(&sample_entry(&format!("req-{i}")));
        }
        let entries = log.read_entries();
        assert_eq!(entries.len(), 1000);
        assert_eq!(entries[0].id, "req-100");
    }

    #[test]
    fn malformed_lines_are_skipped_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        fs::write(&path, "not json\n{\"id\":\"a\"}\n").unwrap();
        let log = TrafficLog::new(path, 1000);
        // Triggers lazy load; malformed line should not crash or count.
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn every_line_is_valid_json_with_unique_id() {
        let dir = tempfile::tempdir().unwrap();
        let log = TrafficLog::new(dir.path().join("log.jsonl"), 1000);
        for i in 0..10 {
            log.append(&sample_entry(&format!("id-{i}")));
        }
        let content = fs::read_to_string(dir.path().join("log.jsonl")).unwrap();
        let mut ids = std::collections::HashSet::new();
        for line in content.lines() {
            let value: Value = serde_json::from_str(line).unwrap();
            let id = value["id"].as_str().unwrap().to_string();
            assert!(ids.insert(id));
        }
    }

    #[test]
    fn response_body_is_truncated_and_marked() {
        let big = vec![b'x'; 50];
        let (_, truncated) = encode_response_body(&big, 10);
        assert!(truncated);
        let (_, truncated_small) = encode_response_body(&big, 100);
        assert!(!truncated_small);
    }
}
