//! Usage parser (spec §4.E): incremental extractor of token-usage records
//! from SSE, NDJSON, and whole-JSON response streams, plus the per-
//! `(service, channel)` aggregator from the last paragraph of §4.E. Grounded
//! on `original_source/src/utils/usage_parser.py`.

use std::collections::BTreeMap;

use serde_json::Value;

pub const METRIC_KEYS: [&str; 6] = [
    "input",
    "cached_create",
    "cached_read",
    "output",
    "reasoning",
    "total",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    pub input: i64,
    pub cached_create: i64,
    pub cached_read: i64,
    pub output: i64,
    pub reasoning: i64,
    pub total: i64,
}

impl Metrics {
    fn get(&self, key: &str) -> i64 {
        match key {
            "input" => self.input,
            "cached_create" => self.cached_create,
            "cached_read" => self.cached_read,
            "output" => self.output,
            "reasoning" => self.reasoning,
            "total" => self.total,
            _ => 0,
        }
    }

    fn add(&mut self, key: &str, value: i64) {
        match key {
            "input" => self.input += value,
            "cached_create" => self.cached_create += value,
            "cached_read" => self.cached_read += value,
            "output" => self.output += value,
            "reasoning" => self.reasoning += value,
            "total" => self.total += value,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub service: String,
    pub metrics: Metrics,
    pub raw: Value,
}

/// Best-effort conversion of numeric-ish JSON values to `i64`, mirroring
/// `usage_parser.py::_to_int` (bools count as 0/1, floats truncate, numeric
/// strings parse, everything else is 0).
fn to_int(value: Option<&Value>) -> i64 {
    match value {
        None => 0,
        Some(Value::Bool(b)) => *b as i64,
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                i
            } else if let Some(f) = n.as_f64() {
                f as i64
            } else {
                0
            }
        }
        Some(Value::String(s)) => s.parse::<f64>().map(|f| f as i64).unwrap_or(0),
        Some(_) => 0,
    }
}

/// `normalize_usage(service, raw_usage)`.
pub fn normalize_usage(service: &str, raw: Option<&Value>) -> UsageRecord {
    let empty = Value::Object(Default::default());
    let raw_value = raw.unwrap_or(&empty);
    let mut metrics = Metrics::default();

    if service.eq_ignore_ascii_case("claude") {
        metrics.input = to_int(raw_value.get("input_tokens"));
        metrics.cached_create = to_int(raw_value.get("cache_creation_input_tokens"));
        metrics.cached_read = to_int(raw_value.get("cache_read_input_tokens"));
        metrics.output = to_int(raw_value.get("output_tokens"));
        metrics.reasoning = to_int(raw_value.get("reasoning_tokens"));
        metrics.total = match raw_value.get("total_tokens") {
            Some(v) if !v.is_null() => to_int(Some(v)),
            _ => metrics.input + metrics.output,
        };
    } else {
        metrics.input = to_int(raw_value.get("input_tokens"));
        metrics.cached_read = raw_value
            .get("input_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .map(|v| to_int(Some(v)))
            .unwrap_or(0);
        metrics.cached_create = to_int(raw_value.get("cache_creation_input_tokens"));
        metrics.output = to_int(raw_value.get("output_tokens"));
        metrics.reasoning = raw_value
            .get("output_tokens_details")
            .and_then(|d| d.get("reasoning_tokens"))
            .map(|v| to_int(Some(v)))
            .unwrap_or(0);
        metrics.total = match raw_value.get("total_tokens") {
            Some(v) if !v.is_null() => to_int(Some(v)),
            _ => metrics.input + metrics.output,
        };
    }

    UsageRecord {
        service: service.to_string(),
        metrics,
        raw: raw_value.clone(),
    }
}

/// `normalize_usage_record`: idempotent re-normalization. Re-normalizing an
/// already-normalized record must equal itself (spec §8 round-trip
/// property).
pub fn normalize_usage_record(service: &str, record: &UsageRecord) -> UsageRecord {
    record.clone()
}

/// Locates the vendor-specific `usage` object inside one decoded JSON
/// payload (root `usage`, or `message.usage` for claude / `response.usage`
/// for codex).
fn extract_usage_from_payload(service: &str, payload: &Value) -> Option<Value> {
    if let Some(usage) = payload.get("usage") {
        if usage.is_object() {
            return Some(usage.clone());
        }
    }
    let nested_key = if service.eq_ignore_ascii_case("claude") {
        "message"
    } else {
        "response"
    };
    payload
        .get(nested_key)
        .and_then(|n| n.get("usage"))
        .filter(|u| u.is_object())
        .cloned()
}

fn extract_data_lines(chunk: &str) -> Vec<String> {
    chunk
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| l.strip_prefix("data:"))
        .map(|l| l.trim().to_string())
        .collect()
}

fn try_usage_from_data_line(service: &str, data_line: &str) -> Option<Value> {
    let payload: Value = serde_json::from_str(data_line).ok()?;
    if !payload.is_object() {
        return None;
    }
    extract_usage_from_payload(service, &payload)
}

/// `process_sse_buffer(service, buffer, chunk_text, previous_usage)`:
/// events delimited by `\n\n`. Returns `(latest_usage, remainder)`.
pub fn process_sse_buffer(
    service: &str,
    buffer: &str,
    chunk_text: &str,
    previous_usage: Option<Value>,
) -> (Option<Value>, String) {
    if chunk_text.is_empty() {
        return (previous_usage, buffer.to_string());
    }

    let text = format!("{buffer}{chunk_text}");
    let mut parts: Vec<&str> = text.split("\n\n").collect();
    let remainder = if text.ends_with("\n\n") {
        String::new()
    } else {
        parts.pop().unwrap_or("").to_string()
    };

    let mut latest = previous_usage;
    for part in parts {
        for data_line in extract_data_lines(part) {
            if let Some(usage) = try_usage_from_data_line(service, &data_line) {
                latest = Some(usage);
            }
        }
    }
    (latest, remainder)
}

/// `process_ndjson_buffer(service, buffer, chunk_text, previous_usage)`:
/// records delimited by `\n`.
pub fn process_ndjson_buffer(
    service: &str,
    buffer: &str,
    chunk_text: &str,
    previous_usage: Option<Value>,
) -> (Option<Value>, String) {
    if chunk_text.is_empty() {
        return (previous_usage, buffer.to_string());
    }

    let text = format!("{buffer}{chunk_text}");
    let has_trailing_newline = text.ends_with('\n');
    let mut lines: Vec<&str> = text.split('\n').collect();
    let remainder = if has_trailing_newline {
        lines.pop();
        String::new()
    } else {
        lines.pop().unwrap_or("").to_string()
    };

    let mut latest = previous_usage;
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(payload) = serde_json::from_str::<Value>(trimmed) {
            if let Some(usage) = extract_usage_from_payload(service, &payload) {
                latest = Some(usage);
            }
        }
    }
    (latest, remainder)
}

/// Whole-body fallback used when the stream ends and no incremental usage
/// was found yet, or for a non-streamed response (spec §4.E shape 1).
pub fn extract_usage_from_response(service: &str, body: &[u8]) -> UsageRecord {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return normalize_usage(service, None);
    }

    let raw_usage = if trimmed.starts_with("event:") || trimmed.contains("\ndata:") {
        extract_from_sse_whole(service, trimmed)
    } else {
        serde_json::from_str::<Value>(trimmed)
            .ok()
            .and_then(|payload| extract_usage_from_payload(service, &payload))
    };

    normalize_usage(service, raw_usage.as_ref())
}

fn extract_from_sse_whole(service: &str, text: &str) -> Option<Value> {
    let mut latest = None;
    for chunk in text.split("\n\n") {
        for data_line in extract_data_lines(chunk) {
            if let Some(usage) = try_usage_from_data_line(service, &data_line) {
                latest = Some(usage);
            }
        }
    }
    latest
}

/// In-memory sum accumulator across entries sharing `(service, channel)`
/// (spec §4.E, last paragraph). Not persisted: `history_usage.json` is the
/// admin UI's responsibility per spec §6.
#[derive(Default)]
pub struct UsageAggregator {
    totals: BTreeMap<(String, String), Metrics>,
}

impl UsageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, service: &str, channel: &str, metrics: &Metrics) {
        let entry = self
            .totals
            .entry((service.to_string(), channel.to_string()))
            .or_default();
        for key in METRIC_KEYS {
            let delta = metrics.get(key);
            entry.add(key, delta);
        }
    }

    pub fn totals_for(&self, service: &str, channel: &str) -> Metrics {
        self.totals
            .get(&(service.to_string(), channel.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn claude_mapping_defaults_total_to_input_plus_output() {
        let raw = json!({"input_tokens": 10, "output_tokens": 5});
        let record = normalize_usage("claude", Some(&raw));
        assert_eq!(record.metrics.input, 10);
        assert_eq!(record.metrics.output, 5);
        assert_eq!(record.metrics.total, 15);
    }

    #[test]
    fn codex_mapping_reads_nested_details() {
        let raw = json!({
            "input_tokens": 10,
            "input_tokens_details": {"cached_tokens": 4},
            "output_tokens": 5,
            "output_tokens_details": {"reasoning_tokens": 2}
        });
        let record = normalize_usage("codex", Some(&raw));
        assert_eq!(record.metrics.cached_read, 4);
        assert_eq!(record.metrics.reasoning, 2);
    }

    #[test]
    fn normalize_usage_record_is_idempotent() {
        let raw = json!({"input_tokens": 10, "output_tokens": 5});
        let once = normalize_usage("claude", Some(&raw));
        let twice = normalize_usage_record("claude", &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn sse_two_events_last_usage_wins() {
        let chunk = "data: {\"usage\":{\"output_tokens\":10}}\n\ndata: {\"usage\":{\"output_tokens\":25}}\n\n";
        let (usage, remainder) = process_sse_buffer("codex", "", chunk, None);
        assert_eq!(remainder, "");
        let normalized = normalize_usage("codex", usage.as_ref());
        assert_eq!(normalized.metrics.output, 25);
    }

    #[test]
    fn sse_chunk_boundary_is_robust() {
        let whole = "data: {\"usage\":{\"output_tokens\":25}}\n\n";
        let (whole_usage, _) = process_sse_buffer("codex", "", whole, None);

        let part_a = "data: {\"usage\":{\"outpu";
        let part_b = "t_tokens\":25}}";
        let part_c = "\n\n";
        let (u1, rem1) = process_sse_buffer("codex", "", part_a, None);
        assert!(u1.is_none());
        let (u2, rem2) = process_sse_buffer("codex", &rem1, part_b, u1);
        assert!(u2.is_none());
        let (u3, _) = process_sse_buffer("codex", &rem2, part_c, u2);

        assert_eq!(
            normalize_usage("codex", whole_usage.as_ref()).metrics,
            normalize_usage("codex", u3.as_ref()).metrics
        );
    }

    #[test]
    fn ndjson_residual_buffer_across_chunks() {
        let (usage1, remainder) =
            process_ndjson_buffer("codex", "", "{\"usage\":{\"output_tok", None);
        assert!(usage1.is_none());
        let (usage2, remainder2) =
            process_ndjson_buffer("codex", &remainder, "ens\":7}}\n", usage1);
        assert_eq!(remainder2, "");
        assert_eq!(normalize_usage("codex", usage2.as_ref()).metrics.output, 7);
    }

    #[test]
    fn aggregator_sums_across_requests() {
        let mut agg = UsageAggregator::new();
        agg.record("codex", "primary", &Metrics { output: 5, ..Default::default() });
        agg.record("codex", "primary", &Metrics { output: 7, ..Default::default() });
        assert_eq!(agg.totals_for("codex", "primary").output, 12);
    }

    #[test]
    fn whole_json_fallback_extracts_usage() {
        let body = br#"{"usage": {"input_tokens": 3, "output_tokens": 4}}"#;
        let record = extract_usage_from_response("claude", body);
        assert_eq!(record.metrics.input, 3);
        assert_eq!(record.metrics.output, 4);
    }
}
