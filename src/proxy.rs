//! Proxy dispatcher (spec §4.H): orchestrates one client request through the
//! endpoint filter, routing table, config store, and load-balancer state,
//! streams the upstream response back while feeding the usage parser and
//! realtime hub, and finalizes a traffic-log entry on every exit path.
//! Grounded on `original_source/src/core/base_proxy.py::proxy()` for the
//! state machine, mapped onto `pingora::proxy::ProxyHttp`'s hook set the way
//! `examples/inteniquetic-prx/src/proxy.rs` maps its own load-balancing state
//! machine onto the same hooks.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use pingora::prelude::*;
use serde_json::{Value, json};
use tracing::{error, warn};

use crate::config::{GatewayConfig, LbMode, ServiceEndpoint};
use crate::endpoint_filter::{EndpointFilter, parse_query};
use crate::headers::HeaderFilter;
use crate::lb::{LbState, order_by_weight};
use crate::metrics;
use crate::realtime::{Event, RealtimeHub, SwitchReason};
use crate::routing::RoutingTable;
use crate::store::ConfigStore;
use crate::traffic_log::{LogEntry, TrafficLog, encode_body, encode_response_body};
use crate::usage::{
    UsageAggregator, UsageRecord, extract_usage_from_response, normalize_usage,
    process_ndjson_buffer, process_sse_buffer,
};

const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
const WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn plain_status_error(status: u16, msg: String) -> Box<Error> {
    let result: Result<()> = Error::e_explain(HTTPStatus(status), msg);
    result.expect_err("e_explain always returns Err")
}

fn retryable_status_error(status: u16, msg: String) -> Box<Error> {
    let mut err = plain_status_error(status, msg);
    err.set_retry(true);
    err
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UsageMode {
    Sse,
    Ndjson,
    Whole,
}

/// One `GatewayProxy` fronts exactly one logical service (one listening port,
/// one `<service>.json` config pool) — spec §6's per-service port model.
pub struct GatewayProxy {
    service: String,
    /// The static per-service block this proxy was constructed with;
    /// falls back to this if a reload ever drops the service entry
    /// entirely (spec §7: internal component failure degrades to "no
    /// effect" rather than failing the request).
    default_endpoint: ServiceEndpoint,
    runtime_config: Arc<ArcSwap<GatewayConfig>>,
    config_store: Arc<ConfigStore>,
    routing: Arc<RoutingTable>,
    endpoint_filter: Arc<EndpointFilter>,
    header_filter: Arc<HeaderFilter>,
    lb: Arc<LbState>,
    traffic_log: Arc<TrafficLog>,
    hub: Arc<RealtimeHub>,
    usage_aggregator: Mutex<UsageAggregator>,
}

impl GatewayProxy {
    pub fn new(
        endpoint: &ServiceEndpoint,
        runtime_config: Arc<ArcSwap<GatewayConfig>>,
        config_store: Arc<ConfigStore>,
        routing: Arc<RoutingTable>,
        endpoint_filter: Arc<EndpointFilter>,
        header_filter: Arc<HeaderFilter>,
        lb: Arc<LbState>,
        traffic_log: Arc<TrafficLog>,
        hub: Arc<RealtimeHub>,
    ) -> Self {
        Self {
            service: endpoint.name.clone(),
            default_endpoint: endpoint.clone(),
            runtime_config,
            config_store,
            routing,
            endpoint_filter,
            header_filter,
            lb,
            traffic_log,
            hub,
            usage_aggregator: Mutex::new(UsageAggregator::new()),
        }
    }

    /// Re-reads the service's static settings from the latest hot-reloaded
    /// snapshot (SPEC_FULL §0: static layer is hot-reloadable via a
    /// filesystem watcher), falling back to the construction-time values.
    fn current_endpoint(&self) -> ServiceEndpoint {
        self.runtime_config
            .load()
            .services
            .iter()
            .find(|svc| svc.name == self.service)
            .cloned()
            .unwrap_or_else(|| self.default_endpoint.clone())
    }

    fn max_logged_response_bytes(&self) -> usize {
        self.runtime_config.load().server.max_logged_response_bytes
    }

    fn access_log_enabled(&self) -> bool {
        self.runtime_config.load().observability.access_log
    }

    fn max_request_body_bytes(&self) -> usize {
        self.runtime_config.load().server.max_request_body_bytes
    }

    fn visible_names(&self) -> Vec<String> {
        self.config_store.configs().into_iter().map(|(name, _)| name).collect()
    }

    fn weights(&self) -> BTreeMap<String, f64> {
        self.config_store
            .configs()
            .into_iter()
            .map(|(name, entry)| (name, entry.weight))
            .collect()
    }

    /// Builds the round-1 candidate ordering per spec §4.H step 6.
    fn initial_ordering(&self, lb_mode: LbMode, override_config: Option<&str>) -> Vec<String> {
        if let Some(name) = override_config {
            return vec![name.to_string()];
        }
        match lb_mode {
            LbMode::ActiveFirst => self
                .config_store
                .active_config()
                .map(|(name, _)| vec![name])
                .unwrap_or_default(),
            LbMode::WeightBased => {
                let ordered = order_by_weight(&self.weights());
                self.lb.candidates(&ordered)
            }
        }
    }

    fn emit(&self, event: Event) {
        self.hub.emit(event);
    }

    fn classify_switch_reason(&self, ctx: &RequestCtx) -> SwitchReason {
        if ctx.last_status_code.is_some() {
            SwitchReason::HttpNon2xx
        } else {
            SwitchReason::RequestError
        }
    }
}

pub struct RequestCtx {
    request_id: String,
    started_at: Instant,
    method: String,
    path: String,
    query: BTreeMap<String, String>,
    original_headers: Value,
    original_body: BytesMut,
    filtered_body: Option<Bytes>,
    override_config: Option<String>,
    stream_mode: bool,

    ordering: Vec<String>,
    round: u8,
    candidate: Option<String>,
    previous_candidate: Option<String>,
    attempt: u32,

    started_event_sent: bool,
    streaming_event_sent: bool,
    resolved: bool,
    blocked: bool,
    blocked_rule_id: Option<String>,
    blocked_reason: Option<String>,

    last_status_code: Option<u16>,
    target_headers: Option<Value>,

    usage_mode: UsageMode,
    usage_buffer: String,
    usage_last: Option<Value>,
    log_body: BytesMut,
    log_truncated: bool,

    final_usage: Option<UsageRecord>,
}

impl Default for RequestCtx {
    fn default() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            started_at: Instant::now(),
            method: String::new(),
            path: String::new(),
            query: BTreeMap::new(),
            original_headers: Value::Null,
            original_body: BytesMut::new(),
            filtered_body: None,
            override_config: None,
            stream_mode: false,
            ordering: Vec::new(),
            round: 0,
            candidate: None,
            previous_candidate: None,
            attempt: 0,
            started_event_sent: false,
            streaming_event_sent: false,
            resolved: false,
            blocked: false,
            blocked_rule_id: None,
            blocked_reason: None,
            last_status_code: None,
            target_headers: None,
            usage_mode: UsageMode::Whole,
            usage_buffer: String::new(),
            usage_last: None,
            log_body: BytesMut::new(),
            log_truncated: false,
            final_usage: None,
        }
    }
}

fn headers_to_json(headers: &http::HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        let text = value.to_str().unwrap_or("<binary>").to_string();
        map.insert(name.as_str().to_string(), Value::String(text));
    }
    Value::Object(map)
}

#[async_trait]
impl ProxyHttp for GatewayProxy {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        Self::CTX::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let req = session.req_header();
        ctx.method = req.method.to_string();
        ctx.path = req.uri.path().to_string();
        ctx.query = parse_query(req.uri.query());
        ctx.original_headers = headers_to_json(&req.headers);

        let accept = req
            .headers
            .get(http::header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let stainless = req
            .headers
            .get("x-stainless-helper-method")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        ctx.stream_mode = accept.contains("text/event-stream") || stainless.contains("stream");

        if let Some(hit) = self
            .endpoint_filter
            .matches(&self.service, &ctx.method, &ctx.path, &ctx.query)
        {
            ctx.blocked = true;
            ctx.blocked_rule_id = hit.rule_id.clone();
            ctx.blocked_reason = Some(hit.message.clone());

            self.emit(Event::RequestStarted {
                id: ctx.request_id.clone(),
                method: ctx.method.clone(),
                path: ctx.path.clone(),
                channel: Some("blocked".to_string()),
                headers: ctx.original_headers.clone(),
                target_url: None,
            });
            self.emit(Event::RequestCompleted {
                id: ctx.request_id.clone(),
                status_code: Some(hit.status),
                duration_ms: ctx.started_at.elapsed().as_millis() as u64,
                success: false,
            });

            let body = json!({
                "error": "ENDPOINT_BLOCKED",
                "status": hit.status,
                "message": hit.message,
                "rule_id": hit.rule_id,
                "service": self.service,
            });
            let encoded = serde_json::to_vec(&body).unwrap_or_default();
            session.respond_error_with_body(hit.status, Bytes::from(encoded)).await?;

            let usage = normalize_usage(&self.service, None);
            self.traffic_log.append(&LogEntry {
                id: ctx.request_id.clone(),
                timestamp: now_epoch_seconds(),
                service: self.service.clone(),
                method: ctx.method.clone(),
                path: ctx.path.clone(),
                status_code: Some(hit.status),
                duration_ms: ctx.started_at.elapsed().as_millis() as u64,
                channel: None,
                target_headers: None,
                filtered_body: None,
                original_headers: Some(ctx.original_headers.clone()),
                original_body: None,
                response_content: None,
                response_truncated: None,
                response_bytes: None,
                usage: (&usage).into(),
                blocked: Some(true),
                blocked_by: ctx.blocked_rule_id.clone(),
                blocked_reason: ctx.blocked_reason.clone(),
            });

            return Ok(true);
        }

        Ok(false)
    }

    async fn request_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let Some(chunk) = body.take() {
            let limit = self.max_request_body_bytes();
            if ctx.original_body.len() + chunk.len() > limit {
                return Err(plain_status_error(
                    413,
                    format!("request body exceeds {limit} byte limit"),
                ));
            }
            ctx.original_body.extend_from_slice(&chunk);
        }

        if !end_of_stream {
            *body = Some(Bytes::new());
            return Ok(());
        }

        let original = ctx.original_body.clone().freeze();
        let active_name = self.config_store.active_config().map(|(name, _)| name);
        let visible = self.visible_names();
        let result = self.routing.apply(original, active_name.as_deref(), &visible);
        ctx.override_config = result.override_config;
        ctx.filtered_body = Some(result.body.clone());
        *body = Some(result.body);
        Ok(())
    }

    async fn upstream_peer(&self, _session: &mut Session, ctx: &mut Self::CTX) -> Result<Box<HttpPeer>> {
        let endpoint = self.current_endpoint();
        if ctx.round == 0 {
            ctx.round = 1;
            ctx.ordering = self.initial_ordering(endpoint.lb_mode, ctx.override_config.as_deref());
        }

        let (name, entry) = loop {
            if ctx.ordering.is_empty() {
                if ctx.round == 1
                    && ctx.override_config.is_none()
                    && endpoint.lb_mode == LbMode::WeightBased
                {
                    if endpoint.auto_reset_on_all_failed && self.lb.try_reset() {
                        self.emit(Event::LbReset {
                            id: ctx.request_id.clone(),
                            reason: "all configs excluded".to_string(),
                            total_configs: self.visible_names().len(),
                            threshold: self.lb.threshold(),
                        });
                        ctx.round = 2;
                        ctx.ordering = order_by_weight(&self.weights());
                        continue;
                    } else {
                        let reason = if endpoint.auto_reset_on_all_failed {
                            "all configs excluded, cooldown not elapsed".to_string()
                        } else {
                            "all configs excluded, auto-reset disabled".to_string()
                        };
                        self.emit(Event::LbExhausted {
                            id: ctx.request_id.clone(),
                            reason,
                            total_configs: self.visible_names().len(),
                            threshold: self.lb.threshold(),
                            cooldown_seconds: self.lb.reset_cooldown_seconds(),
                            cooldown_remaining_seconds: self.lb.cooldown_remaining_seconds(),
                        });
                        return Error::e_explain(
                            HTTPStatus(503),
                            "NO_HEALTHY_UPSTREAM: every upstream config is currently excluded",
                        );
                    }
                }
                let status = ctx.last_status_code.unwrap_or(500);
                return Error::e_explain(
                    HTTPStatus(status),
                    format!("service '{}' has no reachable upstream configs", self.service),
                );
            }

            let candidate = ctx.ordering.remove(0);
            match self.config_store.configs().get(&candidate).cloned() {
                Some(entry) => break (candidate, entry),
                None => {
                    // Config vanished between ordering and dispatch (concurrent
                    // edit); skip it and try the next candidate in this round.
                    continue;
                }
            }
        };

        if let Some(prev) = &ctx.previous_candidate {
            if prev != &name {
                self.emit(Event::LbSwitch {
                    id: ctx.request_id.clone(),
                    from: Some(prev.clone()),
                    to: name.clone(),
                    reason: self.classify_switch_reason(ctx),
                    failures: self.lb.snapshot_failures(&name),
                    threshold: self.lb.threshold(),
                    attempt: ctx.attempt,
                    path: ctx.path.clone(),
                });
            }
        }

        ctx.candidate = Some(name.clone());
        ctx.attempt += 1;

        if !ctx.started_event_sent {
            self.emit(Event::RequestStarted {
                id: ctx.request_id.clone(),
                method: ctx.method.clone(),
                path: ctx.path.clone(),
                channel: Some(name.clone()),
                headers: ctx.original_headers.clone(),
                target_url: Some(entry.base_url.clone()),
            });
            ctx.started_event_sent = true;
        }

        let url = url::Url::parse(&entry.base_url)
            .map_err(|e| plain_status_error(500, format!("invalid base_url: {e}")))?;
        let tls = url.scheme() == "https";
        let host = url.host_str().unwrap_or("localhost").to_string();
        let port = url.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });

        let mut peer = HttpPeer::new((host.as_str(), port), tls, host.clone());
        peer.options.connection_timeout = Some(CONNECT_TIMEOUT);
        peer.options.write_timeout = Some(WRITE_TIMEOUT);
        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(name) = ctx.candidate.clone() else {
            return Ok(());
        };
        let Some(entry) = self.config_store.configs().get(&name).cloned() else {
            return Ok(());
        };

        let blocked = self.header_filter.blocked_headers();
        upstream_request.remove_header("authorization");
        upstream_request.remove_header("host");
        upstream_request.remove_header("content-length");
        for blocked_name in &blocked {
            upstream_request.remove_header(blocked_name.as_str());
        }

        let base_url = url::Url::parse(&entry.base_url)
            .map_err(|e| plain_status_error(500, format!("invalid base_url: {e}")))?;
        let host = base_url.host_str().unwrap_or("localhost");
        upstream_request.insert_header("host", host)?;
        upstream_request.insert_header("connection", "keep-alive")?;

        if let Some(token) = &entry.auth_token {
            upstream_request.insert_header("authorization", format!("Bearer {token}"))?;
        }
        if let Some(key) = &entry.api_key {
            upstream_request.insert_header("x-api-key", key.as_str())?;
        }
        if let Some(body) = &ctx.filtered_body {
            upstream_request.insert_header("content-length", body.len().to_string())?;
        }

        ctx.target_headers = Some(headers_to_json(&upstream_request.headers));
        Ok(())
    }

    async fn upstream_response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let status = upstream_response.status.as_u16();
        ctx.last_status_code = Some(status);
        let success = matches!(status, 200..=299 | 304 | 307);

        let visible = self.visible_names();
        self.lb.record(ctx.candidate.as_deref(), Some(status), &visible);
        metrics::set_excluded_configs(&self.service, self.lb.excluded_count() as i64);

        if success {
            ctx.resolved = true;
            upstream_response.remove_header("connection");
            upstream_response.remove_header("transfer-encoding");

            let content_type = upstream_response
                .headers
                .get(http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            ctx.usage_mode = if content_type.contains("event-stream") {
                UsageMode::Sse
            } else if content_type.contains("ndjson") {
                UsageMode::Ndjson
            } else {
                UsageMode::Whole
            };
            return Ok(());
        }

        ctx.previous_candidate = ctx.candidate.take();
        Err(retryable_status_error(
            status,
            format!("upstream returned non-2xx status {status}, trying next candidate"),
        ))
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<std::time::Duration>> {
        if !ctx.resolved {
            return Ok(None);
        }

        if !ctx.streaming_event_sent {
            self.emit(Event::RequestStreaming {
                id: ctx.request_id.clone(),
                elapsed_ms: ctx.started_at.elapsed().as_millis() as u64,
            });
            ctx.streaming_event_sent = true;
        }

        if let Some(chunk) = body {
            if !chunk.is_empty() {
                self.emit(Event::ResponseChunk {
                    id: ctx.request_id.clone(),
                    text: String::from_utf8_lossy(chunk).to_string(),
                    elapsed_ms: ctx.started_at.elapsed().as_millis() as u64,
                });

                let text = String::from_utf8_lossy(chunk).to_string();
                let (latest, remainder) = match ctx.usage_mode {
                    UsageMode::Sse => {
                        process_sse_buffer(&self.service, &ctx.usage_buffer, &text, ctx.usage_last.clone())
                    }
                    UsageMode::Ndjson => {
                        process_ndjson_buffer(&self.service, &ctx.usage_buffer, &text, ctx.usage_last.clone())
                    }
                    UsageMode::Whole => (ctx.usage_last.clone(), format!("{}{}", ctx.usage_buffer, text)),
                };
                ctx.usage_last = latest;
                ctx.usage_buffer = remainder;

                if !ctx.log_truncated {
                    let remaining = self.max_logged_response_bytes().saturating_sub(ctx.log_body.len());
                    if remaining == 0 {
                        ctx.log_truncated = true;
                    } else if chunk.len() > remaining {
                        ctx.log_body.extend_from_slice(&chunk[..remaining]);
                        ctx.log_truncated = true;
                    } else {
                        ctx.log_body.extend_from_slice(chunk);
                    }
                }
            }
        }

        if end_of_stream {
            let flush_terminator = match ctx.usage_mode {
                UsageMode::Sse => "\n\n",
                UsageMode::Ndjson => "\n",
                UsageMode::Whole => "",
            };
            if !flush_terminator.is_empty() && !ctx.usage_buffer.is_empty() {
                let (latest, _) = match ctx.usage_mode {
                    UsageMode::Sse => {
                        process_sse_buffer(&self.service, "", &format!("{}{}", ctx.usage_buffer, flush_terminator), ctx.usage_last.clone())
                    }
                    UsageMode::Ndjson => {
                        process_ndjson_buffer(&self.service, "", &format!("{}{}", ctx.usage_buffer, flush_terminator), ctx.usage_last.clone())
                    }
                    UsageMode::Whole => (ctx.usage_last.clone(), String::new()),
                };
                ctx.usage_last = latest;
            }

            ctx.final_usage = Some(if let Some(usage) = &ctx.usage_last {
                normalize_usage(&self.service, Some(usage))
            } else {
                extract_usage_from_response(&self.service, ctx.usage_buffer.as_bytes())
            });
        }

        Ok(None)
    }

    fn fail_to_connect(
        &self,
        _session: &mut Session,
        _peer: &HttpPeer,
        ctx: &mut Self::CTX,
        mut e: Box<Error>,
    ) -> Box<Error> {
        let visible = self.visible_names();
        self.lb.record(ctx.candidate.as_deref(), None, &visible);
        metrics::set_excluded_configs(&self.service, self.lb.excluded_count() as i64);
        ctx.previous_candidate = ctx.candidate.take();
        e.set_retry(true);
        e
    }

    fn error_while_proxy(
        &self,
        _peer: &HttpPeer,
        _session: &mut Session,
        mut e: Box<Error>,
        ctx: &mut Self::CTX,
        _client_reused: bool,
    ) -> Box<Error> {
        warn!(
            service = %self.service,
            candidate = ctx.candidate.as_deref().unwrap_or("-"),
            error = %e,
            "error while proxying"
        );
        let visible = self.visible_names();
        self.lb.record(ctx.candidate.as_deref(), None, &visible);
        metrics::set_excluded_configs(&self.service, self.lb.excluded_count() as i64);
        if !ctx.resolved {
            ctx.previous_candidate = ctx.candidate.take();
            e.set_retry(true);
        }
        e
    }

    async fn logging(&self, _session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        if ctx.blocked {
            // Already logged and event-completed from `request_filter`.
            return;
        }

        let duration_ms = ctx.started_at.elapsed().as_millis() as u64;
        let status = ctx.last_status_code.or_else(|| {
            e.map(|err| if err.etype().to_string().to_lowercase().contains("timeout") {
                504
            } else {
                502
            })
        });
        let success = matches!(status, Some(200..=299) | Some(304) | Some(307));

        self.emit(Event::RequestCompleted {
            id: ctx.request_id.clone(),
            status_code: status,
            duration_ms,
            success,
        });

        let usage = ctx
            .final_usage
            .clone()
            .unwrap_or_else(|| normalize_usage(&self.service, None));
        if let Some(channel) = &ctx.candidate {
            self.usage_aggregator.lock().expect("usage aggregator poisoned").record(
                &self.service,
                channel,
                &usage.metrics,
            );
        }

        let (response_content, response_truncated, response_bytes) = if ctx.log_body.is_empty() {
            (None, None, None)
        } else {
            let (encoded, truncated) = encode_response_body(&ctx.log_body, self.max_logged_response_bytes());
            (
                Some(encoded),
                Some(truncated || ctx.log_truncated),
                Some(ctx.log_body.len()),
            )
        };

        self.traffic_log.append(&LogEntry {
            id: ctx.request_id.clone(),
            timestamp: now_epoch_seconds(),
            service: self.service.clone(),
            method: ctx.method.clone(),
            path: ctx.path.clone(),
            status_code: status,
            duration_ms,
            channel: ctx.candidate.clone(),
            target_headers: ctx.target_headers.clone(),
            filtered_body: ctx.filtered_body.as_ref().map(|b| encode_body(b)),
            original_headers: Some(ctx.original_headers.clone()),
            original_body: Some(encode_body(&ctx.original_body)),
            response_content,
            response_truncated,
            response_bytes,
            usage: (&usage).into(),
            blocked: None,
            blocked_by: None,
            blocked_reason: None,
        });

        if self.access_log_enabled() {
            if let Some(err) = e {
                error!(
                    service = %self.service,
                    candidate = ctx.candidate.as_deref().unwrap_or("-"),
                    attempt = ctx.attempt,
                    duration_ms,
                    error = %err,
                    "proxy request errored"
                );
            } else {
                tracing::info!(
                    service = %self.service,
                    candidate = ctx.candidate.as_deref().unwrap_or("-"),
                    status = status.unwrap_or(0),
                    attempt = ctx.attempt,
                    duration_ms,
                    "proxy request completed"
                );
            }
        }

        metrics::observe_request(&self.service, status.unwrap_or(0), duration_ms as f64);
    }
}
