use std::{
    fs,
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tempfile::TempDir;

struct UpstreamServer {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    port: u16,
}

impl UpstreamServer {
    fn spawn(port: u16, status: u16, body: &'static str) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let handle = thread::spawn(move || {
            let listener = TcpListener::bind(("127.0.0.1", port))
                .expect("failed to bind upstream server");
            listener
                .set_nonblocking(true)
                .expect("failed to set nonblocking upstream listener");

            while !stop.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = handle_upstream_conn(&mut stream, status, body);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            shutdown,
            handle: Some(handle),
            port,
        }
    }
}

impl Drop for UpstreamServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_upstream_conn(stream: &mut TcpStream, status: u16, body: &'static str) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 2048];
    let _ = stream.read(&mut buf)?;

    let reason = if status == 200 { "OK" } else { "ERR" };
    let resp = format!(
        "HTTP/1.1 {status} {reason}\r\ncontent-length: {}\r\ncontent-type: text/plain\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(resp.as_bytes())?;
    stream.flush()?;
    Ok(())
}

struct GatewayProcess {
    child: Child,
}

impl GatewayProcess {
    fn spawn(config_path: &Path) -> Self {
        let child = Command::new(resolve_gateway_binary())
            .env("CLP_GATEWAY_CONFIG", config_path)
            .env("RUST_LOG", "error")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn clp-gateway");
        Self { child }
    }

    fn wait_until_listening(&self, port: u16) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if TcpStream::connect(("127.0.0.1", port)).is_ok() {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("clp-gateway did not start listening on port {port}");
    }
}

fn resolve_gateway_binary() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_clp-gateway") {
        return PathBuf::from(path);
    }

    let mut candidate = std::env::current_exe()
        .expect("failed to resolve current test binary path")
        .parent()
        .expect("missing test binary parent")
        .parent()
        .expect("missing target debug parent")
        .join("clp-gateway");
    if cfg!(windows) {
        candidate.set_extension("exe");
    }

    if candidate.exists() {
        return candidate;
    }

    panic!(
        "unable to locate clp-gateway binary: tried CARGO_BIN_EXE_clp-gateway and {}",
        candidate.display()
    );
}

impl Drop for GatewayProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn reserve_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("failed to bind random port")
        .local_addr()
        .expect("failed to get local addr")
        .port()
}

fn write_gateway_config(dir: &TempDir, proxy_port: u16, service: &str) -> PathBuf {
    let data_dir = dir.path().join("clp-home");
    let cfg = format!(
        r#"[server]
bind_host = "127.0.0.1"
health_path = "/healthz"
data_dir = "{data_dir}"

[observability]
log_level = "error"
access_log = false

[[service]]
name = "{service}"
port = {proxy_port}
lb_mode = "weight-based"
failure_threshold = 1
auto_reset_on_all_failed = false
"#,
        data_dir = data_dir.to_string_lossy(),
    );
    let path = dir.path().join("gateway.toml");
    fs::write(&path, cfg).expect("failed to write gateway config");
    path
}

fn write_upstream_configs(dir: &TempDir, service: &str, entries: &str) {
    let data_dir = dir.path().join("clp-home");
    fs::create_dir_all(&data_dir).expect("failed to create data dir");
    fs::write(data_dir.join(format!("{service}.json")), entries)
        .expect("failed to write upstream config file");
}

fn write_endpoint_filter(dir: &TempDir, service: &str, rules_json: &str) {
    let data_dir = dir.path().join("clp-home");
    fs::create_dir_all(&data_dir).expect("failed to create data dir");
    fs::write(data_dir.join(format!("endpoint_filter_{service}.json")), rules_json)
        .expect("failed to write endpoint filter file");
}

fn send_get(port: u16, path: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("failed to connect to gateway");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("failed to set read timeout");
    let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream
        .write_all(req.as_bytes())
        .expect("failed to write request");
    stream.flush().expect("failed to flush request");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .expect("failed to read response");
    response
}

#[test]
fn routes_request_to_configured_upstream() {
    let upstream_port = reserve_port();
    let _upstream = UpstreamServer::spawn(upstream_port, 200, "hello from upstream");
    let proxy_port = reserve_port();
    let tmp = TempDir::new().expect("failed to create temp dir");
    write_upstream_configs(
        &tmp,
        "demo",
        &format!(
            r#"{{"primary": {{"base_url": "http://127.0.0.1:{upstream_port}", "auth_token": "tok", "weight": 1.0, "active": true}}}}"#
        ),
    );
    let cfg_path = write_gateway_config(&tmp, proxy_port, "demo");

    let gateway = GatewayProcess::spawn(&cfg_path);
    gateway.wait_until_listening(proxy_port);
    let response = send_get(proxy_port, "/v1/chat");

    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    assert!(
        response.contains("hello from upstream"),
        "response: {response}"
    );
}

#[test]
fn endpoint_filter_blocks_matching_path() {
    let upstream_port = reserve_port();
    let _upstream = UpstreamServer::spawn(upstream_port, 200, "unused");
    let proxy_port = reserve_port();
    let tmp = TempDir::new().expect("failed to create temp dir");
    write_upstream_configs(
        &tmp,
        "demo",
        &format!(
            r#"{{"primary": {{"base_url": "http://127.0.0.1:{upstream_port}", "auth_token": "tok", "weight": 1.0, "active": true}}}}"#
        ),
    );
    write_endpoint_filter(
        &tmp,
        "demo",
        r#"{"enabled": true, "rules": [
            {"id": "block-admin", "prefix": "/admin", "action": {"type": "block", "status": 403, "message": "no admin access"}}
        ]}"#,
    );
    let cfg_path = write_gateway_config(&tmp, proxy_port, "demo");

    let gateway = GatewayProcess::spawn(&cfg_path);
    gateway.wait_until_listening(proxy_port);
    let response = send_get(proxy_port, "/admin/users");

    assert!(response.starts_with("HTTP/1.1 403"), "response: {response}");
    assert!(
        response.contains("ENDPOINT_BLOCKED"),
        "response: {response}"
    );
}

#[test]
fn fails_over_to_next_weighted_candidate_after_threshold() {
    let unreachable_port = reserve_port();
    let healthy_port = reserve_port();
    let _healthy = UpstreamServer::spawn(healthy_port, 200, "served by failover");
    let proxy_port = reserve_port();
    let tmp = TempDir::new().expect("failed to create temp dir");
    write_upstream_configs(
        &tmp,
        "demo",
        &format!(
            r#"{{
                "primary": {{"base_url": "http://127.0.0.1:{unreachable_port}", "auth_token": "tok", "weight": 10.0, "active": false}},
                "backup": {{"base_url": "http://127.0.0.1:{healthy_port}", "auth_token": "tok", "weight": 1.0, "active": false}}
            }}"#
        ),
    );
    let cfg_path = write_gateway_config(&tmp, proxy_port, "demo");

    let gateway = GatewayProcess::spawn(&cfg_path);
    gateway.wait_until_listening(proxy_port);
    let response = send_get(proxy_port, "/v1/chat");

    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    assert!(
        response.contains("served by failover"),
        "response: {response}"
    );
}
