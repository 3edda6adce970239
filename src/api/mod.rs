//! Session-scoped HTTP API.
//!
//! A deliberately small HTTP/1.1 server over `std::net::TcpListener` on its
//! own thread. Requests are bearer-token authenticated (random 32-byte
//! token generated at spawn, optionally written 0600 to a token file) and,
//! when bound to loopback, refused from non-loopback peers. Session routes
//! delegate to the shared [`SessionRegistry`]; boundary rejections map to
//! 4xx responses carrying the stable rejection code.

use anyhow::{anyhow, Result};
use rand::RngCore;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::registry::{CreateSession, SessionRegistry};
use crate::rejection_code;

const MAX_REQUEST_BYTES: usize = 65536;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub token_path: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8791".to_string(),
            token_path: None,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    pub token: String,
    pub token_path: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    registry: Arc<SessionRegistry>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, registry: Arc<SessionRegistry>) -> Self {
        Self { cfg, registry }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let mut token_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token_bytes);
        let token = hex::encode(token_bytes);
        if let Some(path) = &self.cfg.token_path {
            write_token_file(path, &token)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let registry = self.registry;
        let token_path = self.cfg.token_path;
        let token_thread = token.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, registry, &token_thread, shutdown_thread) {
                log::error!("scoring api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            token,
            token_path,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    token: &str,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &registry, token) {
                    log::warn!("scoring api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    registry: &Arc<SessionRegistry>,
    token: &str,
) -> Result<()> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;

    if request.path == "/health" {
        if request.method != "GET" {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
            return Ok(());
        }
        write_json_response(&mut stream, 200, r#"{"status":"ok"}"#)?;
        return Ok(());
    }

    if request.has_query_token() {
        write_json_response(
            &mut stream,
            400,
            r#"{"error":"token_query_param_not_allowed"}"#,
        )?;
        return Ok(());
    }

    let presented = match request.bearer_token() {
        Some(presented) => presented,
        None => {
            write_json_response(&mut stream, 401, r#"{"error":"missing_token"}"#)?;
            return Ok(());
        }
    };
    if presented != token {
        write_json_response(&mut stream, 401, r#"{"error":"invalid_token"}"#)?;
        return Err(anyhow!("bearer token mismatch"));
    }

    route(&mut stream, registry, &request)
}

fn route(
    stream: &mut TcpStream,
    registry: &Arc<SessionRegistry>,
    request: &HttpRequest,
) -> Result<()> {
    let segments: Vec<&str> = request.path.split('/').filter(|s| !s.is_empty()).collect();

    match (request.method.as_str(), segments.as_slice()) {
        ("POST", ["v1", "sessions"]) => {
            let req: CreateSession = match serde_json::from_slice(&request.body) {
                Ok(req) => req,
                Err(err) => return write_bad_body(stream, &err),
            };
            match registry.create_session(req) {
                Ok(report) => write_json_value(stream, 201, &serde_json::to_value(&report)?),
                Err(err) => write_rejection(stream, &err),
            }
        }
        ("POST", ["v1", "sessions", session_id, "events"]) => {
            let payload = match crate::transport::parse_detection_payload(&request.body) {
                Ok(payload) => payload,
                Err(err) => return write_bad_body(stream, &err),
            };
            match registry.submit(payload.into_event(session_id)) {
                Ok(Some(result)) => {
                    write_json_value(stream, 200, &json!({ "classification": result }))
                }
                Ok(None) => write_json_value(
                    stream,
                    200,
                    &json!({ "classification": null, "ignored": true }),
                ),
                Err(err) => write_rejection(stream, &err),
            }
        }
        ("POST", ["v1", "sessions", session_id, "complete"]) => {
            match registry.complete(session_id) {
                Ok(report) => write_json_value(stream, 200, &serde_json::to_value(&report)?),
                Err(err) => write_rejection(stream, &err),
            }
        }
        ("POST", ["v1", "sessions", session_id, "fail"]) => {
            let reason = serde_json::from_slice::<serde_json::Value>(&request.body)
                .ok()
                .and_then(|v| v.get("reason").and_then(|r| r.as_str()).map(String::from))
                .unwrap_or_else(|| "failed by caller".to_string());
            match registry.fail(session_id, &reason) {
                Ok(report) => write_json_value(stream, 200, &serde_json::to_value(&report)?),
                Err(err) => write_rejection(stream, &err),
            }
        }
        ("GET", ["v1", "sessions", session_id, "results"]) => {
            let include_log = request.query_flag("log");
            match registry.results(session_id, include_log) {
                Ok(report) => write_json_value(stream, 200, &serde_json::to_value(&report)?),
                Err(err) => write_rejection(stream, &err),
            }
        }
        ("GET", ["v1", "sessions"]) => match registry.list() {
            Ok(listed) => write_json_value(stream, 200, &json!({ "sessions": listed })),
            Err(err) => write_rejection(stream, &err),
        },
        ("GET" | "POST", _) => write_json_response(stream, 404, r#"{"error":"not_found"}"#),
        _ => write_json_response(stream, 405, r#"{"error":"method_not_allowed"}"#),
    }
}

fn write_bad_body(stream: &mut TcpStream, err: &dyn std::fmt::Display) -> Result<()> {
    let body = json!({ "error": "input.body", "message": format!("{}", err) });
    write_json_value(stream, 400, &body)
}

/// Boundary rejections map to 4xx with the stable code; anything else is a
/// 500 and gets logged, not leaked.
fn write_rejection(stream: &mut TcpStream, err: &anyhow::Error) -> Result<()> {
    match rejection_code(err) {
        Some(code) => {
            let status = match code {
                "session.unknown" => 404,
                "session.exists" | "session.not_accepting" => 409,
                _ => 400,
            };
            let body = json!({ "error": code, "message": format!("{}", err) });
            write_json_value(stream, status, &body)
        }
        None => {
            log::error!("scoring api internal error: {:#}", err);
            write_json_response(stream, 500, r#"{"error":"internal"}"#)
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            match data.windows(4).position(|w| w == b"\r\n\r\n") {
                Some(pos) => break pos + 4,
                None => return Err(anyhow!("connection closed mid-request")),
            }
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .map(|v| v.parse())
        .transpose()
        .map_err(|_| anyhow!("invalid content-length"))?
        .unwrap_or(0);
    if header_end + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    while data.len() < header_end + content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        data.extend_from_slice(&buf[..n]);
    }
    let body = data[header_end..header_end + content_length].to_vec();

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn write_json_value(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        201 => "HTTP/1.1 201 Created",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    raw_path: String,
    body: Vec<u8>,
}

impl HttpRequest {
    fn bearer_token(&self) -> Option<String> {
        if let Some(value) = self.headers.get("authorization") {
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() == 2 && parts[0].eq_ignore_ascii_case("bearer") {
                return Some(parts[1].to_string());
            }
        }
        None
    }

    fn has_query_token(&self) -> bool {
        if let Some(query) = self.raw_path.split('?').nth(1) {
            for pair in query.split('&') {
                if let Some((k, _)) = pair.split_once('=') {
                    if k == "token" {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn query_flag(&self, name: &str) -> bool {
        if let Some(query) = self.raw_path.split('?').nth(1) {
            for pair in query.split('&') {
                let (k, v) = pair.split_once('=').unwrap_or((pair, "1"));
                if k == name {
                    return v == "1" || v == "true";
                }
            }
        }
        false
    }
}

fn write_token_file(path: &Path, token: &str) -> Result<()> {
    std::fs::write(path, format!("{token}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}
