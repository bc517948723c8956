//! Thin HTTP surface for submitting jobs and polling their status.
//!
//! - `POST /jobs` with `{"video_key": "..."}` enqueues a job (`202`)
//! - `GET /jobs/<id>` returns the job's status view, or `404`
//! - `GET /health`

use crate::error::PipelineError;
use crate::queue::JobQueue;
use crate::status::JobStatusService;
use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8800".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
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

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    video_key: String,
}

pub struct ApiServer {
    cfg: ApiConfig,
    queue: Arc<dyn JobQueue>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, queue: Arc<dyn JobQueue>) -> Self {
        Self { cfg, queue }
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

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let queue = self.queue;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, queue, shutdown_thread) {
                log::error!("job api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    queue: Arc<dyn JobQueue>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let status = JobStatusService::new(queue.clone());
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, queue.as_ref(), &status) {
                    log::warn!("job api request rejected: {}", err);
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
    queue: &dyn JobQueue,
    status: &JobStatusService,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("POST", "/jobs") => submit_job(&mut stream, queue, &request),
        ("GET", path) if path.starts_with("/jobs/") => {
            job_status(&mut stream, status, &path["/jobs/".len()..])
        }
        (_, "/health" | "/jobs") => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        (_, path) if path.starts_with("/jobs/") => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn submit_job(stream: &mut TcpStream, queue: &dyn JobQueue, request: &HttpRequest) -> Result<()> {
    let submit: SubmitRequest = match serde_json::from_slice(&request.body) {
        Ok(submit) => submit,
        Err(_) => return write_json_response(stream, 400, r#"{"error":"invalid_body"}"#),
    };
    if submit.video_key.trim().is_empty() {
        return write_json_response(stream, 400, r#"{"error":"missing_video_key"}"#);
    }
    match queue.enqueue(submit.video_key.trim()) {
        Ok(id) => {
            log::info!("job {} queued for video '{}'", id, submit.video_key.trim());
            let payload = serde_json::to_vec(&serde_json::json!({
                "job_id": id,
                "status": "queued",
            }))?;
            write_response(stream, 202, "application/json", &payload)
        }
        Err(err) => {
            write_json_response(stream, 503, r#"{"error":"queue_unavailable"}"#)?;
            Err(err.into())
        }
    }
}

fn job_status(stream: &mut TcpStream, status: &JobStatusService, raw_id: &str) -> Result<()> {
    match status.get_status(raw_id) {
        Ok(view) => {
            let payload = serde_json::to_vec(&view)?;
            write_response(stream, 200, "application/json", &payload)
        }
        Err(PipelineError::NotFound(_)) => {
            write_json_response(stream, 404, r#"{"error":"not_found"}"#)
        }
        Err(err) => {
            write_json_response(stream, 503, r#"{"error":"queue_unavailable"}"#)?;
            Err(err.into())
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
            return Err(anyhow!("connection closed before end of headers"));
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

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if header_end + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    while data.len() < header_end + content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        data.extend_from_slice(&buf[..n]);
    }
    let body = data[header_end..header_end + content_length].to_vec();

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
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
        202 => "HTTP/1.1 202 Accepted",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
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
    body: Vec<u8>,
}
