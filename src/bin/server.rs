//! HTTP server for the conversational analytics service
//! Simple HTTP handling over tokio sockets, no web framework.

use askdb::config::Config;
use askdb::execution::{AnalyticEngine, PolarsEngine};
use askdb::llm::OpenAiClient;
use askdb::notify::Notifier;
use askdb::pipeline::{ChatPipeline, ChatRequest};
use askdb::schema::SchemaCache;
use askdb::session::SessionRepository;
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "askdb-server", about = "Conversational analytics API server")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Directory holding the CSV/Parquet tables
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

/// How long /status connections stay open with no events.
const STATUS_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    if config.api_key == "dummy-api-key" {
        warn!("OPENAI_API_KEY not set - completion calls will fail");
    } else {
        info!("OpenAI API key found");
    }

    let engine: Arc<dyn AnalyticEngine> = Arc::new(PolarsEngine::new(config.data_dir.clone()));
    let schema = Arc::new(SchemaCache::new(Arc::clone(&engine)));
    if let Err(err) = schema.refresh().await {
        warn!(error = %err, "initial schema refresh failed");
    }

    let llm = Arc::new(OpenAiClient::new(
        config.api_key.clone(),
        config.base_url.clone(),
        config.request_timeout,
    )?);
    let sessions = Arc::new(SessionRepository::new(config.session_ttl));
    let notifier = Notifier::new();
    let sweep_interval = config.sweep_interval;

    let pipeline = Arc::new(ChatPipeline::new(
        llm,
        engine,
        Arc::clone(&sessions),
        schema,
        notifier.clone(),
        config,
    ));

    // Periodic TTL sweep.
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sessions.evict_expired();
        }
    });

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!(port = args.port, "server listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let pipeline = Arc::clone(&pipeline);
        let notifier = notifier.clone();
        tokio::spawn(async move {
            handle_connection(stream, pipeline, notifier).await;
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    pipeline: Arc<ChatPipeline>,
    notifier: Notifier,
) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };

    let Some((method, full_path, body)) = parse_request(&request) else {
        let response = http_response(400, "Bad Request", r#"{"error":"bad request"}"#, &[]);
        let _ = stream.write_all(response.as_bytes()).await;
        return;
    };

    let (path, query_string) = match full_path.find('?') {
        Some(idx) => (&full_path[..idx], Some(&full_path[idx + 1..])),
        None => (full_path.as_str(), None),
    };
    let path = normalize_path(path);

    // Status streams bypass the single-response flow.
    if method == "GET" {
        if let Some(message_id) = path.strip_prefix("/status/") {
            stream_status(stream, &notifier, message_id).await;
            return;
        }
    }

    let response = match (method.as_str(), path.as_str()) {
        ("OPTIONS", _) => http_response(204, "No Content", "", &[]),
        ("POST", "/chat") => handle_chat(&pipeline, &body).await,
        ("POST", "/refresh-data") => handle_refresh(&pipeline, &body).await,
        ("GET", "/chat-history") => handle_history(&pipeline, query_string).await,
        ("GET", "/health") => handle_health(&pipeline),
        _ => http_response(404, "Not Found", r#"{"error":"not found"}"#, &[]),
    };

    if let Err(err) = stream.write_all(response.as_bytes()).await {
        error!(error = %err, "failed to write response");
    }
}

async fn handle_chat(pipeline: &ChatPipeline, body: &str) -> String {
    let request: ChatRequest = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(err) => {
            return http_response(
                400,
                "Bad Request",
                &serde_json::json!({ "error": format!("invalid request: {}", err) }).to_string(),
                &[],
            );
        }
    };

    if request.message.trim().is_empty() && request.clarification.is_none() {
        return http_response(400, "Bad Request", r#"{"error":"empty query"}"#, &[]);
    }

    let reply = pipeline.handle(request).await;
    let mut extra_headers: Vec<(String, String)> = Vec::new();
    if let Some(ref chat_id) = reply.chat_id {
        extra_headers.push(("X-Chat-Id".to_string(), chat_id.clone()));
        extra_headers.push((
            "Access-Control-Expose-Headers".to_string(),
            "X-Chat-Id".to_string(),
        ));
    }
    let header_refs: Vec<(&str, &str)> = extra_headers
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let status = if reply.error == Some(true) { 500 } else { 200 };
    let reason = if status == 500 {
        "Internal Server Error"
    } else {
        "OK"
    };
    match serde_json::to_string(&reply) {
        Ok(json) => http_response(status, reason, &json, &header_refs),
        Err(err) => http_response(
            500,
            "Internal Server Error",
            &serde_json::json!({ "error": err.to_string() }).to_string(),
            &[],
        ),
    }
}

#[derive(Deserialize)]
struct RefreshRequest {
    sql_query: String,
}

async fn handle_refresh(pipeline: &ChatPipeline, body: &str) -> String {
    let request: RefreshRequest = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(_) => {
            return http_response(
                400,
                "Bad Request",
                r#"{"error":"Missing or invalid sql_query"}"#,
                &[],
            );
        }
    };

    match pipeline.refresh_data(&request.sql_query).await {
        Ok(data) => match serde_json::to_string(&data) {
            Ok(json) => http_response(200, "OK", &json, &[]),
            Err(err) => http_response(
                500,
                "Internal Server Error",
                &serde_json::json!({ "error": err.to_string() }).to_string(),
                &[],
            ),
        },
        Err(askdb::error::AskError::WriteRejected) => http_response(
            400,
            "Bad Request",
            r#"{"error":"Forbidden SQL command"}"#,
            &[],
        ),
        Err(err) => http_response(
            500,
            "Internal Server Error",
            &serde_json::json!({ "error": "SQL error", "detail": err.to_string() }).to_string(),
            &[],
        ),
    }
}

async fn handle_history(pipeline: &ChatPipeline, query_string: Option<&str>) -> String {
    let params = parse_query(query_string);
    let Some(chat_id) = params.get("chatId") else {
        return http_response(400, "Bad Request", r#"{"error":"Missing chatId"}"#, &[]);
    };

    match pipeline.session_snapshot(chat_id).await {
        Some(snapshot) => http_response(200, "OK", &snapshot.to_string(), &[]),
        None => http_response(
            404,
            "Not Found",
            r#"{"error":"Chat session not found"}"#,
            &[],
        ),
    }
}

fn handle_health(pipeline: &ChatPipeline) -> String {
    let body = serde_json::json!({
        "status": "ok",
        "schema": pipeline.schema().freshness(),
        "activeSessions": pipeline.sessions().active_count(),
        "totalCost": (pipeline.sessions().total_cost() * 1e6).round() / 1e6,
    });
    http_response(200, "OK", &body.to_string(), &[])
}

/// Stream status events for one message id as JSON lines until the client
/// goes away or the channel idles out.
async fn stream_status(mut stream: TcpStream, notifier: &Notifier, message_id: &str) {
    let mut rx = notifier.subscribe(message_id);
    let head = "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nAccess-Control-Allow-Origin: *\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n";
    if stream.write_all(head.as_bytes()).await.is_err() {
        notifier.unsubscribe(message_id);
        return;
    }

    loop {
        match timeout(STATUS_IDLE_TIMEOUT, rx.recv()).await {
            Ok(Some(event)) => {
                let Ok(mut line) = serde_json::to_string(&event) else {
                    continue;
                };
                line.push('\n');
                if stream.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    notifier.unsubscribe(message_id);
}

/// Read one HTTP request, honoring Content-Length, with a read timeout.
async fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];

    let read_result = timeout(Duration::from_secs(5), async {
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if let Ok(text) = std::str::from_utf8(&buffer) {
                        if let Some(headers_end) = text.find("\r\n\r\n") {
                            match extract_content_length(text) {
                                Some(content_length) => {
                                    if buffer.len() >= headers_end + 4 + content_length {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                    if buffer.len() > 1_000_000 {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
    .await;

    if read_result.is_err() {
        warn!("request read timeout");
        return None;
    }
    if buffer.is_empty() {
        return None;
    }
    String::from_utf8(buffer).ok()
}

fn parse_request(request: &str) -> Option<(String, String, String)> {
    let mut lines = request.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let body = request
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Some((method, path, body))
}

fn extract_content_length(request: &str) -> Option<usize> {
    request.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parse_query(query_string: Option<&str>) -> HashMap<String, String> {
    query_string
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn http_response(status: u16, reason: &str, body: &str, extra_headers: &[(&str, &str)]) -> String {
    let mut headers = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nAccess-Control-Allow-Origin: *\r\nAccess-Control-Allow-Headers: Content-Type, X-Chat-Id\r\nAccess-Control-Allow-Methods: GET, POST, OPTIONS\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        reason,
        body.as_bytes().len()
    );
    for (key, value) in extra_headers {
        headers.push_str(&format!("{}: {}\r\n", key, value));
    }
    format!("{}\r\n{}", headers, body)
}
