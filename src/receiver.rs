// log-enricher - receiver.rs
//
// 4.M Push-protocol HTTP receiver: a small Loki-push-compatible endpoint so
// upstream agents that already speak that protocol (promtail, Grafana
// Alloy, vector) can ship lines directly instead of (or in addition to)
// this process tailing files on disk.
//
// Handlers stay thin and delegate to plain functions, keeping the
// route/extractor/middleware split conventional for axum; the wire format
// itself (gzip + snappy + protobuf "logproto" framing, alongside a plain
// JSON body) is specified by the upstream Loki push API, reproduced here
// as a minimal compatible subset.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use prost::Message;
use serde::Deserialize;
use tower_http::limit::RequestBodyLimitLayer;

use crate::config::Config;
use crate::processor::LineProcessor;
use crate::util::constants::HTTP_FALLBACK_SOURCE_PREFIX;
use crate::util::error::ReceiverError;

/// Minimal reproduction of Loki's `logproto.PushRequest`, handwritten
/// against `prost::Message` rather than generated from a `.proto` file —
/// there is no `protoc` invocation anywhere in this build.
#[derive(Clone, PartialEq, Message)]
pub struct PushRequest {
    #[prost(message, repeated, tag = "1")]
    pub streams: Vec<StreamAdapter>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StreamAdapter {
    #[prost(string, tag = "1")]
    pub labels: String,
    #[prost(message, repeated, tag = "2")]
    pub entries: Vec<EntryAdapter>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EntryAdapter {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<ProstTimestamp>,
    #[prost(string, tag = "2")]
    pub line: String,
}

/// Wire-compatible with `google.protobuf.Timestamp` without depending on
/// `prost-types` for a single two-field message.
#[derive(Clone, Copy, PartialEq, Message)]
pub struct ProstTimestamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

/// JSON push body shape (`{"streams":[{"stream":{...},"values":[["ns","line"],...]}]}`).
#[derive(Deserialize)]
struct JsonPushBody {
    streams: Vec<JsonStream>,
}

#[derive(Deserialize)]
struct JsonStream {
    stream: std::collections::HashMap<String, String>,
    values: Vec<[String; 2]>,
}

/// One decoded (labels, line, timestamp) tuple, format-agnostic.
struct PushedLine {
    labels: std::collections::HashMap<String, String>,
    line: String,
    timestamp: DateTime<Utc>,
}

pub struct ReceiverState {
    config: Arc<Config>,
    processor: Arc<LineProcessor>,
}

/// Build the router: push endpoints plus a readiness probe.
pub fn router(config: Arc<Config>, processor: Arc<LineProcessor>) -> Router {
    let max_body = config.http_max_body_bytes;
    let state = Arc::new(ReceiverState { config, processor });

    Router::new()
        .route("/loki/api/v1/push", post(push_handler))
        .route("/api/prom/push", post(push_handler))
        .route("/ready", get(ready_handler))
        .layer(RequestBodyLimitLayer::new(max_body))
        .with_state(state)
}

async fn ready_handler() -> &'static str {
    "ready"
}

async fn push_handler(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    match handle_push(&state, &headers, body).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => receiver_error_response(e),
    }
}

fn receiver_error_response(err: ReceiverError) -> axum::response::Response {
    let status = match &err {
        ReceiverError::UnsupportedMediaType { .. } | ReceiverError::UnsupportedEncoding { .. } => {
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        }
        ReceiverError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        ReceiverError::Unauthorized => StatusCode::UNAUTHORIZED,
        ReceiverError::SinkFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        ReceiverError::SnappyDecodeFailed { .. }
        | ReceiverError::ProtobufDecodeFailed { .. }
        | ReceiverError::JsonDecodeFailed { .. }
        | ReceiverError::InvalidEntry { .. } => StatusCode::BAD_REQUEST,
    };
    (status, err.to_string()).into_response()
}

async fn handle_push(
    state: &ReceiverState,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<(), ReceiverError> {
    check_authorization(state, headers)?;

    if body.len() > state.config.http_max_body_bytes {
        return Err(ReceiverError::BodyTooLarge { limit: state.config.http_max_body_bytes });
    }

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let decoded = decode_body(headers, body)?;
    if decoded.len() > state.config.http_max_body_bytes {
        return Err(ReceiverError::BodyTooLarge { limit: state.config.http_max_body_bytes });
    }

    let lines = if content_type.contains("application/json") {
        decode_json(&decoded)?
    } else if content_type.contains("application/x-protobuf") || content_type.contains("protobuf") {
        decode_protobuf(&decoded, state.config.http_max_body_bytes)?
    } else {
        return Err(ReceiverError::UnsupportedMediaType { content_type });
    };

    // Whole-batch validation: reject the whole request on any single
    // invalid entry rather than partially accepting.
    for line in &lines {
        if line.line.is_empty() {
            return Err(ReceiverError::InvalidEntry { reason: "empty line".to_string() });
        }
    }

    for line in lines {
        let (app, source_path) = resolve_stream_identity(&state.config, &line.labels);
        state
            .processor
            .process_line(&source_path, &app, line.line, Some(line.timestamp))
            .await
            .map_err(|source| ReceiverError::SinkFailed { source })?;
    }

    Ok(())
}

fn check_authorization(state: &ReceiverState, headers: &HeaderMap) -> Result<(), ReceiverError> {
    let Some(expected) = &state.config.http_bearer_token else {
        return Ok(());
    };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(ReceiverError::Unauthorized),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Apply `Content-Encoding` (gzip or identity); anything else is rejected.
fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<Vec<u8>, ReceiverError> {
    let encoding = headers
        .get(axum::http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("identity")
        .to_string();

    match encoding.as_str() {
        "identity" | "" => Ok(body.to_vec()),
        "gzip" => {
            use std::io::Read;
            let mut decoder = flate2::read::GzDecoder::new(&body[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ReceiverError::InvalidEntry { reason: format!("gzip decode failed: {e}") })?;
            Ok(out)
        }
        other => Err(ReceiverError::UnsupportedEncoding { encoding: other.to_string() }),
    }
}

fn decode_json(body: &[u8]) -> Result<Vec<PushedLine>, ReceiverError> {
    let parsed: JsonPushBody =
        serde_json::from_slice(body).map_err(|source| ReceiverError::JsonDecodeFailed { source })?;

    let mut lines = Vec::new();
    for stream in parsed.streams {
        for [ts_raw, text] in stream.values {
            let timestamp = parse_push_timestamp(&ts_raw)
                .ok_or_else(|| ReceiverError::InvalidEntry { reason: format!("unparseable timestamp '{ts_raw}'") })?;
            lines.push(PushedLine { labels: stream.stream.clone(), line: text, timestamp });
        }
    }
    Ok(lines)
}

/// Snappy-decompress, then protobuf-decode the `PushRequest` framing used by
/// the binary Loki push format. The snappy-decoded size is re-checked
/// against the body cap, since decompression can expand the payload well
/// past what the raw (and gzip-decoded) size checks already covered.
fn decode_protobuf(body: &[u8], max_body_bytes: usize) -> Result<Vec<PushedLine>, ReceiverError> {
    let mut decoder = snap::raw::Decoder::new();
    let decompressed = decoder
        .decompress_vec(body)
        .map_err(|e| ReceiverError::SnappyDecodeFailed { reason: e.to_string() })?;
    if decompressed.len() > max_body_bytes {
        return Err(ReceiverError::BodyTooLarge { limit: max_body_bytes });
    }

    let request = PushRequest::decode(decompressed.as_slice())
        .map_err(|e| ReceiverError::ProtobufDecodeFailed { reason: e.to_string() })?;

    let mut lines = Vec::new();
    for stream in request.streams {
        let labels = parse_logql_labels(&stream.labels);
        for entry in stream.entries {
            let timestamp = entry
                .timestamp
                .map(|ts| {
                    DateTime::<Utc>::from_timestamp(ts.seconds, ts.nanos.max(0) as u32)
                        .unwrap_or_else(Utc::now)
                })
                .unwrap_or_else(Utc::now);
            lines.push(PushedLine { labels: labels.clone(), line: entry.line, timestamp });
        }
    }
    Ok(lines)
}

/// Parse a minimal `{key="value", key2="value2"}` LogQL label-set string, as
/// produced by the binary push path's `StreamAdapter.labels` field.
fn parse_logql_labels(raw: &str) -> std::collections::HashMap<String, String> {
    let trimmed = raw.trim().trim_start_matches('{').trim_end_matches('}');
    let mut labels = std::collections::HashMap::new();
    for pair in trimmed.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        if let Some((k, v)) = pair.split_once('=') {
            let key = k.trim().to_string();
            let value = v.trim().trim_matches('"').to_string();
            labels.insert(key, value);
        }
    }
    labels
}

/// Parse a push-protocol timestamp: a nanosecond epoch integer (as a
/// string, per the Loki JSON convention) or an RFC3339 string.
fn parse_push_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ns) = raw.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp(ns / 1_000_000_000, (ns % 1_000_000_000) as u32);
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
}

/// Resolve (app, source_path) from a stream's label set:
/// - app: `app` | `service` | `job` label, else the configured default app
///   label.
/// - source path: `filename` | `__path__` | `path` label, stripped of any
///   `..`/`.` traversal segments and joined under the configured source
///   root; falls back to a synthetic `stream-N.log` name when absent or
///   when sanitisation leaves nothing usable.
fn resolve_stream_identity(
    config: &Config,
    labels: &std::collections::HashMap<String, String>,
) -> (String, String) {
    let app = labels
        .get("app")
        .or_else(|| labels.get("service"))
        .or_else(|| labels.get("job"))
        .cloned()
        .unwrap_or_else(|| crate::util::constants::DEFAULT_APP_LABEL.to_string());

    let candidate = labels
        .get("filename")
        .or_else(|| labels.get("__path__"))
        .or_else(|| labels.get("path"));

    let source_path = match candidate.and_then(|c| sanitize_relative_path(c)) {
        Some(safe) => config.http_source_root.join(safe).to_string_lossy().to_string(),
        None => {
            let fallback = format!("{}-{}.log", HTTP_FALLBACK_SOURCE_PREFIX, stream_fallback_id(labels));
            config.http_source_root.join(fallback).to_string_lossy().to_string()
        }
    };

    (app, source_path)
}

/// Derive a stable-ish fallback identifier from a label set when no usable
/// path label is present, so repeated pushes from the same unnamed stream
/// land on the same synthetic file rather than a new one each time.
fn stream_fallback_id(labels: &std::collections::HashMap<String, String>) -> String {
    use std::hash::{Hash, Hasher};
    let mut entries: Vec<_> = labels.iter().collect();
    entries.sort();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for (k, v) in entries {
        k.hash(&mut hasher);
        v.hash(&mut hasher);
    }
    format!("{:x}", hasher.finish())
}

/// Sanitise a candidate path label into something safe to join under the
/// source root: normalise `\` to `/`, strip a leading drive-letter prefix
/// (`C:`), then drop `..` and `.` segments and keep the rest in order. Pure
/// traversal/empty input (e.g. `..`, `/`, `C:\`) sanitises to an empty
/// path, which the caller treats as "no usable candidate" and falls back
/// to a synthetic name instead of joining nothing under the root.
fn sanitize_relative_path(raw: &str) -> Option<std::path::PathBuf> {
    let normalised = raw.replace('\\', "/");
    let without_drive = normalised
        .strip_prefix(|c: char| c.is_ascii_alphabetic())
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(&normalised);

    let mut parts: Vec<&str> = Vec::new();
    for component in std::path::Path::new(without_drive).components() {
        match component {
            std::path::Component::Normal(segment) => {
                if let Some(segment) = segment.to_str() {
                    parts.push(segment);
                }
            }
            std::path::Component::ParentDir
            | std::path::Component::CurDir
            | std::path::Component::RootDir
            | std::path::Component::Prefix(_) => {}
        }
    }

    if parts.is_empty() {
        return None;
    }
    Some(parts.iter().collect())
}

/// Bind and serve the receiver until `token` is cancelled.
pub async fn serve(
    router: Router,
    addr: SocketAddr,
    token: tokio_util::sync::CancellationToken,
) -> Result<(), crate::util::error::ConfigError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| crate::util::error::ConfigError::HttpBindFailed { addr: addr.to_string(), source })?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(|source| crate::util::error::ConfigError::HttpBindFailed {
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, source.to_string()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_push_timestamp_nanos() {
        let ts = parse_push_timestamp("1000000000").unwrap();
        assert_eq!(ts.timestamp(), 1);
    }

    #[test]
    fn parse_push_timestamp_rfc3339() {
        let ts = parse_push_timestamp("2026-01-02T03:04:05Z").unwrap();
        assert_eq!(ts.format("%Y-%m-%d").to_string(), "2026-01-02");
    }

    #[test]
    fn sanitize_relative_path_strips_traversal_segments() {
        assert_eq!(
            sanitize_relative_path("../../etc/passwd"),
            Some(std::path::PathBuf::from("etc/passwd"))
        );
        assert_eq!(
            sanitize_relative_path("app/access.log"),
            Some(std::path::PathBuf::from("app/access.log"))
        );
        assert_eq!(
            sanitize_relative_path(r"C:\Windows\..\Temp\x.log"),
            Some(std::path::PathBuf::from("Windows/Temp/x.log"))
        );
        assert!(sanitize_relative_path("..").is_none());
        assert!(sanitize_relative_path("/").is_none());
    }

    #[test]
    fn parse_logql_labels_extracts_pairs() {
        let labels = parse_logql_labels(r#"{app="nginx", filename="/var/log/nginx/access.log"}"#);
        assert_eq!(labels.get("app").map(String::as_str), Some("nginx"));
        assert_eq!(labels.get("filename").map(String::as_str), Some("/var/log/nginx/access.log"));
    }

    #[test]
    fn decode_json_parses_streams_and_values() {
        let body = serde_json::json!({
            "streams": [{
                "stream": {"app": "myapp"},
                "values": [["1000000000", "hello"]]
            }]
        });
        let lines = decode_json(body.to_string().as_bytes()).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line, "hello");
        assert_eq!(lines[0].labels.get("app").map(String::as_str), Some("myapp"));
    }

    #[test]
    fn constant_time_eq_detects_mismatch() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
