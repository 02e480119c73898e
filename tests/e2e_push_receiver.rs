// log-enricher - tests/e2e_push_receiver.rs
//
// Concrete scenarios: a JSON push-protocol batch posted to
// `/loki/api/v1/push` is resolved to a source path from its stream labels,
// run through the (empty) pipeline, and landed in the configured file
// sink; an unauthenticated request is rejected when a bearer token is
// configured.

use std::sync::Arc;

use axum::Router;
use log_enricher::config::{AppNamingPolicy, Backend, Config};
use log_enricher::pipeline::PipelineManager;
use log_enricher::pool::EntryPool;
use log_enricher::processor::LineProcessor;
use log_enricher::receiver;
use log_enricher::sink::{FileSink, Sink};
use log_enricher::state::StateStore;
use log_enricher::util::error::SinkError;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// A sink that always fails, to exercise the push receiver's
/// sink-error-to-500 propagation.
struct FailingSink;

#[async_trait::async_trait]
impl Sink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn send(&self, _entry: &log_enricher::model::LogEntry) -> Result<(), SinkError> {
        Err(SinkError::RemoteRequestFailed { status: None, reason: "forced failure".to_string() })
    }

    async fn close_writer(&self, _source_path: &str) {}

    async fn shutdown(&self) {}
}

fn base_config(source_root: std::path::PathBuf, bearer_token: Option<String>) -> Config {
    Config {
        state_file_path: source_root.join("state.json"),
        log_base_path: source_root.clone(),
        log_file_extensions: vec!["log".to_string()],
        log_files_ignored: None,
        app_naming: AppNamingPolicy { static_app: None, identification_regex: None },
        backend: Backend::File,
        loki_url: None,
        enriched_file_suffix: ".enriched".to_string(),
        http_enabled: true,
        http_addr: "127.0.0.1:0".to_string(),
        http_max_body_bytes: 10 * 1024 * 1024,
        http_bearer_token: bearer_token,
        http_source_root: source_root,
        log_level: None,
        stages: Vec::new(),
    }
}

async fn spawn_router(router: Router) -> (std::net::SocketAddr, CancellationToken, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = CancellationToken::new();
    let shutdown_token = token.clone();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
            .await
            .unwrap();
    });
    (addr, token, handle)
}

#[tokio::test]
async fn json_push_lands_in_file_sink_via_stream_labels() {
    let dir = TempDir::new().unwrap();
    let source_root = dir.path().join("sources");
    std::fs::create_dir_all(&source_root).unwrap();

    let config = base_config(source_root.clone(), None);
    let state_store = StateStore::load(&config.state_file_path).unwrap();
    let pipeline = Arc::new(PipelineManager::from_config(&config.stages, &state_store).unwrap());
    let pool = EntryPool::with_capacity(4);
    let sink: Arc<dyn Sink> = Arc::new(FileSink::new(config.enriched_file_suffix.clone()));
    let processor = Arc::new(LineProcessor::new(pool, pipeline, sink));

    let router = receiver::router(Arc::new(config), processor);
    let (addr, token, handle) = spawn_router(router).await;

    let ns = chrono::Utc::now().timestamp_nanos_opt().unwrap();
    let body = serde_json::json!({
        "streams": [{
            "stream": {"app": "myapp", "filename": "access.log"},
            "values": [[ns.to_string(), "GET / 200"]]
        }]
    });

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/loki/api/v1/push"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    token.cancel();
    let _ = handle.await;

    let written = std::fs::read_to_string(source_root.join("access.log.enriched")).unwrap();
    assert!(written.contains("GET / 200"));
}

#[tokio::test]
async fn push_without_bearer_token_is_rejected_when_one_is_configured() {
    let dir = TempDir::new().unwrap();
    let source_root = dir.path().join("sources");
    std::fs::create_dir_all(&source_root).unwrap();

    let config = base_config(source_root.clone(), Some("super-secret".to_string()));
    let state_store = StateStore::load(&config.state_file_path).unwrap();
    let pipeline = Arc::new(PipelineManager::from_config(&config.stages, &state_store).unwrap());
    let pool = EntryPool::with_capacity(4);
    let sink: Arc<dyn Sink> = Arc::new(FileSink::new(config.enriched_file_suffix.clone()));
    let processor = Arc::new(LineProcessor::new(pool, pipeline, sink));

    let router = receiver::router(Arc::new(config), processor);
    let (addr, token, handle) = spawn_router(router).await;

    let body = serde_json::json!({
        "streams": [{
            "stream": {"app": "myapp", "filename": "access.log"},
            "values": [["1000000000", "unauthorized line"]]
        }]
    });

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/loki/api/v1/push"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    token.cancel();
    let _ = handle.await;

    assert!(!source_root.join("access.log.enriched").exists());
}

#[tokio::test]
async fn push_with_traversal_filename_lands_under_source_root() {
    let dir = TempDir::new().unwrap();
    let source_root = dir.path().join("sources");
    std::fs::create_dir_all(&source_root).unwrap();

    let config = base_config(source_root.clone(), None);
    let state_store = StateStore::load(&config.state_file_path).unwrap();
    let pipeline = Arc::new(PipelineManager::from_config(&config.stages, &state_store).unwrap());
    let pool = EntryPool::with_capacity(4);
    let sink: Arc<dyn Sink> = Arc::new(FileSink::new(config.enriched_file_suffix.clone()));
    let processor = Arc::new(LineProcessor::new(pool, pipeline, sink));

    let router = receiver::router(Arc::new(config), processor);
    let (addr, token, handle) = spawn_router(router).await;

    let body = serde_json::json!({
        "streams": [{
            "stream": {"app": "myapp", "filename": "../../etc/passwd"},
            "values": [["1000000000", "root:x:0:0:root:/root:/bin/bash"]]
        }]
    });

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/loki/api/v1/push"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    token.cancel();
    let _ = handle.await;

    // Traversal segments are stripped, not rejected: the remainder lands
    // under the source root instead of falling back to a synthetic name.
    let written = std::fs::read_to_string(source_root.join("etc/passwd.enriched")).unwrap();
    assert!(written.contains("root:x:0:0:root:/root:/bin/bash"));
}

#[tokio::test]
async fn push_returns_500_when_sink_fails() {
    let dir = TempDir::new().unwrap();
    let source_root = dir.path().join("sources");
    std::fs::create_dir_all(&source_root).unwrap();

    let config = base_config(source_root.clone(), None);
    let state_store = StateStore::load(&config.state_file_path).unwrap();
    let pipeline = Arc::new(PipelineManager::from_config(&config.stages, &state_store).unwrap());
    let pool = EntryPool::with_capacity(4);
    let sink: Arc<dyn Sink> = Arc::new(FailingSink);
    let processor = Arc::new(LineProcessor::new(pool, pipeline, sink));

    let router = receiver::router(Arc::new(config), processor);
    let (addr, token, handle) = spawn_router(router).await;

    let body = serde_json::json!({
        "streams": [{
            "stream": {"app": "myapp", "filename": "access.log"},
            "values": [["1000000000", "this will not make it to the sink"]]
        }]
    });

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/loki/api/v1/push"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

    token.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn ready_endpoint_reports_ready_without_authorization() {
    let dir = TempDir::new().unwrap();
    let source_root = dir.path().join("sources");
    std::fs::create_dir_all(&source_root).unwrap();

    let config = base_config(source_root.clone(), Some("super-secret".to_string()));
    let state_store = StateStore::load(&config.state_file_path).unwrap();
    let pipeline = Arc::new(PipelineManager::from_config(&config.stages, &state_store).unwrap());
    let pool = EntryPool::with_capacity(4);
    let sink: Arc<dyn Sink> = Arc::new(FileSink::new(config.enriched_file_suffix.clone()));
    let processor = Arc::new(LineProcessor::new(pool, pipeline, sink));

    let router = receiver::router(Arc::new(config), processor);
    let (addr, token, handle) = spawn_router(router).await;

    let response = reqwest::Client::new().get(format!("http://{addr}/ready")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    token.cancel();
    let _ = handle.await;
}
