// log-enricher - sink.rs
//
// 4.N Sinks: where a finished entry goes. `FileSink` appends JSON lines (or
// a raw passthrough line, if parsing produced no fields) next to the
// source file; `LokiSink` pushes the same entries to a Loki-compatible
// HTTP endpoint using the push-protocol's JSON body shape for symmetry
// with the receiver.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value as JsonValue;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::model::LogEntry;
use crate::util::constants::{DEFAULT_APP_LABEL, REMOTE_SINK_JOB_LABEL};
use crate::util::error::SinkError;

/// Where enriched entries go. All operations are async since both
/// implementations do I/O.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Persist or forward one entry.
    async fn send(&self, entry: &LogEntry) -> Result<(), SinkError>;

    /// Release any resource held open for `source_path`: when the manager
    /// reacts to the file being removed, the sink's writer for that path is
    /// closed too.
    async fn close_writer(&self, source_path: &str);

    /// Flush and release everything held open, called once at shutdown.
    async fn shutdown(&self);
}

/// Render an entry's fields as a JSON line, or the raw line if parsing
/// produced no fields.
fn render_line(entry: &LogEntry) -> Result<String, SinkError> {
    if entry.fields.is_empty() {
        return Ok(entry.line.clone());
    }
    let map: serde_json::Map<String, JsonValue> = entry
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone().into()))
        .collect();
    serde_json::to_string(&JsonValue::Object(map)).map_err(|source| SinkError::Serialize { source })
}

fn enriched_path(source_path: &str, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{source_path}{suffix}"))
}

/// Appends enriched entries to `<source_path><suffix>`, opening and keeping
/// one file handle per source path.
pub struct FileSink {
    suffix: String,
    writers: Mutex<HashMap<String, File>>,
}

impl FileSink {
    pub fn new(suffix: impl Into<String>) -> Self {
        FileSink {
            suffix: suffix.into(),
            writers: Mutex::new(HashMap::new()),
        }
    }

    async fn writer_for<'a>(
        writers: &'a mut HashMap<String, File>,
        source_path: &str,
        suffix: &str,
    ) -> Result<&'a mut File, SinkError> {
        if !writers.contains_key(source_path) {
            let path = enriched_path(source_path, suffix);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|source| SinkError::Io { path: path.clone(), source })?;
            writers.insert(source_path.to_string(), file);
        }
        Ok(writers.get_mut(source_path).expect("just inserted"))
    }
}

#[async_trait::async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn send(&self, entry: &LogEntry) -> Result<(), SinkError> {
        let mut line = render_line(entry)?;
        line.push('\n');

        let mut writers = self.writers.lock().await;
        let file = Self::writer_for(&mut writers, &entry.source_path, &self.suffix).await?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|source| SinkError::Io {
                path: enriched_path(&entry.source_path, &self.suffix),
                source,
            })
        // No fsync between writes: durability is best-effort, the OS page
        // cache flushes on its own schedule.
    }

    async fn close_writer(&self, source_path: &str) {
        self.writers.lock().await.remove(source_path);
    }

    async fn shutdown(&self) {
        let mut writers = self.writers.lock().await;
        for (_, mut file) in writers.drain() {
            let _ = file.flush().await;
        }
    }
}

/// Pushes entries to a Loki-compatible HTTP endpoint. One request per
/// `send` call; batching across entries is left to the caller's call
/// pattern rather than buffered here, matching the processor's one-entry
/// sink.send() contract.
pub struct LokiSink {
    client: reqwest::Client,
    push_url: String,
}

impl LokiSink {
    pub fn new(loki_url: impl Into<String>) -> Self {
        LokiSink {
            client: reqwest::Client::new(),
            push_url: loki_url.into(),
        }
    }

    fn labels_for(entry: &LogEntry) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert("job".to_string(), REMOTE_SINK_JOB_LABEL.to_string());
        let basename = entry
            .source_path
            .rsplit('/')
            .next()
            .unwrap_or(&entry.source_path)
            .to_string();
        labels.insert("source_file".to_string(), basename);
        let app = if entry.app.is_empty() {
            DEFAULT_APP_LABEL.to_string()
        } else {
            entry.app.clone()
        };
        labels.insert("app".to_string(), app);
        labels
    }
}

#[async_trait::async_trait]
impl Sink for LokiSink {
    fn name(&self) -> &str {
        "loki"
    }

    async fn send(&self, entry: &LogEntry) -> Result<(), SinkError> {
        let line = render_line(entry)?;
        let ns = entry.timestamp.timestamp_nanos_opt().unwrap_or(0);
        let body = serde_json::json!({
            "streams": [{
                "stream": Self::labels_for(entry),
                "values": [[ns.to_string(), line]],
            }]
        });

        let response = self
            .client
            .post(&self.push_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SinkError::RemoteRequestFailed {
                status: None,
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(SinkError::RemoteRequestFailed {
                status: Some(response.status().as_u16()),
                reason: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn close_writer(&self, _source_path: &str) {
        // No per-path resource to release: the HTTP client is shared.
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldValue;
    use tempfile::TempDir;

    fn entry_with_fields() -> LogEntry {
        let mut e = LogEntry::new_empty();
        e.source_path = "/tmp/app.log".to_string();
        e.fields.insert("msg".to_string(), FieldValue::String("hi".to_string()));
        e
    }

    #[tokio::test]
    async fn file_sink_writes_json_line_for_parsed_entries() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("app.log");
        let mut entry = entry_with_fields();
        entry.source_path = source.to_string_lossy().to_string();

        let sink = FileSink::new(".enriched");
        sink.send(&entry).await.unwrap();
        sink.shutdown().await;

        let written = std::fs::read_to_string(format!("{}.enriched", source.display())).unwrap();
        assert!(written.contains("\"msg\":\"hi\""));
    }

    #[tokio::test]
    async fn file_sink_writes_raw_line_when_unparsed() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("raw.log");
        let mut entry = LogEntry::new_empty();
        entry.source_path = source.to_string_lossy().to_string();
        entry.line = "plain text line".to_string();

        let sink = FileSink::new(".enriched");
        sink.send(&entry).await.unwrap();
        sink.shutdown().await;

        let written = std::fs::read_to_string(format!("{}.enriched", source.display())).unwrap();
        assert_eq!(written.trim_end(), "plain text line");
    }

    #[tokio::test]
    async fn file_sink_close_writer_allows_reopening() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("app2.log");
        let mut entry = entry_with_fields();
        entry.source_path = source.to_string_lossy().to_string();

        let sink = FileSink::new(".enriched");
        sink.send(&entry).await.unwrap();
        sink.close_writer(&entry.source_path).await;
        sink.send(&entry).await.unwrap();
        sink.shutdown().await;

        let written = std::fs::read_to_string(format!("{}.enriched", source.display())).unwrap();
        assert_eq!(written.lines().count(), 2);
    }
}
