// log-enricher - processor.rs
//
// 4.F Line processor: the per-line glue between a tailer (or the push
// receiver) and a sink. Acquires an entry from the pool, runs the
// sub-pipeline, stamps a fallback timestamp, hands off to the sink, and
// always returns the entry to the pool on every exit path via its RAII
// guard.

use std::sync::Arc;

use chrono::Utc;

use crate::model::LogEntry;
use crate::pipeline::PipelineManager;
use crate::pool::EntryPool;
use crate::sink::Sink;
use crate::util::error::SinkError;

/// One (app, source_path) line-processing pipeline instance.
pub struct LineProcessor {
    pool: Arc<EntryPool>,
    pipeline: Arc<PipelineManager>,
    sink: Arc<dyn Sink>,
}

impl LineProcessor {
    pub fn new(pool: Arc<EntryPool>, pipeline: Arc<PipelineManager>, sink: Arc<dyn Sink>) -> Self {
        LineProcessor { pool, pipeline, sink }
    }

    /// Process one raw line. `timestamp_override` lets the push receiver
    /// supply an already-parsed timestamp instead of relying on the
    /// pipeline's own timestamp extraction or the "now" fallback.
    ///
    /// Returns the sink's error, if any, so the push receiver can fail the
    /// whole HTTP request with 500; the tailer path logs and discards it
    /// (a sink failure there has no caller to report back to).
    pub async fn process_line(
        &self,
        source_path: &str,
        app: &str,
        line: String,
        timestamp_override: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), SinkError> {
        let mut entry = self.pool.acquire().await;
        entry.source_path = source_path.to_string();
        entry.app = app.to_string();
        entry.line = line;
        if let Some(ts) = timestamp_override {
            entry.timestamp = ts;
        }

        let keep = self.pipeline.run(&mut entry).await;
        if !keep {
            return Ok(());
        }

        if entry.is_timestamp_zero() {
            entry.timestamp = Utc::now();
        }

        self.sink.send(&entry).await
        // `entry` (a PooledEntry) is released back to the pool on drop here,
        // on every path above including the early `keep=false` return.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::sink::Sink;
    use crate::state::StateStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    struct RecordingSink {
        received: StdMutex<Vec<LogEntry>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            RecordingSink { received: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }
        async fn send(&self, entry: &LogEntry) -> Result<(), crate::util::error::SinkError> {
            self.received.lock().unwrap().push(entry.clone());
            Ok(())
        }
        async fn close_writer(&self, _source_path: &str) {}
        async fn shutdown(&self) {}
    }

    fn fresh_store() -> StateStore {
        let dir = TempDir::new().unwrap();
        StateStore::load(&dir.path().join("state.json")).unwrap()
    }

    #[tokio::test]
    async fn fallback_timestamp_applied_when_unset() {
        let store = fresh_store();
        let pipeline = Arc::new(PipelineManager::from_config(&[], &store).unwrap());
        let pool = EntryPool::with_capacity(4);
        let sink = Arc::new(RecordingSink::new());
        let processor = LineProcessor::new(pool, pipeline, sink.clone());

        processor
            .process_line("/a.log", "myapp", "hello world".to_string(), None)
            .await
            .unwrap();

        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(!received[0].is_timestamp_zero());
        assert_eq!(received[0].app, "myapp");
    }

    #[tokio::test]
    async fn dropped_entry_never_reaches_sink() {
        let store = fresh_store();
        let mut params = HashMap::new();
        params.insert("regex".to_string(), "drop-me".to_string());
        params.insert("action".to_string(), "drop".to_string());
        let item = StageConfig {
            index: 0,
            stage_type: "filter".to_string(),
            applies_to: None,
            params,
        };
        let pipeline = Arc::new(PipelineManager::from_config(&[item], &store).unwrap());
        let pool = EntryPool::with_capacity(4);
        let sink = Arc::new(RecordingSink::new());
        let processor = LineProcessor::new(pool, pipeline, sink.clone());

        processor
            .process_line("/a.log", "myapp", "drop-me now".to_string(), None)
            .await
            .unwrap();

        assert!(sink.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn timestamp_override_is_preserved_through_empty_pipeline() {
        let store = fresh_store();
        let pipeline = Arc::new(PipelineManager::from_config(&[], &store).unwrap());
        let pool = EntryPool::with_capacity(4);
        let sink = Arc::new(RecordingSink::new());
        let processor = LineProcessor::new(pool, pipeline, sink.clone());

        let ts = Utc::now() - chrono::Duration::hours(1);
        processor
            .process_line("/a.log", "myapp", "line".to_string(), Some(ts))
            .await
            .unwrap();

        let received = sink.received.lock().unwrap();
        assert_eq!(received[0].timestamp, ts);
    }
}
