// log-enricher - manager.rs
//
// 4.E Tailer manager: discover log files under the configured base path,
// spawn one tailer per file seeded from the durable resume decision, and
// react to filesystem events (new files, new subdirectories, removals,
// rotations-as-removal-then-create) for the life of the process.
//
// Uses a notify-crate recommended_watcher bridged over a channel into an
// async consumer loop to drive tailer lifecycle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecursiveMode, Watcher};
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{AppNamingPolicy, Config};
use crate::pool::BytePool;
use crate::processor::LineProcessor;
use crate::sink::Sink;
use crate::state::StateStore;
use crate::tailer::{Tailer, TailedLine, Whence};
use crate::util::constants::DEFAULT_APP_LABEL;

/// Resolve the app label for a discovered log file, in priority order:
/// 1. a static `APP_NAME` configured for the whole process,
/// 2. `APP_IDENTIFICATION_REGEX`'s named group `app` matched against the
///    path,
/// 3. the file's parent directory name,
/// 4. the literal default label.
pub fn resolve_app_name(policy: &AppNamingPolicy, path: &Path) -> String {
    if let Some(app) = &policy.static_app {
        return app.clone();
    }
    if let Some(re) = &policy.identification_regex {
        if let Some(caps) = re.captures(&path.to_string_lossy()) {
            if let Some(m) = caps.name("app") {
                return m.as_str().to_string();
            }
        }
    }
    if let Some(parent_name) = path.parent().and_then(Path::file_name) {
        return parent_name.to_string_lossy().to_string();
    }
    DEFAULT_APP_LABEL.to_string()
}

fn matches_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext.to_string_lossy())))
        .unwrap_or(false)
}

fn is_ignored(path: &Path, ignore: &Option<Regex>) -> bool {
    ignore
        .as_ref()
        .map(|re| re.is_match(&path.to_string_lossy()))
        .unwrap_or(false)
}

/// Owns the set of active tailers and the filesystem watcher that keeps it
/// current.
pub struct TailerManager {
    base_path: PathBuf,
    extensions: Vec<String>,
    ignore: Option<Regex>,
    app_naming: AppNamingPolicy,
    store: Arc<StateStore>,
    processor: Arc<LineProcessor>,
    sink: Arc<dyn Sink>,
    active: Mutex<HashMap<PathBuf, CancellationToken>>,
    root_token: CancellationToken,
    byte_pool: Arc<BytePool>,
}

impl TailerManager {
    pub fn new(
        config: &Config,
        store: Arc<StateStore>,
        processor: Arc<LineProcessor>,
        sink: Arc<dyn Sink>,
        root_token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(TailerManager {
            base_path: config.log_base_path.clone(),
            extensions: config.log_file_extensions.clone(),
            ignore: config.log_files_ignored.clone(),
            app_naming: config.app_naming.clone(),
            store,
            processor,
            sink,
            active: Mutex::new(HashMap::new()),
            root_token,
            byte_pool: BytePool::new(),
        })
    }

    fn eligible(&self, path: &Path) -> bool {
        path.is_file() && matches_extension(path, &self.extensions) && !is_ignored(path, &self.ignore)
    }

    /// Walk `self.base_path` recursively and start a tailer for every
    /// eligible file found.
    pub fn initial_scan(self: &Arc<Self>) {
        let mut stack = vec![self.base_path.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if self.eligible(&path) {
                    self.start_tailer(&path);
                }
            }
        }
    }

    /// Start a tailer for `path`, seeding its whence from the durable resume
    /// decision. A no-op if a tailer for this exact path is already active.
    pub fn start_tailer(self: &Arc<Self>, path: &Path) {
        let mut active = self.active.lock();
        if active.contains_key(path) {
            return;
        }

        let whence = match self.store.get_file_state(&path.to_string_lossy()) {
            Some(stored) => {
                let decision = StateStore::find_matching_position(path, &stored);
                if decision.resumable {
                    Whence::Start(decision.line_number)
                } else {
                    Whence::Start(0)
                }
            }
            None => Whence::Start(0),
        };

        let token = self.root_token.child_token();
        active.insert(path.to_path_buf(), token.clone());
        drop(active);

        let app = resolve_app_name(&self.app_naming, path);
        let (lines_tx, lines_rx) = mpsc::channel(1024);
        let (errors_tx, errors_rx) = mpsc::channel(16);
        let tailer = Tailer::new(
            path.to_path_buf(),
            whence,
            lines_tx,
            errors_tx,
            token.clone(),
            Arc::clone(&self.byte_pool),
        );

        tokio::spawn(tailer.run());
        self.spawn_consumer(path.to_path_buf(), app, lines_rx, errors_rx, token);
    }

    fn spawn_consumer(
        self: &Arc<Self>,
        path: PathBuf,
        app: String,
        mut lines_rx: mpsc::Receiver<TailedLine>,
        mut errors_rx: mpsc::Receiver<crate::util::error::TailerError>,
        token: CancellationToken,
    ) {
        let manager = Arc::clone(self);
        let source_path = path.to_string_lossy().to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    line = lines_rx.recv() => {
                        match line {
                            Some(tailed) => {
                                if let Err(e) = manager
                                    .processor
                                    .process_line(&source_path, &app, tailed.line, None)
                                    .await
                                {
                                    tracing::error!(
                                        path = %source_path,
                                        error = %e,
                                        "sink failed to accept tailed entry"
                                    );
                                }
                                manager.store.set_line_number(&source_path, tailed.line_number);
                            }
                            None => break,
                        }
                    }
                    err = errors_rx.recv() => {
                        if let Some(err) = err {
                            tracing::error!(path = %path.display(), error = %err, "tailer reported a terminal error");
                        }
                        break;
                    }
                }
            }
            manager.sink.close_writer(&source_path).await;
            manager.active.lock().remove(&path);
        });
    }

    /// Cancel the tailer for `path`, if any.
    fn stop_tailer(&self, path: &Path) {
        if let Some(token) = self.active.lock().remove(path) {
            token.cancel();
        }
    }

    /// Start the notify watcher and react to events for the remainder of
    /// the process's life, until `root_token` is cancelled.
    pub fn spawn_watcher(self: &Arc<Self>) -> Result<tokio::task::JoinHandle<()>, notify::Error> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;
        watcher.watch(&self.base_path, RecursiveMode::Recursive)?;

        let manager = Arc::clone(self);
        let token = self.root_token.clone();
        let handle = tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    event = rx.recv() => {
                        let Some(event) = event else { return };
                        manager.handle_event(event);
                    }
                }
            }
        });
        Ok(handle)
    }

    fn handle_event(self: &Arc<Self>, event: notify::Event) {
        use notify::EventKind;
        match event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    if path.is_dir() {
                        // New subdirectory: nothing further needed, notify
                        // already watches recursively from the base path.
                        continue;
                    }
                    if self.eligible(path) {
                        self.start_tailer(path);
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.stop_tailer(path);
                }
            }
            _ => {}
        }
    }

    /// Cancel every active tailer. Called once during shutdown, after
    /// `root_token` itself has already been cancelled by the caller.
    pub async fn shutdown(&self) {
        let tokens: Vec<CancellationToken> = self.active.lock().values().cloned().collect();
        for token in tokens {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_app_name_prefers_static_over_regex() {
        let policy = AppNamingPolicy {
            static_app: Some("fixed".to_string()),
            identification_regex: Some(Regex::new(r"(?P<app>\w+)").unwrap()),
        };
        assert_eq!(resolve_app_name(&policy, Path::new("/var/log/nginx/access.log")), "fixed");
    }

    #[test]
    fn resolve_app_name_uses_regex_group() {
        let policy = AppNamingPolicy {
            static_app: None,
            identification_regex: Some(Regex::new(r"/var/log/(?P<app>[^/]+)/").unwrap()),
        };
        assert_eq!(resolve_app_name(&policy, Path::new("/var/log/nginx/access.log")), "nginx");
    }

    #[test]
    fn resolve_app_name_falls_back_to_parent_dir() {
        let policy = AppNamingPolicy { static_app: None, identification_regex: None };
        assert_eq!(resolve_app_name(&policy, Path::new("/var/log/nginx/access.log")), "nginx");
    }

    #[test]
    fn resolve_app_name_falls_back_to_default_label() {
        let policy = AppNamingPolicy { static_app: None, identification_regex: None };
        assert_eq!(resolve_app_name(&policy, Path::new("access.log")), DEFAULT_APP_LABEL);
    }

    #[test]
    fn matches_extension_is_case_insensitive() {
        assert!(matches_extension(Path::new("a.LOG"), &["log".to_string()]));
        assert!(!matches_extension(Path::new("a.txt"), &["log".to_string()]));
    }

    #[test]
    fn is_ignored_matches_configured_pattern() {
        let ignore = Some(Regex::new(r"\.tmp\.log$").unwrap());
        assert!(is_ignored(Path::new("/var/log/a.tmp.log"), &ignore));
        assert!(!is_ignored(Path::new("/var/log/a.log"), &ignore));
    }
}
