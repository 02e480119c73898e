// log-enricher - state.rs
//
// 4.B Persistent state store: persist AppState; provide thread-safe
// accessors for FileState and cache snapshots; compute the resume
// decision at tailer startup.
//
// Atomic save (write temp -> rename) is grounded directly on
// app/session.rs's save()/load() pair — the same create-parent-dirs,
// serialise, write-sibling-temp-file, rename discipline, generalised from
// a UI session snapshot to the AppState root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde_json::Value as JsonValue;

use crate::model::{AppState, FileState};
use crate::util::error::StateError;

/// Thread-safe holder of [`AppState`] plus the save/load/resume-decision
/// operations.
pub struct StateStore {
    path: PathBuf,
    state: RwLock<AppState>,
}

/// Outcome of [`StateStore::find_matching_position`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeDecision {
    pub line_number: i64,
    pub resumable: bool,
}

/// Minimal, platform-available metadata snapshot of a file, used both to
/// compute the resume decision and to refresh `FileState` at shutdown.
#[derive(Debug, Clone, Copy)]
pub struct FileIdentity {
    pub inode: u64,
    pub file_size: u64,
    pub last_modified: i64,
}

impl FileIdentity {
    /// Stat `path` and extract inode/size/mtime. `inode` is 0 on platforms
    /// (or filesystems) that don't expose one; callers treat 0 as "absent".
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let inode = Self::inode_of(&metadata);
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(FileIdentity {
            inode,
            file_size: metadata.len(),
            last_modified,
        })
    }

    #[cfg(unix)]
    fn inode_of(metadata: &std::fs::Metadata) -> u64 {
        use std::os::unix::fs::MetadataExt;
        metadata.ino()
    }

    #[cfg(not(unix))]
    fn inode_of(_metadata: &std::fs::Metadata) -> u64 {
        0
    }
}

impl StateStore {
    /// Load-time: unmarshal AppState; when absent, start with empty maps.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let state = match std::fs::read(path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|source| StateError::Corrupt {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppState::default(),
            Err(source) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        Ok(StateStore {
            path: path.to_path_buf(),
            state: RwLock::new(state),
        })
    }

    /// Save-time: refresh `file_size`, `last_modified`, and `inode`
    /// for every `FileState` by stat'ing the path; drop the entry if stat
    /// fails (file gone). Write the whole AppState atomically.
    pub fn save(&self) -> Result<(), StateError> {
        {
            let mut state = self.state.write();
            let stale: Vec<String> = state
                .files
                .iter()
                .filter_map(|(path, _)| match FileIdentity::of(Path::new(path)) {
                    Ok(_) => None,
                    Err(_) => Some(path.clone()),
                })
                .collect();
            for path in &stale {
                state.files.remove(path);
            }
            let refreshed: Vec<(String, FileIdentity)> = state
                .files
                .keys()
                .filter_map(|path| FileIdentity::of(Path::new(path)).ok().map(|id| (path.clone(), id)))
                .collect();
            for (path, identity) in refreshed {
                if let Some(fs) = state.files.get_mut(&path) {
                    fs.inode = identity.inode;
                    fs.file_size = identity.file_size;
                    fs.last_modified = identity.last_modified;
                }
            }
        }

        let json = {
            let state = self.state.read();
            serde_json::to_vec_pretty(&*state).map_err(|source| StateError::Corrupt {
                path: self.path.clone(),
                source,
            })?
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StateError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|source| StateError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| {
            let _ = std::fs::remove_file(&tmp);
            StateError::Io {
                path: self.path.clone(),
                source,
            }
        })?;

        tracing::debug!(path = %self.path.display(), "state saved");
        Ok(())
    }

    pub fn get_file_state(&self, path: &str) -> Option<FileState> {
        self.state.read().files.get(path).cloned()
    }

    pub fn set_file_state(&self, state: FileState) {
        self.state.write().files.insert(state.path.clone(), state);
    }

    pub fn set_line_number(&self, path: &str, line_number: i64) {
        let mut state = self.state.write();
        state
            .files
            .entry(path.to_string())
            .or_insert_with(|| FileState::new(path))
            .line_number = line_number;
    }

    pub fn load_cache_snapshot(&self, cache_name: &str) -> HashMap<String, JsonValue> {
        self.state
            .read()
            .caches
            .get(cache_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn save_cache_snapshot(&self, cache_name: &str, snapshot: HashMap<String, JsonValue>) {
        self.state
            .write()
            .caches
            .insert(cache_name.to_string(), snapshot);
    }

    /// Resume decision.
    pub fn find_matching_position(path: &Path, stored: &FileState) -> ResumeDecision {
        let current = match FileIdentity::of(path) {
            Ok(id) => id,
            Err(_) => return ResumeDecision { line_number: 0, resumable: false },
        };

        if stored.inode != 0 && current.inode != 0 {
            if current.inode != stored.inode {
                return ResumeDecision { line_number: 0, resumable: false };
            }
            if current.file_size < stored.file_size {
                return ResumeDecision { line_number: 0, resumable: false };
            }
            if stored.file_size == current.file_size
                && stored.last_modified != 0
                && current.last_modified != stored.last_modified
            {
                return ResumeDecision { line_number: 0, resumable: false };
            }
            return ResumeDecision {
                line_number: stored.line_number,
                resumable: true,
            };
        }

        // Inode information absent on at least one side: only resume when
        // both stored size and mtime are set and exactly match current.
        if stored.file_size != 0
            && stored.last_modified != 0
            && stored.file_size == current.file_size
            && stored.last_modified == current.last_modified
        {
            return ResumeDecision {
                line_number: stored.line_number,
                resumable: true,
            };
        }

        ResumeDecision { line_number: 0, resumable: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load(&dir.path().join("state.json")).unwrap();
        assert!(store.get_file_state("/tmp/a.log").is_none());
    }

    #[test]
    fn load_corrupt_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(StateStore::load(&path), Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn save_load_round_trip_preserves_file_state() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("a.log");
        std::fs::write(&log_path, b"L1\nL2\n").unwrap();
        let state_path = dir.path().join("state.json");

        let store = StateStore::load(&state_path).unwrap();
        let mut fs = FileState::new(log_path.to_string_lossy().to_string());
        fs.line_number = 2;
        store.set_file_state(fs);
        store.save().unwrap();

        let reloaded = StateStore::load(&state_path).unwrap();
        let got = reloaded
            .get_file_state(&log_path.to_string_lossy())
            .expect("file state should round-trip");
        assert_eq!(got.line_number, 2);
        assert_ne!(got.file_size, 0);
    }

    #[test]
    fn save_drops_entries_for_files_that_no_longer_exist() {
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state.json");
        let store = StateStore::load(&state_path).unwrap();
        store.set_file_state(FileState::new("/does/not/exist.log"));
        store.save().unwrap();

        let reloaded = StateStore::load(&state_path).unwrap();
        assert!(reloaded.get_file_state("/does/not/exist.log").is_none());
    }

    #[test]
    fn resume_decision_rotation_by_inode_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"L1\n").unwrap();
        let mut stored = FileState::new(path.to_string_lossy().to_string());
        stored.inode = 999_999; // guaranteed mismatch vs. the real inode
        stored.line_number = 5;

        let decision = StateStore::find_matching_position(&path, &stored);
        assert!(!decision.resumable);
        assert_eq!(decision.line_number, 0);
    }

    #[test]
    fn resume_decision_truncation_by_smaller_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"L1\n").unwrap();
        let identity = FileIdentity::of(&path).unwrap();

        let mut stored = FileState::new(path.to_string_lossy().to_string());
        stored.inode = identity.inode;
        stored.file_size = identity.file_size + 100;
        stored.line_number = 5;

        let decision = StateStore::find_matching_position(&path, &stored);
        assert!(!decision.resumable);
    }

    #[test]
    fn resume_decision_succeeds_on_matching_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"L1\nL2\n").unwrap();
        let identity = FileIdentity::of(&path).unwrap();

        let mut stored = FileState::new(path.to_string_lossy().to_string());
        stored.inode = identity.inode;
        stored.file_size = identity.file_size;
        stored.last_modified = identity.last_modified;
        stored.line_number = 2;

        let decision = StateStore::find_matching_position(&path, &stored);
        assert!(decision.resumable);
        assert_eq!(decision.line_number, 2);
    }
}
