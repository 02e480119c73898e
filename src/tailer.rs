// log-enricher - tailer.rs
//
// 4.D File tailer: given a path, a starting line offset, and a whence,
// emit each line of that file exactly once, in order, onto a `lines`
// channel; surface terminal errors on an `errors` channel.
//
// Per-tick metadata-then-read shape: single metadata() call to avoid TOCTOU,
// partial-line buffer with a bounded size, capped per-tick reads, and a
// tokio `select!` cancellation/read loop.
//
// Resume semantics are line-offset, not byte-offset: `Whence::Start(n)`
// skips exactly `n` newline-terminated lines from the beginning rather than
// seeking to a persisted byte position.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pool::{BytePool, PooledBuffer};
use crate::state::FileIdentity;
use crate::util::constants::{
    MAX_REOPEN_ATTEMPTS, MAX_TAIL_PARTIAL_BYTES, REOPEN_RETRY_INTERVAL_MS, TAIL_BACKOFF_INITIAL_MS,
    TAIL_BACKOFF_MAX_MS,
};
use crate::util::error::TailerError;

/// Starting position for a newly constructed tailer.
#[derive(Debug, Clone, Copy)]
pub enum Whence {
    /// Skip exactly this many newline-terminated lines from the beginning.
    Start(i64),
    /// Start from the current end of the file (no resume).
    End,
}

/// A line emitted by the tailer, tagged with the line number it represents
/// (1-based count of lines emitted from this file's current identity).
#[derive(Debug, Clone)]
pub struct TailedLine {
    pub line: String,
    pub line_number: i64,
}

/// Owns one file's tail loop. `run` consumes `self` and drives the loop to
/// completion (cancellation or terminal error).
pub struct Tailer {
    pub path: PathBuf,
    whence: Whence,
    lines_tx: mpsc::Sender<TailedLine>,
    errors_tx: mpsc::Sender<TailerError>,
    token: CancellationToken,
    byte_pool: Arc<BytePool>,
}

impl Tailer {
    pub fn new(
        path: PathBuf,
        whence: Whence,
        lines_tx: mpsc::Sender<TailedLine>,
        errors_tx: mpsc::Sender<TailerError>,
        token: CancellationToken,
        byte_pool: Arc<BytePool>,
    ) -> Self {
        Tailer {
            path,
            whence,
            lines_tx,
            errors_tx,
            token,
            byte_pool,
        }
    }

    /// Run the tail loop until cancelled or a terminal error occurs.
    #[tracing::instrument(name = "tailer_run", skip(self), fields(path = %self.path.display()))]
    pub async fn run(self) {
        let Tailer {
            path,
            whence,
            lines_tx,
            errors_tx,
            token,
            byte_pool,
        } = self;

        let (mut reader, mut identity, mut line_number) = match open_at(&path, whence).await {
            Ok(opened) => opened,
            Err(e) => {
                let _ = errors_tx.send(e).await;
                return;
            }
        };
        let mut backoff_ms = TAIL_BACKOFF_INITIAL_MS;
        // Scratch buffer for in-progress (not-yet-newline-terminated) read
        // content, drawn from the shared byte pool rather than growing a
        // fresh allocation per tailer.
        let mut partial = byte_pool.acquire();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    return;
                }
                result = read_line_or_eof(&mut reader, &mut partial) => {
                    match result {
                        Ok(Some(line)) => {
                            line_number += 1;
                            backoff_ms = TAIL_BACKOFF_INITIAL_MS;
                            let cancelled_or_closed = tokio::select! {
                                _ = token.cancelled() => true,
                                send_result = lines_tx.send(TailedLine { line, line_number }) => send_result.is_err(),
                            };
                            if cancelled_or_closed {
                                return;
                            }
                        }
                        Ok(None) => {
                            match handle_eof(&path, &identity, &mut reader, &mut partial, &token).await {
                                EofOutcome::NoChange => {
                                    if sleep_or_cancel(backoff_ms, &token).await {
                                        return;
                                    }
                                    backoff_ms = (backoff_ms * 2).min(TAIL_BACKOFF_MAX_MS);
                                }
                                EofOutcome::MoreData => {
                                    // Loop immediately, no backoff.
                                }
                                EofOutcome::Truncated => {
                                    line_number = 0;
                                    backoff_ms = TAIL_BACKOFF_INITIAL_MS;
                                    if let Ok(id) = FileIdentity::of(&path) {
                                        identity = id;
                                    }
                                }
                                EofOutcome::Rotated => {
                                    match reopen_after_rotation(&path, &token).await {
                                        Ok((new_reader, new_identity)) => {
                                            reader = new_reader;
                                            identity = new_identity;
                                            line_number = 0;
                                            backoff_ms = TAIL_BACKOFF_INITIAL_MS;
                                            partial.clear();
                                        }
                                        Err(TailerError::ReopenExhausted { path, attempts }) => {
                                            let _ = errors_tx
                                                .send(TailerError::ReopenExhausted { path, attempts })
                                                .await;
                                            return;
                                        }
                                        Err(_) => return,
                                    }
                                }
                                EofOutcome::Cancelled => return,
                            }
                        }
                        Err(source) => {
                            let _ = errors_tx
                                .send(TailerError::Io { path: path.clone(), source })
                                .await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Outcome of one end-of-file inspection tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EofOutcome {
    NoChange,
    MoreData,
    Truncated,
    Rotated,
    Cancelled,
}

async fn handle_eof(
    path: &Path,
    identity: &FileIdentity,
    reader: &mut BufReader<File>,
    partial: &mut PooledBuffer,
    token: &CancellationToken,
) -> EofOutcome {
    if token.is_cancelled() {
        return EofOutcome::Cancelled;
    }

    let current = match FileIdentity::of(path) {
        Ok(id) => id,
        Err(_) => return EofOutcome::Rotated, // path gone: treat as rotation
    };

    let stream_pos = match reader.stream_position().await {
        Ok(p) => p,
        Err(_) => return EofOutcome::Rotated,
    };

    if current.inode != 0 && identity.inode != 0 && current.inode != identity.inode {
        return EofOutcome::Rotated;
    }
    if current.file_size < stream_pos {
        if let Err(e) = reader.seek(SeekFrom::Start(0)).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to seek after truncation");
        }
        partial.clear();
        return EofOutcome::Truncated;
    }
    if current.file_size > stream_pos {
        return EofOutcome::MoreData;
    }
    EofOutcome::NoChange
}

async fn reopen_after_rotation(
    path: &Path,
    token: &CancellationToken,
) -> Result<(BufReader<File>, FileIdentity), TailerError> {
    for attempt in 1..=MAX_REOPEN_ATTEMPTS {
        if token.is_cancelled() {
            return Err(TailerError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Interrupted, "cancelled"),
            });
        }
        match File::open(path).await {
            Ok(file) => {
                let identity = FileIdentity::of(path).unwrap_or(FileIdentity {
                    inode: 0,
                    file_size: 0,
                    last_modified: 0,
                });
                return Ok((BufReader::new(file), identity));
            }
            Err(_) if attempt < MAX_REOPEN_ATTEMPTS => {
                if sleep_or_cancel(REOPEN_RETRY_INTERVAL_MS, token).await {
                    return Err(TailerError::Io {
                        path: path.to_path_buf(),
                        source: std::io::Error::new(std::io::ErrorKind::Interrupted, "cancelled"),
                    });
                }
            }
            Err(_) => {
                return Err(TailerError::ReopenExhausted {
                    path: path.to_path_buf(),
                    attempts: MAX_REOPEN_ATTEMPTS,
                })
            }
        }
    }
    Err(TailerError::ReopenExhausted {
        path: path.to_path_buf(),
        attempts: MAX_REOPEN_ATTEMPTS,
    })
}

/// Sleep for `ms`, returning `true` if the token was cancelled first.
async fn sleep_or_cancel(ms: u64, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(ms)) => false,
        _ = token.cancelled() => true,
    }
}

/// Read one line, returning `Ok(None)` at EOF without a terminating newline
/// (the partial content stays in `partial` for the next call). `partial` is
/// a pooled byte buffer shared across ticks for this tailer: bytes read but
/// not yet forming a complete line accumulate there instead of in a
/// freshly allocated `String` each call.
async fn read_line_or_eof(
    reader: &mut BufReader<File>,
    partial: &mut PooledBuffer,
) -> std::io::Result<Option<String>> {
    loop {
        if let Some(pos) = partial.iter().position(|&b| b == b'\n') {
            let mut line_bytes = partial.split_to(pos + 1);
            line_bytes.truncate(pos);
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.truncate(line_bytes.len() - 1);
            }
            return Ok(Some(String::from_utf8_lossy(&line_bytes).into_owned()));
        }

        let n = reader.read_buf(&mut **partial).await?;
        if n == 0 {
            // Partial line at EOF — accumulate until the next tick's read
            // completes it, or a rotation/truncation intervenes.
            if partial.len() > MAX_TAIL_PARTIAL_BYTES {
                tracing::warn!(
                    bytes = partial.len(),
                    limit = MAX_TAIL_PARTIAL_BYTES,
                    "tail partial-line buffer exceeded limit, discarding fragment"
                );
                partial.clear();
            }
            return Ok(None);
        }
    }
}

/// Open `path` at the given whence, returning the reader, the file's
/// identity at open time, and the starting line number.
async fn open_at(
    path: &Path,
    whence: Whence,
) -> Result<(BufReader<File>, FileIdentity, i64), TailerError> {
    let file = File::open(path).await.map_err(|source| TailerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let identity = FileIdentity::of(path).unwrap_or(FileIdentity {
        inode: 0,
        file_size: 0,
        last_modified: 0,
    });

    let mut reader = BufReader::new(file);
    let line_number = match whence {
        Whence::End => {
            reader
                .seek(SeekFrom::End(0))
                .await
                .map_err(|source| TailerError::Io { path: path.to_path_buf(), source })?;
            0
        }
        Whence::Start(n) if n > 0 => {
            skip_lines(&mut reader, n)
                .await
                .map_err(|source| TailerError::Io { path: path.to_path_buf(), source })?;
            n
        }
        Whence::Start(_) => 0,
    };

    Ok((reader, identity, line_number))
}

/// Skip exactly `n` newline-terminated lines from the current position
/// (the beginning, for a freshly opened reader), taking read-ahead
/// buffering into account.
async fn skip_lines(reader: &mut BufReader<File>, n: i64) -> std::io::Result<()> {
    let mut buf = String::new();
    for _ in 0..n {
        buf.clear();
        let read = reader.read_line(&mut buf).await?;
        if read == 0 {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    async fn drain(mut rx: mpsc::Receiver<TailedLine>, expected: usize) -> Vec<TailedLine> {
        let mut out = Vec::new();
        for _ in 0..expected {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(line)) => out.push(line),
                _ => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn emits_existing_lines_from_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"L1\nL2\n").unwrap();

        let (lines_tx, lines_rx) = mpsc::channel(16);
        let (errors_tx, _errors_rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let tailer = Tailer::new(path.clone(), Whence::Start(0), lines_tx, errors_tx, token.clone(), BytePool::new());

        let handle = tokio::spawn(tailer.run());
        let got = drain(lines_rx, 2).await;
        token.cancel();
        let _ = handle.await;

        assert_eq!(got.len(), 2);
        assert_eq!(got[0].line, "L1");
        assert_eq!(got[0].line_number, 1);
        assert_eq!(got[1].line, "L2");
        assert_eq!(got[1].line_number, 2);
    }

    #[tokio::test]
    async fn resume_skips_stored_line_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"L1\nL2\nL3\n").unwrap();

        let (lines_tx, lines_rx) = mpsc::channel(16);
        let (errors_tx, _errors_rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let tailer = Tailer::new(path.clone(), Whence::Start(2), lines_tx, errors_tx, token.clone(), BytePool::new());

        let handle = tokio::spawn(tailer.run());
        let got = drain(lines_rx, 1).await;
        token.cancel();
        let _ = handle.await;

        assert_eq!(got.len(), 1);
        assert_eq!(got[0].line, "L3");
        assert_eq!(got[0].line_number, 3);
    }

    #[tokio::test]
    async fn picks_up_appended_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"L1\n").unwrap();

        let (lines_tx, lines_rx) = mpsc::channel(16);
        let (errors_tx, _errors_rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let tailer = Tailer::new(path.clone(), Whence::Start(0), lines_tx, errors_tx, token.clone(), BytePool::new());

        let handle = tokio::spawn(tailer.run());
        let mut rx = lines_rx;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.line, "L1");

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        use std::io::Write;
        writeln!(file, "L2").unwrap();

        let second = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("should receive appended line")
            .unwrap();
        assert_eq!(second.line, "L2");

        token.cancel();
        let _ = handle.await;
    }
}
