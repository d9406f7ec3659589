//! Key-Snapshot Decoding
//!
//! A snapshot is a newline-delimited sequence of JSON key-descriptor
//! documents, optionally gzip-compressed (detected by the `.gz` file
//! suffix). Snapshots for real buckets run to hundreds of millions of
//! records, so decoding is spread over a pool of worker threads that share
//! the reader; the descriptor stream therefore carries no ordering.
//!
//! The first fatal decode or read error terminates the stream and is
//! reported on a side channel. Descriptors already delivered remain valid,
//! which keeps a partially-built model usable under cancellation.

use crate::cancel::Cancel;
use crate::store::KeyDescriptor;
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Buffered descriptors between the decode pool and the single consumer.
const STREAM_DEPTH: usize = 1024;

/// Error from reading or decoding a snapshot.
#[derive(Debug)]
pub enum SnapshotError {
    /// The snapshot file could not be opened or read.
    Io(std::io::Error),
    /// A record was not a valid key-descriptor document.
    Decode(serde_json::Error),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::Io(e) => write!(f, "can't read snapshot: {}", e),
            SnapshotError::Decode(e) => write!(f, "can't decode key record: {}", e),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<std::io::Error> for SnapshotError {
    fn from(e: std::io::Error) -> Self {
        SnapshotError::Io(e)
    }
}

/// Open a snapshot file, transparently decompressing when the file name
/// ends in `.gz`.
pub fn open_snapshot(path: &Path) -> Result<Box<dyn Read + Send>, SnapshotError> {
    let file = File::open(path)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// A lazy, finite, single-consumer stream of key descriptors plus the
/// side channel carrying the first fatal error.
pub struct KeyStream {
    keys: mpsc::Receiver<KeyDescriptor>,
    error: oneshot::Receiver<SnapshotError>,
}

impl KeyStream {
    /// Spawn the decode pool with one worker per available core.
    pub fn spawn(input: impl Read + Send + 'static, cancel: Cancel) -> KeyStream {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        KeyStream::spawn_with_workers(input, workers, cancel)
    }

    pub fn spawn_with_workers(
        input: impl Read + Send + 'static,
        workers: usize,
        cancel: Cancel,
    ) -> KeyStream {
        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        let (err_tx, err_rx) = oneshot::channel();

        let reader: Arc<Mutex<BufReader<Box<dyn Read + Send>>>> =
            Arc::new(Mutex::new(BufReader::new(Box::new(input))));
        let err_slot = Arc::new(Mutex::new(Some(err_tx)));
        let stop = Arc::new(AtomicBool::new(false));

        debug!(workers, "spawning snapshot decode pool");
        for _ in 0..workers.max(1) {
            let reader = Arc::clone(&reader);
            let err_slot = Arc::clone(&err_slot);
            let stop = Arc::clone(&stop);
            let tx = tx.clone();
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                decode_worker(&reader, &err_slot, &stop, &tx, &cancel);
            });
        }

        KeyStream {
            keys: rx,
            error: err_rx,
        }
    }

    /// Next descriptor, or `None` once the stream is exhausted (end of
    /// snapshot, fatal error, or cancellation).
    pub async fn recv(&mut self) -> Option<KeyDescriptor> {
        self.keys.recv().await
    }

    /// Tear the stream down and report the first fatal error, if any.
    /// Dropping the descriptor channel unblocks any workers still
    /// producing.
    pub async fn finish(self) -> Result<(), SnapshotError> {
        drop(self.keys);
        match self.error.await {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}

fn decode_worker(
    reader: &Mutex<BufReader<Box<dyn Read + Send>>>,
    err_slot: &Mutex<Option<oneshot::Sender<SnapshotError>>>,
    stop: &AtomicBool,
    tx: &mpsc::Sender<KeyDescriptor>,
    cancel: &Cancel,
) {
    let mut line = String::new();
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        if cancel.is_cancelled() {
            warn!("aborting snapshot decode");
            return;
        }

        line.clear();
        let read = {
            let mut guard = reader.lock();
            guard.read_line(&mut line)
        };
        match read {
            Ok(0) => return,
            Ok(_) => {}
            Err(err) => {
                report_first(err_slot, stop, SnapshotError::Io(err));
                return;
            }
        }

        let record = line.trim();
        if record.is_empty() {
            continue;
        }
        match serde_json::from_str::<KeyDescriptor>(record) {
            Ok(key) => {
                // The consumer dropped the stream; nothing left to do.
                if tx.blocking_send(key).is_err() {
                    return;
                }
            }
            Err(err) => {
                report_first(err_slot, stop, SnapshotError::Decode(err));
                return;
            }
        }
    }
}

fn report_first(
    err_slot: &Mutex<Option<oneshot::Sender<SnapshotError>>>,
    stop: &AtomicBool,
    err: SnapshotError,
) {
    stop.store(true, Ordering::SeqCst);
    if let Some(sender) = err_slot.lock().take() {
        let _ = sender.send(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::io::Write;

    fn record(path: &str) -> String {
        format!(
            r#"{{"path":{:?},"last_modified":"2026-01-02T03:04:05.000000006Z","etag":"e","size":1}}"#,
            path
        )
    }

    async fn drain(mut stream: KeyStream) -> (HashSet<String>, Result<(), SnapshotError>) {
        let mut paths = HashSet::new();
        while let Some(key) = stream.recv().await {
            paths.insert(key.path);
        }
        (paths, stream.finish().await)
    }

    #[tokio::test]
    async fn decodes_every_record() {
        let input = [record("a"), record("b/c"), record("b/d/e")].join("\n");
        let stream = KeyStream::spawn(Cursor::new(input), Cancel::new());
        let (paths, outcome) = drain(stream).await;
        assert!(outcome.is_ok());
        assert_eq!(
            paths,
            HashSet::from(["a".to_string(), "b/c".to_string(), "b/d/e".to_string()])
        );
    }

    #[tokio::test]
    async fn skips_blank_lines() {
        let input = format!("\n{}\n\n{}\n", record("a"), record("b"));
        let stream = KeyStream::spawn_with_workers(Cursor::new(input), 2, Cancel::new());
        let (paths, outcome) = drain(stream).await;
        assert!(outcome.is_ok());
        assert_eq!(paths.len(), 2);
    }

    #[tokio::test]
    async fn reports_the_first_decode_error() {
        let input = format!("{}\nnot a record\n{}\n", record("a"), record("b"));
        let stream = KeyStream::spawn_with_workers(Cursor::new(input), 1, Cancel::new());
        let (paths, outcome) = drain(stream).await;
        assert!(matches!(outcome, Err(SnapshotError::Decode(_))));
        // The record before the bad line was already delivered.
        assert!(paths.contains("a"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream() {
        let cancel = Cancel::new();
        cancel.cancel();
        let input = [record("a"), record("b")].join("\n");
        let stream = KeyStream::spawn(Cursor::new(input), cancel);
        let (paths, outcome) = drain(stream).await;
        assert!(outcome.is_ok());
        assert!(paths.len() <= 2);
    }

    #[tokio::test]
    async fn gzip_snapshots_are_detected_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json.gz");
        let file = File::create(&path).unwrap();
        let mut gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        writeln!(gz, "{}", record("a/b")).unwrap();
        gz.finish().unwrap();

        let input = open_snapshot(&path).unwrap();
        let stream = KeyStream::spawn(input, Cancel::new());
        let (paths, outcome) = drain(stream).await;
        assert!(outcome.is_ok());
        assert_eq!(paths, HashSet::from(["a/b".to_string()]));
    }

    #[tokio::test]
    async fn plain_snapshots_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, record("x")).unwrap();

        let input = open_snapshot(&path).unwrap();
        let stream = KeyStream::spawn(input, Cancel::new());
        let (paths, outcome) = drain(stream).await;
        assert!(outcome.is_ok());
        assert_eq!(paths, HashSet::from(["x".to_string()]));
    }
}
