//! Offline Queue
//! =============
//! File-based queue for scan payloads when the server is unreachable.
//! Each item is one JSON file named `{timestamp_ns}_{type}.json`; drain is
//! strictly FIFO by filename and stops on the first failed send.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::error::MeshError;
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

pub struct OfflineQueue {
    dir: PathBuf,
}

impl OfflineQueue {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, MeshError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(OfflineQueue { dir })
    }

    pub fn queue_dir(&self) -> &Path {
        &self.dir
    }

    /// Write a payload to the queue. Returns the file path.
    pub fn enqueue(&self, payload: &Value, payload_type: &str) -> Result<PathBuf, MeshError> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let filename = format!("{nanos}_{payload_type}.json");
        let path = self.dir.join(&filename);
        std::fs::write(&path, serde_json::to_vec(payload)?)?;
        info!("queued {payload_type} payload: {filename}");
        Ok(path)
    }

    /// Sorted list of queued files, oldest first.
    pub fn pending(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        files.sort();
        files
    }

    pub fn count(&self) -> usize {
        self.pending().len()
    }

    /// Attempt to send every queued item in order.
    ///
    /// `send(payload, payload_type)` resolves to Err on failure. The drain
    /// stops at the first failure so ordering is preserved and a server
    /// still recovering is not hammered; corrupt files are deleted and
    /// counted as failed. Returns (sent, failed).
    pub async fn drain<F, Fut>(&self, mut send: F) -> (usize, usize)
    where
        F: FnMut(Value, String) -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        let mut sent = 0;
        let mut failed = 0;

        for path in self.pending() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let payload: Value = match std::fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
            {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("corrupt queue file {name}: {err}; removing");
                    let _ = std::fs::remove_file(&path);
                    failed += 1;
                    continue;
                }
            };

            // Infer the type from "{ts}_{type}.json".
            let payload_type = path
                .file_stem()
                .and_then(|stem| stem.to_string_lossy().split_once('_').map(|(_, t)| t.to_string()))
                .unwrap_or_else(|| "discovery".to_string());

            match send(payload, payload_type.clone()).await {
                Ok(()) => {
                    let _ = std::fs::remove_file(&path);
                    sent += 1;
                    info!("drained {payload_type}: {name}");
                }
                Err(err) => {
                    warn!("drain failed for {name}: {err}; will retry next cycle");
                    failed += 1;
                    break;
                }
            }
        }

        (sent, failed)
    }

    /// Remove all queued files. Returns count removed.
    pub fn clear(&self) -> usize {
        let files = self.pending();
        let count = files.len();
        for file in files {
            let _ = std::fs::remove_file(file);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_enqueue_drain_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path().join("queue")).unwrap();

        queue.enqueue(&json!({"n": 1}), "discovery").unwrap();
        queue.enqueue(&json!({"n": 2}), "shield").unwrap();
        assert_eq!(queue.count(), 2);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let (sent, failed) = queue
            .drain(move |payload, ptype| {
                let seen = Arc::clone(&seen_clone);
                async move {
                    seen.lock().unwrap().push((payload["n"].clone(), ptype));
                    Ok(())
                }
            })
            .await;

        assert_eq!((sent, failed), (2, 0));
        assert_eq!(queue.count(), 0);
        let order = seen.lock().unwrap();
        assert_eq!(order[0].1, "discovery");
        assert_eq!(order[1].1, "shield");
    }

    #[tokio::test]
    async fn test_drain_stops_on_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path()).unwrap();

        // Fixed names pin the chronological order.
        std::fs::write(dir.path().join("1_discovery.json"), b"{\"n\":1}").unwrap();
        std::fs::write(dir.path().join("2_shield.json"), b"{\"n\":2}").unwrap();
        std::fs::write(dir.path().join("3_discovery.json"), b"{\"n\":3}").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let (sent, failed) = queue
            .drain(move |_, _| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                        Err("server down".to_string())
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!((sent, failed), (1, 1));
        let names: Vec<String> = queue
            .pending()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["2_shield.json", "3_discovery.json"]);
    }

    #[tokio::test]
    async fn test_corrupt_file_removed_and_counted_failed() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("1_discovery.json"), b"not json").unwrap();
        std::fs::write(dir.path().join("2_discovery.json"), b"{\"n\":2}").unwrap();

        let (sent, failed) = queue.drain(|_, _| async { Ok(()) }).await;
        assert_eq!((sent, failed), (1, 1));
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path()).unwrap();
        queue.enqueue(&json!({}), "discovery").unwrap();
        assert_eq!(queue.clear(), 1);
        assert_eq!(queue.count(), 0);
    }
}
