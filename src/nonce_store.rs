//! Short-window nonce deduplication.
//!
//! The store keeps `(nonce, ts)` tuples inside the sliding replay window and
//! answers membership queries for the replay guard. Variants share the same
//! observable semantics: an in-memory map, and a file-backed log that appends
//! on `add` and compacts periodically. Durable table variants live behind the
//! same trait in external collaborators.

use async_trait::async_trait;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::timestamp::UnixMillis;

/// Entries appended to a file store between compactions.
const COMPACT_EVERY: u32 = 512;

/// Replay-dedup store contract.
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// True when `nonce` was seen inside the current retention window.
    async fn has(&self, nonce: &str) -> bool;
    /// Record `nonce` with its envelope timestamp.
    async fn add(&self, nonce: &str, ts: UnixMillis);
    /// Drop every entry with `ts < cutoff`.
    async fn cleanup(&self, cutoff: UnixMillis);
}

/// In-memory nonce store: a concurrent map nonce → ts.
#[derive(Debug, Default)]
pub struct MemoryNonceStore {
    entries: DashMap<String, i64>,
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn has(&self, nonce: &str) -> bool {
        self.entries.contains_key(nonce)
    }

    async fn add(&self, nonce: &str, ts: UnixMillis) {
        self.entries.insert(nonce.to_owned(), ts.as_i64());
    }

    async fn cleanup(&self, cutoff: UnixMillis) {
        self.entries.retain(|_, ts| *ts >= cutoff.as_i64());
    }
}

/// File-backed nonce store.
///
/// Keeps the working set in memory and mirrors it to a tab-separated log,
/// one `ts\tnonce` line per entry. `add` appends; every [`COMPACT_EVERY`]
/// appends, and on every `cleanup`, the live entries are rewritten in place.
pub struct FileNonceStore {
    path: PathBuf,
    entries: DashMap<String, i64>,
    appends: AtomicU32,
    io: Mutex<()>,
}

impl FileNonceStore {
    /// Open (or create) the store at `path`, loading any surviving entries.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = DashMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                for line in content.lines() {
                    if let Some((ts, nonce)) = line.split_once('\t') {
                        if let Ok(ts) = ts.parse::<i64>() {
                            entries.insert(nonce.to_owned(), ts);
                        }
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(Self {
            path,
            entries,
            appends: AtomicU32::new(0),
            io: Mutex::new(()),
        })
    }

    async fn append_line(&self, nonce: &str, ts: i64) {
        let _io = self.io.lock().await;
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(format!("{ts}\t{nonce}\n").as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "nonce store append failed");
        }
    }

    /// Rewrite the log with only the live entries.
    async fn compact(&self) {
        let _io = self.io.lock().await;
        let mut content = String::new();
        for entry in self.entries.iter() {
            content.push_str(&format!("{}\t{}\n", entry.value(), entry.key()));
        }
        if let Err(e) = tokio::fs::write(&self.path, content).await {
            tracing::warn!(path = %self.path.display(), error = %e, "nonce store compaction failed");
        }
        self.appends.store(0, Ordering::Relaxed);
    }
}

#[async_trait]
impl NonceStore for FileNonceStore {
    async fn has(&self, nonce: &str) -> bool {
        self.entries.contains_key(nonce)
    }

    async fn add(&self, nonce: &str, ts: UnixMillis) {
        self.entries.insert(nonce.to_owned(), ts.as_i64());
        self.append_line(nonce, ts.as_i64()).await;
        if self.appends.fetch_add(1, Ordering::Relaxed) + 1 >= COMPACT_EVERY {
            self.compact().await;
        }
    }

    async fn cleanup(&self, cutoff: UnixMillis) {
        self.entries.retain(|_, ts| *ts >= cutoff.as_i64());
        self.compact().await;
    }
}

/// Debounce window for buffered writes.
pub const FLUSH_DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(250);

/// Write-coalescing decorator for slow backing stores.
///
/// Durable table variants batch inserts: `add` lands in an in-memory
/// overlay immediately (so `has` stays exact), and a background flush
/// pushes the accumulated batch to the backing store after a 250 ms
/// debounce, with at most one flush in flight. Observable `has`/`add`
/// semantics converge with the backing store within one flush interval.
pub struct BufferedNonceStore<S> {
    inner: Arc<S>,
    overlay: Arc<DashMap<String, i64>>,
    pending: Arc<Mutex<Vec<(String, i64)>>>,
    flush_scheduled: Arc<std::sync::atomic::AtomicBool>,
}

impl<S: NonceStore + 'static> BufferedNonceStore<S> {
    pub fn new(inner: S) -> Self {
        BufferedNonceStore {
            inner: Arc::new(inner),
            overlay: Arc::new(DashMap::new()),
            pending: Arc::new(Mutex::new(Vec::new())),
            flush_scheduled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Push the accumulated batch to the backing store. Re-adding an
    /// already-present nonce is an upsert there, so replays of the batch
    /// are harmless.
    async fn flush(
        inner: &S,
        overlay: &DashMap<String, i64>,
        pending: &Mutex<Vec<(String, i64)>>,
    ) {
        let batch: Vec<(String, i64)> = std::mem::take(&mut *pending.lock().await);
        for (nonce, ts) in &batch {
            inner.add(nonce, UnixMillis(*ts)).await;
        }
        for (nonce, _) in batch {
            overlay.remove(&nonce);
        }
    }

    /// Arrange exactly one flush after the debounce window.
    fn schedule_flush(&self) {
        if self
            .flush_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let overlay = Arc::clone(&self.overlay);
        let pending = Arc::clone(&self.pending);
        let flush_scheduled = Arc::clone(&self.flush_scheduled);
        tokio::spawn(async move {
            tokio::time::sleep(FLUSH_DEBOUNCE).await;
            flush_scheduled.store(false, Ordering::SeqCst);
            Self::flush(&inner, &overlay, &pending).await;
        });
    }

    /// Flush immediately, bypassing the debounce. Used by tests and
    /// orderly shutdown.
    pub async fn flush_now(&self) {
        Self::flush(&self.inner, &self.overlay, &self.pending).await;
    }
}

#[async_trait]
impl<S: NonceStore + 'static> NonceStore for BufferedNonceStore<S> {
    async fn has(&self, nonce: &str) -> bool {
        self.overlay.contains_key(nonce) || self.inner.has(nonce).await
    }

    async fn add(&self, nonce: &str, ts: UnixMillis) {
        self.overlay.insert(nonce.to_owned(), ts.as_i64());
        self.pending
            .lock()
            .await
            .push((nonce.to_owned(), ts.as_i64()));
        self.schedule_flush();
    }

    async fn cleanup(&self, cutoff: UnixMillis) {
        self.overlay.retain(|_, ts| *ts >= cutoff.as_i64());
        self.pending
            .lock()
            .await
            .retain(|(_, ts)| *ts >= cutoff.as_i64());
        self.inner.cleanup(cutoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_has_add_cleanup() {
        let store = MemoryNonceStore::new();
        assert!(!store.has("a").await);
        store.add("a", UnixMillis(100)).await;
        store.add("b", UnixMillis(200)).await;
        assert!(store.has("a").await);
        store.cleanup(UnixMillis(150)).await;
        assert!(!store.has("a").await);
        assert!(store.has("b").await);
    }

    #[tokio::test]
    async fn buffered_store_answers_before_flush() {
        let buffered = BufferedNonceStore::new(MemoryNonceStore::new());
        buffered.add("pending", UnixMillis(100)).await;
        // Visible immediately through the overlay.
        assert!(buffered.has("pending").await);
        assert!(!buffered.inner.has("pending").await);

        buffered.flush_now().await;
        assert!(buffered.inner.has("pending").await);
        assert!(buffered.has("pending").await);
    }

    #[tokio::test]
    async fn buffered_cleanup_reaches_both_layers() {
        let buffered = BufferedNonceStore::new(MemoryNonceStore::new());
        buffered.add("old", UnixMillis(10)).await;
        buffered.flush_now().await;
        buffered.add("fresh", UnixMillis(500)).await;

        buffered.cleanup(UnixMillis(100)).await;
        assert!(!buffered.has("old").await);
        assert!(buffered.has("fresh").await);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("infermesh-nonce-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("nonces.log");

        {
            let store = FileNonceStore::open(&path).await.unwrap();
            store.add("persisted", UnixMillis(42)).await;
            store.add("dropped", UnixMillis(1)).await;
            store.cleanup(UnixMillis(10)).await;
        }

        let reopened = FileNonceStore::open(&path).await.unwrap();
        assert!(reopened.has("persisted").await);
        assert!(!reopened.has("dropped").await);
    }
}
