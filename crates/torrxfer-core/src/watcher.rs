//! Debounced recursive directory watching.
//!
//! The watcher turns raw filesystem events into stable "file ready"
//! notifications: a burst of writes to one path produces exactly one
//! [`WatchedFile`] once the path has been quiet for the configured write
//! duration. Every file already present when watching begins is announced
//! the same way, so transfers interrupted by a restart are re-attempted.
//!
//! Each pending path owns a small debounce task holding a buffered update
//! channel; new events on the path replace the pending file and restart the
//! quiescence timer. When the timer fires the task emits to every
//! subscriber, records the file in the watch store, removes itself from the
//! pending table and exits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::file::WatchedFile;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::store::KvStore;
use crate::NOTIFICATION_QUEUE_CAPACITY;

/// Buffered updates a single debounce task can hold.
const DEBOUNCE_CHANNEL_CAPACITY: usize = 5;

type PendingMap = Arc<Mutex<HashMap<PathBuf, mpsc::Sender<WatchedFile>>>>;
type SubscriberList = Arc<Mutex<Vec<mpsc::Sender<WatchedFile>>>>;

/// Watches one directory tree and emits debounced file notifications.
pub struct DirectoryWatcher {
    directory: PathBuf,
    store: Arc<KvStore>,
    subscribers: SubscriberList,
    watcher: Option<RecommendedWatcher>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl std::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

impl DirectoryWatcher {
    /// Start watching `directory` recursively.
    ///
    /// `media_root` must be an ancestor of `directory`; the sub-path between
    /// the two is preserved on the server side. Files seen at startup are
    /// primed through the same debounce pipeline as live events.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMediaRoot`] if the media root is not an
    /// ancestor of the watched directory, or a watcher error if the
    /// subscription fails.
    pub fn start(
        directory: &Path,
        media_root: &Path,
        write_duration: Duration,
        store: Arc<KvStore>,
    ) -> Result<Self> {
        if !fsutil::is_subdir(media_root, directory) {
            return Err(Error::InvalidMediaRoot {
                media_root: media_root.display().to_string(),
                directory: directory.display().to_string(),
            });
        }
        let directory = fsutil::clean_path(directory)?;
        let media_root = fsutil::clean_path(media_root)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = recommended_watcher(move |result: notify::Result<Event>| {
            if let Ok(event) = result {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    for path in event.paths {
                        let _ = event_tx.send(path);
                    }
                }
            }
        })
        .map_err(|e| Error::WatcherError(e.to_string()))?;

        watcher
            .watch(&directory, RecursiveMode::Recursive)
            .map_err(|e| Error::WatcherError(e.to_string()))?;

        let subscribers: SubscriberList = Arc::new(Mutex::new(Vec::new()));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (stop_tx, stop_rx) = oneshot::channel();

        let ctx = WatchContext {
            directory: directory.clone(),
            media_root,
            write_duration,
            store: Arc::clone(&store),
            pending,
            subscribers: Arc::clone(&subscribers),
        };
        tokio::spawn(event_loop(ctx, event_rx, stop_rx));

        info!(directory = %directory.display(), "watching directory");
        Ok(Self {
            directory,
            store,
            subscribers,
            watcher: Some(watcher),
            stop_tx: Some(stop_tx),
        })
    }

    /// Register a new subscriber and return its notification channel.
    ///
    /// The channel is buffered; a subscriber that stops draining loses
    /// notifications rather than stalling the watcher.
    pub fn subscribe(&self) -> mpsc::Receiver<WatchedFile> {
        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE_CAPACITY);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(tx);
        rx
    }

    /// Forget a previously announced file so the next event re-announces it.
    ///
    /// The server's own progress record is unaffected; if the file is
    /// already complete remotely, the re-announcement short-circuits there.
    pub fn remove_watched_file(&self, path: &Path) {
        if let Err(e) = self.store.delete(&path.display().to_string()) {
            debug!(path = %path.display(), error = %e, "could not remove watched file record");
        }
    }

    /// The directory being watched.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Stop watching. Pending debounce tasks are abandoned and every
    /// subscriber channel closes once in-flight notifications drain.
    pub fn close(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(mut watcher) = self.watcher.take() {
            let _ = watcher.unwatch(&self.directory);
        }
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .clear();
        info!(directory = %self.directory.display(), "watcher closed");
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

struct WatchContext {
    directory: PathBuf,
    media_root: PathBuf,
    write_duration: Duration,
    store: Arc<KvStore>,
    pending: PendingMap,
    subscribers: SubscriberList,
}

async fn event_loop(
    ctx: WatchContext,
    mut event_rx: mpsc::UnboundedReceiver<PathBuf>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let ctx = Arc::new(ctx);

    // Prime the pipeline with everything already on disk. The root itself
    // is exempt from the hidden-name filter.
    for entry in walkdir::WalkDir::new(&ctx.directory)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.path()))
        .filter_map(std::result::Result::ok)
    {
        if entry.file_type().is_file() {
            debug!(path = %entry.path().display(), "found existing file");
            handle_file_event(&ctx, entry.path());
        }
    }

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            event = event_rx.recv() => {
                match event {
                    Some(path) => handle_file_event(&ctx, &path),
                    None => break,
                }
            }
        }
    }
    debug!(directory = %ctx.directory.display(), "watch event loop finished");
}

fn handle_file_event(ctx: &Arc<WatchContext>, path: &Path) {
    if path.is_dir() || is_hidden(path) {
        return;
    }

    let mut file = match WatchedFile::from_path(path, &ctx.media_root) {
        Ok(file) => file,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "could not stat file, dropping event");
            return;
        }
    };
    file.watch_time = Some(Utc::now());

    let mut pending = ctx.pending.lock().expect("pending lock poisoned");
    if let Some(tx) = pending.get(&file.path) {
        // Burst in progress: replace the pending file, restarting the timer.
        match tx.try_send(file.clone()) {
            // A full buffer still means the burst is alive; the dropped
            // update only costs an earlier timer restart.
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => return,
            // The debounce task emitted and exited; this event opens a new
            // burst.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    let (tx, rx) = mpsc::channel(DEBOUNCE_CHANNEL_CAPACITY);
    pending.insert(file.path.clone(), tx);
    drop(pending);

    tokio::spawn(debounce_task(Arc::clone(ctx), file, rx));
}

/// Waits for the burst on one path to go quiet, then emits exactly once.
async fn debounce_task(
    ctx: Arc<WatchContext>,
    mut latest: WatchedFile,
    mut updates: mpsc::Receiver<WatchedFile>,
) {
    loop {
        let timer = tokio::time::sleep(ctx.write_duration);
        tokio::pin!(timer);
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Some(file) => latest = file,
                    // Watcher torn down before quiescence; drop the burst.
                    None => return,
                }
            }
            () = &mut timer => break,
        }
    }

    ctx.pending
        .lock()
        .expect("pending lock poisoned")
        .remove(&latest.path);

    // Re-stat so the emitted size reflects the end of the burst.
    if let Ok(metadata) = std::fs::metadata(&latest.path) {
        latest.size = metadata.len();
        latest.modified_time = metadata.modified().ok().map(chrono::DateTime::from);
    }

    let key = latest.path.display().to_string();
    if let Err(e) = ctx.store.put(&key, &latest.to_record()) {
        debug!(path = %key, error = %e, "could not record watched file");
    }

    info!(path = %latest.path.display(), size = latest.size, "file settled");
    let subscribers = ctx
        .subscribers
        .lock()
        .expect("subscriber lock poisoned")
        .clone();
    for tx in subscribers {
        if tx.try_send(latest.clone()).is_err() {
            warn!(path = %latest.path.display(), "subscriber queue full, dropping notification");
        }
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(dir: &Path) -> Arc<KvStore> {
        Arc::new(KvStore::open(dir, "watch-test.db").unwrap())
    }

    async fn recv_with_deadline(
        rx: &mut mpsc::Receiver<WatchedFile>,
        secs: u64,
    ) -> Option<WatchedFile> {
        tokio::time::timeout(Duration::from_secs(secs), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn rejects_media_root_outside_watch_tree() {
        let watch_dir = TempDir::new().unwrap();
        let other_root = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();

        let result = DirectoryWatcher::start(
            watch_dir.path(),
            other_root.path(),
            Duration::from_millis(50),
            test_store(store_dir.path()),
        );
        assert!(matches!(result, Err(Error::InvalidMediaRoot { .. })));
    }

    #[tokio::test]
    async fn announces_existing_files_on_start() {
        let dir = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("already-there.bin"), b"content").unwrap();

        let watcher = DirectoryWatcher::start(
            dir.path(),
            dir.path(),
            Duration::from_millis(50),
            test_store(store_dir.path()),
        )
        .unwrap();
        let mut rx = watcher.subscribe();

        let file = recv_with_deadline(&mut rx, 5).await.expect("notification");
        assert_eq!(file.path.file_name().unwrap(), "already-there.bin");
        assert_eq!(file.size, 7);
    }

    #[tokio::test]
    async fn burst_of_writes_emits_once_with_final_size() {
        let dir = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();

        let watcher = DirectoryWatcher::start(
            dir.path(),
            dir.path(),
            Duration::from_millis(300),
            test_store(store_dir.path()),
        )
        .unwrap();
        let mut rx = watcher.subscribe();

        let path = dir.path().join("burst.log");
        for i in 1..=4usize {
            std::fs::write(&path, vec![b'x'; 100 * i]).unwrap();
            tokio::time::sleep(Duration::from_millis(80)).await;
        }

        let file = recv_with_deadline(&mut rx, 5).await.expect("notification");
        assert_eq!(file.path.file_name().unwrap(), "burst.log");
        assert_eq!(file.size, 400);

        // The burst settled; no second notification arrives.
        assert!(recv_with_deadline(&mut rx, 1).await.is_none());
    }

    #[tokio::test]
    async fn event_after_emission_starts_new_burst() {
        let dir = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();

        let watcher = DirectoryWatcher::start(
            dir.path(),
            dir.path(),
            Duration::from_millis(100),
            test_store(store_dir.path()),
        )
        .unwrap();
        let mut rx = watcher.subscribe();

        let path = dir.path().join("twice.bin");
        std::fs::write(&path, b"first").unwrap();
        let first = recv_with_deadline(&mut rx, 5).await.expect("first");
        assert_eq!(first.size, 5);

        std::fs::write(&path, b"second write").unwrap();
        let second = recv_with_deadline(&mut rx, 5).await.expect("second");
        assert_eq!(second.size, 12);
    }

    #[tokio::test]
    async fn hidden_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();

        let watcher = DirectoryWatcher::start(
            dir.path(),
            dir.path(),
            Duration::from_millis(100),
            test_store(store_dir.path()),
        )
        .unwrap();
        let mut rx = watcher.subscribe();

        std::fs::write(dir.path().join(".hidden"), b"secret").unwrap();
        std::fs::write(dir.path().join("visible.bin"), b"data").unwrap();

        let file = recv_with_deadline(&mut rx, 5).await.expect("notification");
        assert_eq!(file.path.file_name().unwrap(), "visible.bin");
    }

    #[tokio::test]
    async fn media_prefix_follows_subdirectories() {
        let root = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        let nested = root.path().join("tv/show");
        std::fs::create_dir_all(&nested).unwrap();

        let watcher = DirectoryWatcher::start(
            &nested,
            root.path(),
            Duration::from_millis(100),
            test_store(store_dir.path()),
        )
        .unwrap();
        let mut rx = watcher.subscribe();

        std::fs::write(nested.join("ep1.mp4"), b"episode").unwrap();

        let file = recv_with_deadline(&mut rx, 5).await.expect("notification");
        assert_eq!(file.media_prefix, "tv/show");
    }

    #[tokio::test]
    async fn close_ends_subscriber_stream() {
        let dir = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();

        let mut watcher = DirectoryWatcher::start(
            dir.path(),
            dir.path(),
            Duration::from_millis(50),
            test_store(store_dir.path()),
        )
        .unwrap();
        let mut rx = watcher.subscribe();

        watcher.close();

        // All senders are dropped, so the channel terminates.
        assert!(recv_with_deadline(&mut rx, 2).await.is_none());
    }
}
