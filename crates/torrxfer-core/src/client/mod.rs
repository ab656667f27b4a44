//! Transfer client.
//!
//! The orchestrator wires the pipeline together: directory watchers produce
//! settled files, each file becomes one job per connected server, a worker
//! pool executes the jobs, and every notification flows back through one
//! control channel. Transient failures re-enqueue the same job with a
//! doubling delay, up to a bounded attempt count; after that the file's
//! watch record is evicted and its mtime bumped so the watcher announces it
//! again later.

pub mod connection;
pub mod dispatcher;
pub mod file;
pub mod rpc;

pub use connection::ServerConnection;
pub use dispatcher::{Dispatcher, TransferJob};
pub use file::WatchedFile;
pub use rpc::{RpcClient, TransferEvent};

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::fsutil;
use crate::store::KvStore;
use crate::watcher::DirectoryWatcher;
use crate::{
    DEFAULT_WORKER_COUNT, DEFAULT_WRITE_DURATION, JOB_QUEUE_CAPACITY, MAX_TRANSFER_ATTEMPTS,
    NOTIFICATION_QUEUE_CAPACITY,
};

/// Client-side watch database file name.
const CLIENT_DB_NAME: &str = "cfdb.dat";

/// Kinds of notifications a connection can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Connection to a server established
    Connected,
    /// Connection to a server shut down
    Disconnected,
    /// Bytes were transferred for a file
    FilesUpdated,
    /// A file finished transferring (or was already present)
    Completed,
    /// The metadata query failed; the job is retried
    QueryError,
    /// The stream failed mid-transfer; the job is retried
    TransferError,
    /// A local failure that precludes any attempt; not retried
    FatalError,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::FilesUpdated => "Files Updated",
            Self::Completed => "Completed",
            Self::QueryError => "Query Error",
            Self::TransferError => "Transfer Error",
            Self::FatalError => "Fatal Error",
        };
        f.write_str(text)
    }
}

/// A notification about one server connection.
#[derive(Debug, Clone)]
pub struct ServerNotification {
    /// What happened
    pub kind: NotificationKind,
    /// Correlation UUID of the job, when the notification belongs to one
    pub job_id: Option<Uuid>,
    /// Index of the server connection
    pub server_index: u16,
    /// Server address
    pub address: String,
    /// The file involved, when the notification belongs to one
    pub file: Option<WatchedFile>,
    /// Bytes delivered by the last block (`FilesUpdated` only)
    pub last_transferred: u64,
    /// Error text for the error kinds
    pub error: Option<String>,
}

/// The torrxfer client orchestrator.
#[derive(Debug)]
pub struct TransferClient {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<ServerNotification>>>>,
    write_duration: Duration,
    store_dir: Option<PathBuf>,
}

impl Default for TransferClient {
    fn default() -> Self {
        Self {
            subscribers: Arc::default(),
            write_duration: DEFAULT_WRITE_DURATION,
            store_dir: None,
        }
    }
}

struct PendingJob {
    connection: Arc<ServerConnection>,
    file: WatchedFile,
    attempts: u32,
}

impl TransferClient {
    /// Create a client with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the watcher quiescence window (default 10 s).
    #[must_use]
    pub fn with_write_duration(mut self, write_duration: Duration) -> Self {
        self.write_duration = write_duration;
        self
    }

    /// Place the watch database in `dir` instead of the system temp
    /// directory.
    #[must_use]
    pub fn with_store_dir(mut self, dir: PathBuf) -> Self {
        self.store_dir = Some(dir);
        self
    }

    /// Register an external observer of connection notifications.
    ///
    /// The channel is buffered at [`NOTIFICATION_QUEUE_CAPACITY`]; observers
    /// that stop draining lose notifications rather than stalling transfers.
    pub fn subscribe(&self) -> mpsc::Receiver<ServerNotification> {
        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE_CAPACITY);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(tx);
        rx
    }

    /// Run the client until a termination signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the watch store cannot be opened or no part of
    /// the configuration is usable.
    pub async fn run(&self, config: ClientConfig) -> Result<()> {
        self.run_until(config, shutdown_signal()).await
    }

    /// Run the client until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the watch store cannot be opened or no part of
    /// the configuration is usable.
    #[allow(clippy::too_many_lines)]
    pub async fn run_until<F>(&self, config: ClientConfig, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let store = Arc::new(match &self.store_dir {
            Some(dir) => KvStore::open(dir, CLIENT_DB_NAME)?,
            None => KvStore::open_in_temp(CLIENT_DB_NAME)?,
        });
        let (notification_tx, mut notification_rx) =
            mpsc::channel::<ServerNotification>(NOTIFICATION_QUEUE_CAPACITY);

        // Connect to every configured server; failures are logged and the
        // remaining servers proceed.
        let mut connections: Vec<Arc<ServerConnection>> = Vec::new();
        for (index, entry) in config.servers.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            match ServerConnection::connect(index as u16, entry).await {
                Ok(conn) => {
                    info!(address = %entry.address, port = entry.port, "connected to server");
                    let conn = Arc::new(conn);
                    self.fan_out(&ServerNotification {
                        kind: NotificationKind::Connected,
                        job_id: None,
                        server_index: conn.index(),
                        address: conn.address().to_string(),
                        file: None,
                        last_transferred: 0,
                        error: None,
                    });
                    connections.push(conn);
                }
                Err(e) => {
                    error!(address = %entry.address, error = %e, "failed to connect to server");
                }
            }
        }

        // Start the watchers and merge their notifications into one stream.
        let (file_tx, mut file_rx) = mpsc::channel::<WatchedFile>(JOB_QUEUE_CAPACITY);
        let mut watchers: Vec<DirectoryWatcher> = Vec::new();
        for dir in &config.watched_directories {
            match DirectoryWatcher::start(
                &dir.directory,
                &dir.media_root,
                self.write_duration,
                Arc::clone(&store),
            ) {
                Ok(watcher) => {
                    let mut rx = watcher.subscribe();
                    let tx = file_tx.clone();
                    tokio::spawn(async move {
                        while let Some(file) = rx.recv().await {
                            if tx.send(file).await.is_err() {
                                break;
                            }
                        }
                    });
                    watchers.push(watcher);
                }
                Err(e) => {
                    error!(directory = %dir.directory.display(), error = %e, "could not watch directory");
                }
            }
        }
        drop(file_tx);

        if connections.is_empty() && watchers.is_empty() {
            return Err(crate::error::Error::ConfigError(
                "no servers reachable and no directories watchable".to_string(),
            ));
        }

        let (job_tx, job_rx) = mpsc::channel::<TransferJob>(JOB_QUEUE_CAPACITY);
        Dispatcher::new(job_rx, DEFAULT_WORKER_COUNT).run();

        let mut pending: HashMap<Uuid, PendingJob> = HashMap::new();
        let mut completed_servers: HashMap<PathBuf, HashSet<u16>> = HashMap::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                file = file_rx.recv() => {
                    let Some(file) = file else { break };
                    for conn in &connections {
                        let job = TransferJob::new(
                            Arc::clone(conn),
                            file.clone(),
                            notification_tx.clone(),
                        );
                        debug!(job_id = %job.id, path = %file.path.display(),
                               server = conn.address(), "queueing transfer job");
                        pending.insert(job.id, PendingJob {
                            connection: Arc::clone(conn),
                            file: file.clone(),
                            attempts: 1,
                        });
                        // Queue off-loop so a full job queue cannot stall
                        // notification handling.
                        let tx = job_tx.clone();
                        tokio::spawn(async move { tx.send(job).await });
                    }
                }
                notification = notification_rx.recv() => {
                    let Some(notification) = notification else { break };
                    self.handle_notification(
                        &notification,
                        &config,
                        &job_tx,
                        &notification_tx,
                        &mut pending,
                        &mut completed_servers,
                        connections.len(),
                        &watchers,
                    );
                }
            }
        }

        // Teardown cascades: closing the watchers ends the file stream,
        // dropping the job queue drains the workers.
        for watcher in &mut watchers {
            watcher.close();
        }
        drop(job_tx);
        for conn in &connections {
            self.fan_out(&ServerNotification {
                kind: NotificationKind::Disconnected,
                job_id: None,
                server_index: conn.index(),
                address: conn.address().to_string(),
                file: None,
                last_transferred: 0,
                error: None,
            });
        }
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .clear();
        store.close()?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_notification(
        &self,
        notification: &ServerNotification,
        config: &ClientConfig,
        job_tx: &mpsc::Sender<TransferJob>,
        notification_tx: &mpsc::Sender<ServerNotification>,
        pending: &mut HashMap<Uuid, PendingJob>,
        completed_servers: &mut HashMap<PathBuf, HashSet<u16>>,
        connection_count: usize,
        watchers: &[DirectoryWatcher],
    ) {
        self.fan_out(notification);

        let Some(job_id) = notification.job_id else {
            return;
        };

        match notification.kind {
            NotificationKind::QueryError | NotificationKind::TransferError => {
                let Some(entry) = pending.get_mut(&job_id) else {
                    return;
                };
                if entry.attempts < MAX_TRANSFER_ATTEMPTS {
                    entry.attempts += 1;
                    let delay = Duration::from_secs(1_u64 << (entry.attempts - 1).min(4));
                    warn!(job_id = %job_id, attempt = entry.attempts, ?delay,
                          error = notification.error.as_deref().unwrap_or(""),
                          "transfer failed, re-queueing");
                    let mut job = TransferJob::new(
                        Arc::clone(&entry.connection),
                        entry.file.clone(),
                        notification_tx.clone(),
                    );
                    job.id = job_id;
                    job.delay = delay;
                    let tx = job_tx.clone();
                    tokio::spawn(async move { tx.send(job).await });
                } else {
                    let entry = pending.remove(&job_id).expect("entry just seen");
                    warn!(job_id = %job_id, path = %entry.file.path.display(),
                          "transfer attempts exhausted, deferring to watcher");
                    // Evict the watch record and bump mtime so the watcher
                    // re-announces the file later.
                    for watcher in watchers {
                        watcher.remove_watched_file(&entry.file.path);
                    }
                    if let Err(e) = fsutil::touch(&entry.file.path) {
                        debug!(path = %entry.file.path.display(), error = %e, "touch failed");
                    }
                }
            }
            NotificationKind::FatalError => {
                pending.remove(&job_id);
                if let Some(file) = &notification.file {
                    error!(path = %file.path.display(),
                           error = notification.error.as_deref().unwrap_or(""),
                           "fatal local error, file skipped");
                }
            }
            NotificationKind::Completed => {
                pending.remove(&job_id);
                let Some(file) = &notification.file else {
                    return;
                };
                let servers = completed_servers.entry(file.path.clone()).or_default();
                servers.insert(notification.server_index);
                info!(path = %file.path.display(), server = %notification.address,
                      "file transfer completed");
                if config.delete_on_complete && servers.len() >= connection_count {
                    completed_servers.remove(&file.path);
                    for watcher in watchers {
                        watcher.remove_watched_file(&file.path);
                    }
                    match std::fs::remove_file(&file.path) {
                        Ok(()) => info!(path = %file.path.display(), "removed local file"),
                        Err(e) => warn!(path = %file.path.display(), error = %e,
                                        "could not remove local file"),
                    }
                }
            }
            _ => {}
        }
    }

    fn fan_out(&self, notification: &ServerNotification) {
        let subscribers = self
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .clone();
        for tx in subscribers {
            if tx.try_send(notification.clone()).is_err() {
                debug!("subscriber queue full, dropping notification");
            }
        }
    }
}

/// Resolves when the process receives SIGINT, SIGTERM or SIGHUP.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return tokio::signal::ctrl_c().await.unwrap_or(()),
        };
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(_) => return tokio::signal::ctrl_c().await.unwrap_or(()),
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
            _ = hup.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
