//! Transfer job dispatch and the worker pool.
//!
//! Jobs map 1:1 to (file, server) pairs. The pool is a queue of queues:
//! every worker owns a single-slot job channel and re-publishes its sender
//! into the pool channel whenever it goes idle; the dispatcher pairs each
//! incoming job with the next idle worker, which keeps dispatch FIFO and
//! caps concurrent transfers at the pool size.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::client::connection::ServerConnection;
use crate::client::file::WatchedFile;
use crate::client::rpc::TransferEvent;
use crate::client::{NotificationKind, ServerNotification};
use crate::crypto;
use crate::error::Error;
use crate::protocol::FileInfo;
use crate::DEFAULT_BLOCK_SIZE;

/// One transfer attempt of one file to one server.
#[derive(Debug)]
pub struct TransferJob {
    /// Correlation UUID forwarded with every RPC of this attempt
    pub id: Uuid,
    /// Sleep before execution; non-zero on retries
    pub delay: Duration,
    /// Target server
    pub connection: Arc<ServerConnection>,
    /// File to deliver
    pub file: WatchedFile,
    /// Channel the worker reports notifications on
    pub notifications: mpsc::Sender<ServerNotification>,
}

impl TransferJob {
    /// Create a first-attempt job with no delay.
    #[must_use]
    pub fn new(
        connection: Arc<ServerConnection>,
        file: WatchedFile,
        notifications: mpsc::Sender<ServerNotification>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            delay: Duration::ZERO,
            connection,
            file,
            notifications,
        }
    }

    async fn notify(&self, kind: NotificationKind, last_transferred: u64, error: Option<&Error>) {
        let notification = ServerNotification {
            kind,
            job_id: Some(self.id),
            server_index: self.connection.index(),
            address: self.connection.address().to_string(),
            file: Some(self.file.clone()),
            last_transferred,
            error: error.map(ToString::to_string),
        };
        let _ = self.notifications.send(notification).await;
    }
}

enum WorkerMessage {
    Job(Box<TransferJob>),
    Shutdown,
}

/// Fans jobs out to a fixed pool of transfer workers.
#[derive(Debug)]
pub struct Dispatcher {
    job_rx: mpsc::Receiver<TransferJob>,
    max_workers: usize,
}

impl Dispatcher {
    /// Create a dispatcher reading from `job_rx`.
    #[must_use]
    pub fn new(job_rx: mpsc::Receiver<TransferJob>, max_workers: usize) -> Self {
        Self {
            job_rx,
            max_workers,
        }
    }

    /// Spawn the workers and the dispatch loop.
    pub fn run(self) {
        tokio::spawn(dispatch(self.job_rx, self.max_workers));
    }
}

async fn dispatch(mut job_rx: mpsc::Receiver<TransferJob>, max_workers: usize) {
    let (pool_tx, mut pool_rx) = mpsc::channel::<mpsc::Sender<WorkerMessage>>(max_workers);

    for id in 1..=max_workers {
        let (worker_tx, worker_rx) = mpsc::channel::<WorkerMessage>(1);
        tokio::spawn(worker(id, worker_tx, worker_rx, pool_tx.clone()));
    }
    drop(pool_tx);

    while let Some(job) = job_rx.recv().await {
        trace!(job_id = %job.id, "fetching idle worker");
        let Some(worker_tx) = pool_rx.recv().await else {
            break;
        };
        let _ = worker_tx.send(WorkerMessage::Job(Box::new(job))).await;
    }

    // Input closed: retire each worker as it reports idle.
    debug!("job queue closed, draining workers");
    for _ in 0..max_workers {
        if let Some(worker_tx) = pool_rx.recv().await {
            let _ = worker_tx.send(WorkerMessage::Shutdown).await;
        }
    }
}

async fn worker(
    id: usize,
    worker_tx: mpsc::Sender<WorkerMessage>,
    mut worker_rx: mpsc::Receiver<WorkerMessage>,
    pool_tx: mpsc::Sender<mpsc::Sender<WorkerMessage>>,
) {
    loop {
        if pool_tx.send(worker_tx.clone()).await.is_err() {
            return;
        }
        match worker_rx.recv().await {
            Some(WorkerMessage::Job(job)) => {
                trace!(worker = id, job_id = %job.id, delay = ?job.delay, "worker started");
                if !job.delay.is_zero() {
                    tokio::time::sleep(job.delay).await;
                }
                do_file_transfer_job(*job).await;
            }
            Some(WorkerMessage::Shutdown) | None => return,
        }
    }
}

/// One (file, server) transfer attempt: query, short-circuit, offset
/// negotiation, then the chunk stream.
async fn do_file_transfer_job(mut job: TransferJob) {
    use tokio::io::AsyncSeekExt;

    job.file.transfer_time = Some(Utc::now());
    let path = job.file.path.clone();

    // Prime the server for the file.
    let local_info = match FileInfo::from_local_file(&path, &job.file.media_prefix).await {
        Ok(info) => info,
        Err(e) => {
            job.notify(NotificationKind::QueryError, 0, Some(&e)).await;
            return;
        }
    };
    let remote_info = match job.connection.rpc().query_file(&local_info, job.id).await {
        Ok(info) => info,
        Err(e) => {
            job.notify(NotificationKind::QueryError, 0, Some(&e)).await;
            return;
        }
    };

    // Fully present remotely, by content hash or by size.
    let hash_matches =
        !local_info.data_hash.is_empty() && local_info.data_hash == remote_info.data_hash;
    if hash_matches || local_info.size == remote_info.size_on_disk {
        job.connection
            .record_completed(&job.file, remote_info.size_on_disk);
        job.notify(NotificationKind::Completed, 0, None).await;
        return;
    }

    let mut local = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            job.notify(NotificationKind::FatalError, 0, Some(&Error::Io(e)))
                .await;
            return;
        }
    };

    // Continue from the server's offset only if our prefix matches its
    // partial file; otherwise start over.
    let mut offset = remote_info.size_on_disk;
    if offset > 0 {
        let prefix_hash = crypto::sha256_file_prefix(&path, offset)
            .await
            .unwrap_or_default();
        if prefix_hash.is_empty() || prefix_hash != remote_info.data_hash {
            offset = 0;
        }
    }
    if let Err(e) = local.seek(std::io::SeekFrom::Start(offset)).await {
        job.notify(NotificationKind::FatalError, 0, Some(&Error::Io(e)))
            .await;
        return;
    }

    let mut events = match job
        .connection
        .rpc()
        .transfer_file(local, DEFAULT_BLOCK_SIZE, offset, job.id)
        .await
    {
        Ok(events) => events,
        Err(e) => {
            job.notify(NotificationKind::TransferError, 0, Some(&e)).await;
            return;
        }
    };
    job.connection.record_file_started(&job.file, offset);

    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Bytes {
                last_transferred, ..
            } => {
                job.connection.record_bytes(&path, last_transferred);
                job.notify(NotificationKind::FilesUpdated, last_transferred, None)
                    .await;
            }
            TransferEvent::Closed => {
                job.notify(NotificationKind::Completed, 0, None).await;
            }
            TransferEvent::Failed(e) => {
                job.notify(NotificationKind::TransferError, 0, Some(&e)).await;
            }
        }
    }
}
