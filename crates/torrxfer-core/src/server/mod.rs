//! Transfer server.
//!
//! The server admits concurrent client streams and serialises all writes to
//! a single destination file through an in-process byte pipe consumed by one
//! writer task. A query registers the destination in the active-transfer
//! table keyed by the job's correlation UUID; the transfer stream that
//! follows looks the entry up, learns the authoritative starting offset
//! from the first chunk, and feeds data into the pipe. The writer holds an
//! OS advisory lock on the destination for its whole run and persists the
//! progress record when the pipe closes, whether or not the stream reached
//! the declared size — that record is what makes a later resume possible.

pub mod server_file;

pub use server_file::ServerFile;

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::crypto::{self, TlsConfig};
use crate::error::{Error, Result};
use crate::fsutil::{self, FileLock};
use crate::protocol::{
    self, FileInfo, MessageType, QueryPayload, TransferAckPayload, TransferBeginPayload,
    ERROR_CODE_INTERNAL, ERROR_CODE_INVALID_ARGUMENT,
};
use crate::store::KvStore;
use crate::{FIRST_CHUNK_TIMEOUT, TRANSFER_IDLE_TIMEOUT};

/// Server-side progress database file name.
const SERVER_DB_NAME: &str = "sfdb.dat";

/// Capacity of the in-process pipe between stream handler and writer.
const PIPE_CAPACITY: usize = 64;

/// One registered transfer: the write side of the pipe plus the writer's
/// control channels. Owned by the active-file table until its stream opens.
struct ActiveTransfer {
    data_tx: mpsc::Sender<Vec<u8>>,
    offset_tx: Option<oneshot::Sender<u64>>,
    error_rx: mpsc::Receiver<Error>,
    done_rx: oneshot::Receiver<u64>,
}

struct ServerInner {
    media_dir: PathBuf,
    store: Arc<KvStore>,
    active: Mutex<HashMap<String, ActiveTransfer>>,
}

/// The torrxfer server engine.
pub struct TransferServer {
    inner: Arc<ServerInner>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
}

impl std::fmt::Debug for TransferServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferServer")
            .field("media_dir", &self.inner.media_dir)
            .finish_non_exhaustive()
    }
}

impl TransferServer {
    /// Bind the listener and open the progress store.
    ///
    /// # Errors
    ///
    /// Returns an error if the media directory is unusable, the store
    /// cannot be opened, TLS material fails to load, or the bind fails.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.media_dir).await?;
        let media_dir = fsutil::clean_path(&config.media_dir)?;

        let store = match &config.db_dir {
            Some(dir) => KvStore::open(dir, SERVER_DB_NAME)?,
            None => KvStore::open_in_temp(SERVER_DB_NAME)?,
        };

        let acceptor = match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => {
                let tls = TlsConfig::server_from_pem(cert, key)?;
                let server_config = tls
                    .server_config()
                    .ok_or_else(|| Error::TlsError("no server TLS config".to_string()))?;
                Some(TlsAcceptor::from(server_config))
            }
            (None, None) => None,
            _ => {
                return Err(Error::ConfigError(
                    "CERTFILE and KEYFILE must be set together".to_string(),
                ))
            }
        };

        let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
        info!(addr = %listener.local_addr()?, media_dir = %media_dir.display(),
              tls = acceptor.is_some(), "server listening");

        Ok(Self {
            inner: Arc::new(ServerInner {
                media_dir,
                store: Arc::new(store),
                active: Mutex::new(HashMap::new()),
            }),
            listener,
            acceptor,
        })
    }

    /// Address the server is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until a termination signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the accept loop fails irrecoverably.
    pub async fn serve(self) -> Result<()> {
        self.serve_until(shutdown_signal()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the accept loop fails irrecoverably.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "connection accepted");
                    let inner = Arc::clone(&self.inner);
                    let acceptor = self.acceptor.clone();
                    tokio::spawn(async move {
                        let result = match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls) => handle_connection(inner, tls).await,
                                Err(e) => {
                                    warn!(%peer, error = %e, "TLS handshake failed");
                                    return;
                                }
                            },
                            None => handle_connection(inner, stream).await,
                        };
                        if let Err(e) = result {
                            debug!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
            }
        }

        // Drop every pending pipe so in-flight writers persist and exit.
        self.inner
            .active
            .lock()
            .expect("active table lock poisoned")
            .clear();
        self.inner.store.close()?;
        Ok(())
    }
}

async fn handle_connection<S>(inner: Arc<ServerInner>, mut stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (header, payload) = protocol::read_frame(&mut stream).await?;
    match header.message_type {
        MessageType::Query => handle_query_call(&inner, &mut stream, &payload).await,
        MessageType::TransferBegin => handle_transfer_call(&inner, &mut stream, &payload).await,
        other => {
            write_error(
                &mut stream,
                ERROR_CODE_INVALID_ARGUMENT,
                &format!("unexpected opening message {other:?}"),
            )
            .await
        }
    }
}

async fn write_error<S>(stream: &mut S, code: &str, message: &str) -> Result<()>
where
    S: AsyncWrite + Unpin + Send,
{
    let payload = protocol::encode_payload(&protocol::ErrorPayload {
        code: code.to_string(),
        message: message.to_string(),
    })?;
    protocol::write_frame(stream, MessageType::Error, &payload).await
}

async fn handle_query_call<S>(
    inner: &Arc<ServerInner>,
    stream: &mut S,
    payload: &[u8],
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let query: QueryPayload = match protocol::decode_payload(payload) {
        Ok(query) => query,
        Err(e) => {
            return write_error(stream, ERROR_CODE_INVALID_ARGUMENT, &e.to_string()).await;
        }
    };
    let client_id = query.client_id.to_string();
    info!(client = %client_id, file = %query.file.name, "query received");

    match handle_query(inner, &client_id, &query.file).await {
        Ok(response) => {
            let payload = protocol::encode_payload(&response)?;
            protocol::write_frame(stream, MessageType::QueryAck, &payload).await
        }
        Err(e) => {
            warn!(client = %client_id, error = %e, "query failed");
            write_error(stream, ERROR_CODE_INTERNAL, &e.to_string()).await
        }
    }
}

/// The query handler: decides fresh start, resume, or already-complete, and
/// registers a writer for anything that still needs bytes.
async fn handle_query(
    inner: &Arc<ServerInner>,
    client_id: &str,
    incoming: &FileInfo,
) -> Result<FileInfo> {
    let relative = PathBuf::from(&incoming.media_directory).join(&incoming.name);
    let dest = fsutil::sanitize_path(&inner.media_dir, &relative)
        .ok_or_else(|| Error::InvalidPath(relative.display().to_string()))?;

    let known = !incoming.data_hash.is_empty() && inner.store.has(&incoming.data_hash);

    if !known {
        debug!(file = %incoming.name, "file not found in store");
        // A stale file under the same destination belongs to some other
        // content; evict it before starting over.
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            debug!(dest = %dest.display(), "destination exists, removing");
            tokio::fs::remove_file(&dest).await?;
        }

        let record = ServerFile::new(dest, incoming.media_directory.clone(), incoming.size);
        if !incoming.data_hash.is_empty() {
            inner.store.put(&incoming.data_hash, &record.to_record())?;
        }
        let response = record.to_file_info(String::new());
        register_active(inner, client_id, incoming.data_hash.clone(), record);
        return Ok(response);
    }

    debug!(file = %incoming.name, "file found in store");
    let stored_text = inner
        .store
        .get(&incoming.data_hash)?
        .ok_or_else(|| Error::Internal("record vanished between has and get".to_string()))?;
    let stored = match ServerFile::from_record(&stored_text) {
        Ok(stored) => stored,
        Err(e) => {
            // Corrupt record; drop it and make the client retry from scratch.
            inner.store.delete(&incoming.data_hash)?;
            return Err(e);
        }
    };

    match tokio::fs::metadata(&dest).await {
        Ok(metadata) => {
            let disk_hash = crypto::sha256_file(&dest).await.unwrap_or_default();
            let record = ServerFile {
                full_path: dest,
                media_prefix: incoming.media_directory.clone(),
                size: incoming.size,
                current_size: metadata.len(),
                created_time: stored.created_time,
                modified_time: metadata.modified().ok().map(chrono::DateTime::from),
            };
            let response = record.to_file_info(disk_hash.clone());

            // The partial's hash equals the declared full hash: complete,
            // nothing to write.
            if !disk_hash.is_empty() && disk_hash == incoming.data_hash {
                return Ok(response);
            }
            register_active(inner, client_id, incoming.data_hash.clone(), record);
            Ok(response)
        }
        Err(_) => {
            // Known hash but the destination vanished: fresh start.
            let record = ServerFile {
                full_path: dest,
                media_prefix: incoming.media_directory.clone(),
                size: incoming.size,
                current_size: 0,
                created_time: stored.created_time,
                modified_time: None,
            };
            let response = record.to_file_info(String::new());
            register_active(inner, client_id, incoming.data_hash.clone(), record);
            Ok(response)
        }
    }
}

/// Create the pipe and control channels for one transfer and spawn its
/// writer. Replaces any stale registration for the same client.
fn register_active(inner: &Arc<ServerInner>, client_id: &str, db_key: String, record: ServerFile) {
    let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(PIPE_CAPACITY);
    let (offset_tx, offset_rx) = oneshot::channel();
    let (error_tx, error_rx) = mpsc::channel(1);
    let (done_tx, done_rx) = oneshot::channel();

    let store = Arc::clone(&inner.store);
    tokio::spawn(write_file(
        record, db_key, store, data_rx, offset_rx, error_tx, done_tx,
    ));

    let stale = inner
        .active
        .lock()
        .expect("active table lock poisoned")
        .insert(
            client_id.to_string(),
            ActiveTransfer {
                data_tx,
                offset_tx: Some(offset_tx),
                error_rx,
                done_rx,
            },
        );
    if stale.is_some() {
        debug!(client = %client_id, "replaced stale active transfer");
    }
}

/// Writer task: one per active file. Holds the advisory lock on the
/// destination for its entire run, waits for the stream to reveal the true
/// starting offset, then drains the pipe into the file and persists the
/// progress record.
async fn write_file(
    mut record: ServerFile,
    db_key: String,
    store: Arc<KvStore>,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    offset_rx: oneshot::Receiver<u64>,
    error_tx: mpsc::Sender<Error>,
    done_tx: oneshot::Sender<u64>,
) {
    debug!(dest = %record.full_path.display(), "writer started");

    let result = async {
        if let Some(parent) = record.full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let std_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&record.full_path)?;
        let lock = FileLock::acquire(&std_file)?;

        // The client may negotiate a different offset than the query
        // assumed; the first chunk is authoritative.
        let offset = match tokio::time::timeout(FIRST_CHUNK_TIMEOUT, offset_rx).await {
            Ok(Ok(offset)) => offset,
            Ok(Err(_)) => {
                // Pipe dropped before any chunk; nothing to do.
                return Ok(0);
            }
            Err(_) => {
                return Err(Error::Timeout(FIRST_CHUNK_TIMEOUT.as_secs()));
            }
        };
        record.current_size = offset;

        let mut file = tokio::fs::File::from_std(std_file.try_clone()?);
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut written: u64 = 0;
        while let Some(bytes) = data_rx.recv().await {
            file.write_all(&bytes).await?;
            record.current_size += bytes.len() as u64;
            written += bytes.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(lock);

        record.modified_time = Some(chrono::Utc::now());
        if !db_key.is_empty() {
            store.put(&db_key, &record.to_record())?;
        }
        Ok(written)
    }
    .await;

    match result {
        Ok(written) => {
            info!(dest = %record.full_path.display(), written,
                  current_size = record.current_size, "writer finished");
            let _ = done_tx.send(written);
        }
        Err(e) => {
            error!(dest = %record.full_path.display(), error = %e, "writer failed");
            let _ = error_tx.send(e).await;
        }
    }
}

/// The transfer stream handler: validates the correlation id, signals the
/// writer's starting offset exactly once, and feeds chunks into the pipe.
async fn handle_transfer_call<S>(
    inner: &Arc<ServerInner>,
    stream: &mut S,
    payload: &[u8],
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let begin: TransferBeginPayload = match protocol::decode_payload(payload) {
        Ok(begin) => begin,
        Err(e) => {
            return write_error(stream, ERROR_CODE_INVALID_ARGUMENT, &e.to_string()).await;
        }
    };
    let client_id = begin.client_id.to_string();

    let Some(mut active) = inner
        .active
        .lock()
        .expect("active table lock poisoned")
        .remove(&client_id)
    else {
        warn!(client = %client_id, "transfer stream without active file");
        return write_error(
            stream,
            ERROR_CODE_INTERNAL,
            &Error::NoActiveFile(client_id).to_string(),
        )
        .await;
    };
    info!(client = %client_id, "transfer stream opened");

    loop {
        let (header, payload) =
            match protocol::read_frame_with_timeout(stream, TRANSFER_IDLE_TIMEOUT).await {
                Ok(frame) => frame,
                Err(e) => {
                    // Stream died or idled out: close the pipe so the writer
                    // persists whatever landed, then give up on replying.
                    drop(active.data_tx);
                    let _ = active.done_rx.await;
                    return Err(e);
                }
            };

        match header.message_type {
            MessageType::TransferChunk => {
                let chunk = match protocol::decode_chunk(&payload) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        return write_error(stream, ERROR_CODE_INVALID_ARGUMENT, &e.to_string())
                            .await;
                    }
                };
                if let Some(offset_tx) = active.offset_tx.take() {
                    let _ = offset_tx.send(chunk.offset);
                }
                if active.data_tx.send(chunk.data).await.is_err() {
                    // Writer died; surface its error.
                    let reason = active
                        .error_rx
                        .try_recv()
                        .map_or_else(|_| "writer terminated".to_string(), |e| e.to_string());
                    return write_error(stream, ERROR_CODE_INTERNAL, &reason).await;
                }
                if let Ok(e) = active.error_rx.try_recv() {
                    return write_error(stream, ERROR_CODE_INTERNAL, &e.to_string()).await;
                }
            }
            MessageType::TransferDone => break,
            other => {
                return write_error(
                    stream,
                    ERROR_CODE_INVALID_ARGUMENT,
                    &format!("unexpected message {other:?} in transfer stream"),
                )
                .await;
            }
        }
    }

    // Close the write end of the pipe; the writer drains and reports.
    drop(active.data_tx);
    match active.done_rx.await {
        Ok(bytes_written) => {
            info!(client = %client_id, bytes_written, "transfer stream finished");
            let payload = protocol::encode_payload(&TransferAckPayload { bytes_written })?;
            protocol::write_frame(stream, MessageType::TransferAck, &payload).await
        }
        Err(_) => {
            let reason = active
                .error_rx
                .try_recv()
                .map_or_else(|_| "writer terminated".to_string(), |e| e.to_string());
            write_error(stream, ERROR_CODE_INTERNAL, &reason).await
        }
    }
}

/// Resolves when the process receives SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
