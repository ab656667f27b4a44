//! Per-server session state.
//!
//! One [`ServerConnection`] exists per configured remote for the lifetime of
//! the client. Mutable counters live behind a reader-writer lock; accessors
//! take the read lock, workers mutate under the write lock and emit their
//! notifications only after it is released, so slow subscribers never stall
//! the critical section.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::client::file::WatchedFile;
use crate::client::rpc::RpcClient;
use crate::config::ServerEntry;
use crate::error::Result;

#[derive(Debug, Default)]
struct ConnectionState {
    bytes_transferred: u64,
    files_transferred: HashMap<PathBuf, WatchedFile>,
    file_transfer_status: HashMap<PathBuf, u64>,
}

/// Session state for one remote server.
#[derive(Debug)]
pub struct ServerConnection {
    index: u16,
    address: String,
    port: u16,
    connection_time: DateTime<Utc>,
    rpc: RpcClient,
    state: RwLock<ConnectionState>,
}

impl ServerConnection {
    /// Connect to a configured server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or TLS setup fails.
    pub async fn connect(index: u16, entry: &ServerEntry) -> Result<Self> {
        let rpc = RpcClient::connect(entry).await?;
        Ok(Self {
            index,
            address: entry.address.clone(),
            port: entry.port,
            connection_time: Utc::now(),
            rpc,
            state: RwLock::new(ConnectionState::default()),
        })
    }

    /// Stable index assigned in configuration order.
    #[must_use]
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Server host name or IP.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Server port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// When this connection was established.
    #[must_use]
    pub fn connection_time(&self) -> DateTime<Utc> {
        self.connection_time
    }

    /// Cumulative bytes sent to this server in this session.
    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.state
            .read()
            .expect("connection lock poisoned")
            .bytes_transferred
    }

    /// Current byte count for one file in this session, 0 if unknown.
    #[must_use]
    pub fn file_size_on_server(&self, path: &Path) -> u64 {
        self.state
            .read()
            .expect("connection lock poisoned")
            .file_transfer_status
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    /// Files sent (fully or partially) to this server in this session.
    #[must_use]
    pub fn files_transferred(&self) -> Vec<WatchedFile> {
        self.state
            .read()
            .expect("connection lock poisoned")
            .files_transferred
            .values()
            .cloned()
            .collect()
    }

    /// The underlying RPC stub.
    #[must_use]
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// Record that a transfer attempt began at `offset`.
    pub(crate) fn record_file_started(&self, file: &WatchedFile, offset: u64) {
        let mut state = self.state.write().expect("connection lock poisoned");
        state
            .files_transferred
            .insert(file.path.clone(), file.clone());
        state.file_transfer_status.insert(file.path.clone(), offset);
    }

    /// Record `n` more bytes delivered for `path`.
    pub(crate) fn record_bytes(&self, path: &Path, n: u64) {
        let mut state = self.state.write().expect("connection lock poisoned");
        state.bytes_transferred += n;
        *state
            .file_transfer_status
            .entry(path.to_path_buf())
            .or_insert(0) += n;
    }

    /// Record a file as fully present on the server.
    pub(crate) fn record_completed(&self, file: &WatchedFile, size_on_server: u64) {
        let mut state = self.state.write().expect("connection lock poisoned");
        state
            .files_transferred
            .insert(file.path.clone(), file.clone());
        state
            .file_transfer_status
            .insert(file.path.clone(), size_on_server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file(path: &str) -> WatchedFile {
        WatchedFile {
            path: PathBuf::from(path),
            media_prefix: String::new(),
            size: 100,
            modified_time: None,
            watch_time: None,
            transfer_time: None,
        }
    }

    fn bare_connection() -> ServerConnection {
        ServerConnection {
            index: 0,
            address: "localhost".to_string(),
            port: crate::DEFAULT_PORT,
            connection_time: Utc::now(),
            rpc: RpcClient::unconnected("localhost", crate::DEFAULT_PORT),
            state: RwLock::new(ConnectionState::default()),
        }
    }

    #[test]
    fn unknown_file_reports_zero() {
        let conn = bare_connection();
        assert_eq!(conn.file_size_on_server(Path::new("/nope")), 0);
        assert_eq!(conn.bytes_transferred(), 0);
    }

    #[test]
    fn byte_accounting_accumulates() {
        let conn = bare_connection();
        let file = sample_file("/watch/a.bin");

        conn.record_file_started(&file, 50);
        conn.record_bytes(&file.path, 10);
        conn.record_bytes(&file.path, 15);

        assert_eq!(conn.bytes_transferred(), 25);
        assert_eq!(conn.file_size_on_server(&file.path), 75);
        assert_eq!(conn.files_transferred().len(), 1);
    }

    #[test]
    fn completion_records_final_size() {
        let conn = bare_connection();
        let file = sample_file("/watch/b.bin");

        conn.record_completed(&file, 100);
        assert_eq!(conn.file_size_on_server(&file.path), 100);
    }
}
