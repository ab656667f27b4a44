//! # Torrxfer Core Library
//!
//! `torrxfer-core` implements a directory-watching file-transfer pipeline:
//! a client watches local directories for media files that have settled
//! (no writes for a debounce window) and streams them to one or more remote
//! servers, preserving a configurable sub-path of the source tree beneath
//! each server's media root. Files already present on a server are skipped;
//! partial uploads are resumed from the server's current offset after a
//! prefix-hash check.
//!
//! ## Modules
//!
//! - [`client`] - Transfer client: orchestrator, server connections, worker pool
//! - [`config`] - Client (JSON) and server (environment) configuration
//! - [`crypto`] - SHA-256 hashing and TLS configuration
//! - [`mod@error`] - Unified error type
//! - [`fsutil`] - Path canonicalisation and advisory file locking
//! - [`protocol`] - TXFR wire protocol: frames, payloads, chunk codec
//! - [`server`] - Transfer server: query/transfer handlers and file writers
//! - [`store`] - Embedded key-value store with hashed keys
//! - [`watcher`] - Debounced recursive directory watcher
//!
//! ## Example
//!
//! ```rust,ignore
//! use torrxfer_core::client::TransferClient;
//! use torrxfer_core::config::ClientConfig;
//!
//! let config = ClientConfig::from_file("client.json")?;
//! let client = TransferClient::new();
//! client.run(config).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fsutil;
pub mod protocol;
pub mod server;
pub mod store;
pub mod watcher;

pub use error::{Error, Result};

use std::time::Duration;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version (major, minor)
pub const PROTOCOL_VERSION: (u8, u8) = (1, 0);

/// Default server port
pub const DEFAULT_PORT: u16 = 9650;

/// Default server bind/connect address
pub const DEFAULT_ADDRESS: &str = "localhost";

/// Block size for streaming file data (bytes)
pub const DEFAULT_BLOCK_SIZE: u32 = 1024;

/// Quiescence window after the last write before a file is announced
pub const DEFAULT_WRITE_DURATION: Duration = Duration::from_secs(10);

/// Number of transfer workers per client
pub const DEFAULT_WORKER_COUNT: usize = 5;

/// Deadline for the metadata-only query call
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the orchestrator's job queue
pub const JOB_QUEUE_CAPACITY: usize = 100;

/// Capacity required of notification subscriber channels
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 500;

/// Store operations between maintenance flushes
pub const STORE_FLUSH_THRESHOLD: usize = 1000;

/// Bound on transfer attempts for a single job
pub const MAX_TRANSFER_ATTEMPTS: u32 = 5;

/// Per-read idle deadline on the server's transfer stream
pub const TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a server writer waits for the first chunk before giving up
pub const FIRST_CHUNK_TIMEOUT: Duration = Duration::from_secs(60);
