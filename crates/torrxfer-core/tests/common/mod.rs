//! Shared helpers for integration tests.

use std::net::SocketAddr;
use std::path::Path;

use tokio::sync::oneshot;

use torrxfer_core::config::{ServerConfig, ServerEntry};
use torrxfer_core::server::TransferServer;

/// A server running on an ephemeral loopback port backed by temp dirs.
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Bind and serve in the background.
    pub async fn spawn(media_dir: &Path, db_dir: &Path) -> Self {
        let config = ServerConfig {
            address: "127.0.0.1".to_string(),
            port: 0,
            media_dir: media_dir.to_path_buf(),
            db_dir: Some(db_dir.to_path_buf()),
            ..ServerConfig::default()
        };
        let server = TransferServer::bind(config).await.expect("bind server");
        let addr = server.local_addr().expect("local addr");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            server
                .serve_until(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("serve");
        });

        Self {
            addr,
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    /// Client configuration entry pointing at this server.
    pub fn entry(&self) -> ServerEntry {
        ServerEntry {
            address: self.addr.ip().to_string(),
            port: self.addr.port(),
            secure: false,
            cert_file: None,
        }
    }

    /// Stop the server and wait for the accept loop to finish.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.handle.await;
    }
}

/// Deterministic pseudo-random content so hashes are reproducible per seed.
pub fn patterned_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (state >> 56) as u8
        })
        .collect()
}
