//! End-to-end transfer tests over loopback.
//!
//! These exercise the full query/stream protocol against a real server:
//! fresh uploads, short-circuiting on content already present, resuming a
//! severed stream from the server's offset, media-prefix path mapping, and
//! the error frame for streams with no registered file.

mod common;

use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use torrxfer_core::client::{NotificationKind, RpcClient, TransferClient, TransferEvent};
use torrxfer_core::config::{ClientConfig, WatchedDirectory};
use torrxfer_core::crypto;
use torrxfer_core::protocol::{
    self, ChunkPayload, FileInfo, MessageType, TransferBeginPayload,
};
use torrxfer_core::DEFAULT_BLOCK_SIZE;

use common::{patterned_bytes, TestServer};

/// Run a complete transfer of `path` and return the server's response to
/// the initial query.
async fn transfer_file(client: &RpcClient, path: &std::path::Path, media_prefix: &str) -> FileInfo {
    let correlation = Uuid::new_v4();
    let info = FileInfo::from_local_file(path, media_prefix)
        .await
        .expect("build info");
    let remote = client
        .query_file(&info, correlation)
        .await
        .expect("query");

    let local = tokio::fs::File::open(path).await.expect("open local");
    let mut events = client
        .transfer_file(local, DEFAULT_BLOCK_SIZE, 0, correlation)
        .await
        .expect("open stream");

    let mut closed = false;
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Closed => closed = true,
            TransferEvent::Failed(e) => panic!("transfer failed: {e}"),
            TransferEvent::Bytes { .. } => {}
        }
    }
    assert!(closed, "stream should close cleanly");
    remote
}

#[tokio::test]
async fn fresh_file_reaches_server_with_matching_hash() {
    let media_dir = TempDir::new().unwrap();
    let db_dir = TempDir::new().unwrap();
    let local_dir = TempDir::new().unwrap();
    let server = TestServer::spawn(media_dir.path(), db_dir.path()).await;

    let content = patterned_bytes(1024 * 1024, 7);
    let local_path = local_dir.path().join("a.bin");
    std::fs::write(&local_path, &content).unwrap();

    let client = RpcClient::connect(&server.entry()).await.expect("connect");
    let remote = transfer_file(&client, &local_path, "").await;
    assert_eq!(remote.size_on_disk, 0, "fresh file starts empty");
    assert!(remote.data_hash.is_empty(), "fresh file has no partial hash");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let received = std::fs::read(media_dir.path().join("a.bin")).expect("server file");
    assert_eq!(received.len(), content.len());
    assert_eq!(crypto::sha256_hex(&received), crypto::sha256_hex(&content));

    server.stop().await;
}

#[tokio::test]
async fn second_query_short_circuits_on_hash() {
    let media_dir = TempDir::new().unwrap();
    let db_dir = TempDir::new().unwrap();
    let local_dir = TempDir::new().unwrap();
    let server = TestServer::spawn(media_dir.path(), db_dir.path()).await;

    let content = patterned_bytes(64 * 1024, 11);
    let local_path = local_dir.path().join("done.bin");
    std::fs::write(&local_path, &content).unwrap();

    let client = RpcClient::connect(&server.entry()).await.expect("connect");
    transfer_file(&client, &local_path, "").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Re-announce the same content: the response hash now equals the full
    // local hash, which is the client's short-circuit condition.
    let info = FileInfo::from_local_file(&local_path, "")
        .await
        .expect("build info");
    let remote = client
        .query_file(&info, Uuid::new_v4())
        .await
        .expect("second query");
    assert_eq!(remote.data_hash, info.data_hash);
    assert_eq!(remote.size_on_disk, info.size);

    server.stop().await;
}

#[tokio::test]
async fn severed_stream_resumes_from_server_offset() {
    let media_dir = TempDir::new().unwrap();
    let db_dir = TempDir::new().unwrap();
    let local_dir = TempDir::new().unwrap();
    let server = TestServer::spawn(media_dir.path(), db_dir.path()).await;

    let content = patterned_bytes(200 * 1024, 13);
    let local_path = local_dir.path().join("big.bin");
    std::fs::write(&local_path, &content).unwrap();

    let client = RpcClient::connect(&server.entry()).await.expect("connect");
    let correlation = Uuid::new_v4();
    let info = FileInfo::from_local_file(&local_path, "")
        .await
        .expect("build info");
    let remote = client
        .query_file(&info, correlation)
        .await
        .expect("query");
    assert_eq!(remote.size_on_disk, 0);

    // Stream the first 60 KiB by hand, then sever the connection without a
    // TransferDone.
    let partial = 60 * 1024;
    {
        let mut stream = tokio::net::TcpStream::connect(server.addr)
            .await
            .expect("dial");
        let payload = protocol::encode_payload(&TransferBeginPayload {
            client_id: correlation,
        })
        .unwrap();
        protocol::write_frame(&mut stream, MessageType::TransferBegin, &payload)
            .await
            .expect("begin");

        let mut offset = 0usize;
        while offset < partial {
            let end = (offset + DEFAULT_BLOCK_SIZE as usize).min(partial);
            let chunk = ChunkPayload {
                offset: offset as u64,
                data: content[offset..end].to_vec(),
            };
            protocol::write_frame(
                &mut stream,
                MessageType::TransferChunk,
                &protocol::encode_chunk(&chunk),
            )
            .await
            .expect("chunk");
            offset = end;
        }
        // Dropped here: the server sees EOF and persists the partial.
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // A new query reports the partial size and the hash of the on-disk
    // prefix, which matches our local prefix.
    let correlation = Uuid::new_v4();
    let remote = client
        .query_file(&info, correlation)
        .await
        .expect("resume query");
    assert_eq!(remote.size_on_disk, partial as u64);
    let local_prefix_hash = crypto::sha256_file_prefix(&local_path, partial as u64)
        .await
        .expect("prefix hash");
    assert_eq!(remote.data_hash, local_prefix_hash);

    // Seek and stream the remainder.
    use tokio::io::AsyncSeekExt;
    let mut local = tokio::fs::File::open(&local_path).await.expect("open");
    local
        .seek(std::io::SeekFrom::Start(partial as u64))
        .await
        .expect("seek");
    let mut events = client
        .transfer_file(local, DEFAULT_BLOCK_SIZE, partial as u64, correlation)
        .await
        .expect("open stream");
    let mut resumed_bytes = 0u64;
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Bytes {
                last_transferred, ..
            } => resumed_bytes += last_transferred,
            TransferEvent::Closed => {}
            TransferEvent::Failed(e) => panic!("resume failed: {e}"),
        }
    }
    assert_eq!(resumed_bytes, (content.len() - partial) as u64);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let received = std::fs::read(media_dir.path().join("big.bin")).expect("server file");
    assert_eq!(received.len(), content.len());
    assert_eq!(crypto::sha256_hex(&received), crypto::sha256_hex(&content));

    server.stop().await;
}

#[tokio::test]
async fn media_prefix_is_preserved_beneath_media_root() {
    let media_dir = TempDir::new().unwrap();
    let db_dir = TempDir::new().unwrap();
    let local_dir = TempDir::new().unwrap();
    let server = TestServer::spawn(media_dir.path(), db_dir.path()).await;

    let content = patterned_bytes(8 * 1024, 17);
    let local_path = local_dir.path().join("ep1.mp4");
    std::fs::write(&local_path, &content).unwrap();

    let client = RpcClient::connect(&server.entry()).await.expect("connect");
    transfer_file(&client, &local_path, "tv/show").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let dest = media_dir.path().join("tv/show/ep1.mp4");
    assert!(dest.exists(), "file lands beneath the media prefix");
    assert_eq!(std::fs::read(dest).unwrap(), content);

    server.stop().await;
}

#[tokio::test]
async fn stream_without_registered_file_gets_error_frame() {
    let media_dir = TempDir::new().unwrap();
    let db_dir = TempDir::new().unwrap();
    let server = TestServer::spawn(media_dir.path(), db_dir.path()).await;

    let mut stream = tokio::net::TcpStream::connect(server.addr)
        .await
        .expect("dial");
    let payload = protocol::encode_payload(&TransferBeginPayload {
        client_id: Uuid::new_v4(),
    })
    .unwrap();
    protocol::write_frame(&mut stream, MessageType::TransferBegin, &payload)
        .await
        .expect("begin");

    let (header, _) = protocol::read_frame(&mut stream).await.expect("response");
    assert_eq!(header.message_type, MessageType::Error);

    server.stop().await;
}

#[tokio::test]
async fn failed_attempt_can_be_retried_to_completion() {
    let media_dir = TempDir::new().unwrap();
    let db_dir = TempDir::new().unwrap();
    let local_dir = TempDir::new().unwrap();
    let server = TestServer::spawn(media_dir.path(), db_dir.path()).await;

    let content = patterned_bytes(32 * 1024, 19);
    let local_path = local_dir.path().join("retry.bin");
    std::fs::write(&local_path, &content).unwrap();

    let client = RpcClient::connect(&server.entry()).await.expect("connect");

    // First attempt uses a correlation id the server never saw: the stream
    // is refused, which the client surfaces as a retryable failure.
    let local = tokio::fs::File::open(&local_path).await.expect("open");
    let mut events = client
        .transfer_file(local, DEFAULT_BLOCK_SIZE, 0, Uuid::new_v4())
        .await
        .expect("open stream");
    let mut saw_failure = false;
    while let Some(event) = events.recv().await {
        if let TransferEvent::Failed(e) = event {
            assert!(e.is_recoverable(), "stream refusal should be retryable");
            saw_failure = true;
        }
    }
    assert!(saw_failure);

    // The retry goes through the normal query-then-transfer path.
    transfer_file(&client, &local_path, "").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let received = std::fs::read(media_dir.path().join("retry.bin")).expect("server file");
    assert_eq!(crypto::sha256_hex(&received), crypto::sha256_hex(&content));

    server.stop().await;
}

#[tokio::test]
async fn orchestrator_moves_watched_file_end_to_end() {
    let media_dir = TempDir::new().unwrap();
    let db_dir = TempDir::new().unwrap();
    let watch_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let server = TestServer::spawn(media_dir.path(), db_dir.path()).await;

    let content = patterned_bytes(256 * 1024, 23);
    let nested = watch_dir.path().join("tv/show");
    std::fs::create_dir_all(&nested).unwrap();
    std::fs::write(nested.join("ep1.mp4"), &content).unwrap();

    let config = ClientConfig {
        servers: vec![server.entry()],
        watched_directories: vec![WatchedDirectory {
            directory: nested.clone(),
            media_root: watch_dir.path().to_path_buf(),
        }],
        delete_on_complete: false,
    };

    let client = TransferClient::new()
        .with_write_duration(Duration::from_millis(200))
        .with_store_dir(store_dir.path().to_path_buf());
    let mut notifications = client.subscribe();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let run = tokio::spawn(async move {
        client
            .run_until(config, async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    // Wait for the completion notification, summing progress on the way.
    let mut transferred = 0u64;
    let mut completed = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !completed {
        let n = tokio::time::timeout_at(deadline, notifications.recv())
            .await
            .expect("notification before deadline")
            .expect("notification stream open");
        match n.kind {
            NotificationKind::FilesUpdated => transferred += n.last_transferred,
            NotificationKind::Completed => completed = true,
            NotificationKind::FatalError => panic!("fatal: {:?}", n.error),
            _ => {}
        }
    }
    assert_eq!(transferred, content.len() as u64);

    let dest = media_dir.path().join("tv/show/ep1.mp4");
    let received = std::fs::read(&dest).expect("server file");
    assert_eq!(crypto::sha256_hex(&received), crypto::sha256_hex(&content));

    let _ = shutdown_tx.send(());
    run.await.expect("client task").expect("client run");
    server.stop().await;
}

#[tokio::test]
async fn delete_on_complete_removes_local_file() {
    let media_dir = TempDir::new().unwrap();
    let db_dir = TempDir::new().unwrap();
    let watch_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let server = TestServer::spawn(media_dir.path(), db_dir.path()).await;

    let content = patterned_bytes(16 * 1024, 29);
    let local_path = watch_dir.path().join("consumed.bin");
    std::fs::write(&local_path, &content).unwrap();

    let config = ClientConfig {
        servers: vec![server.entry()],
        watched_directories: vec![WatchedDirectory {
            directory: watch_dir.path().to_path_buf(),
            media_root: watch_dir.path().to_path_buf(),
        }],
        delete_on_complete: true,
    };

    let client = TransferClient::new()
        .with_write_duration(Duration::from_millis(200))
        .with_store_dir(store_dir.path().to_path_buf());
    let mut notifications = client.subscribe();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let run = tokio::spawn(async move {
        client
            .run_until(config, async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let n = tokio::time::timeout_at(deadline, notifications.recv())
            .await
            .expect("notification before deadline")
            .expect("notification stream open");
        if n.kind == NotificationKind::Completed {
            break;
        }
    }

    // Deletion happens in the orchestrator right after Completed.
    let mut gone = false;
    for _ in 0..50 {
        if !local_path.exists() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(gone, "local file should be removed after completion");

    let received = std::fs::read(media_dir.path().join("consumed.bin")).expect("server file");
    assert_eq!(crypto::sha256_hex(&received), crypto::sha256_hex(&content));

    let _ = shutdown_tx.send(());
    run.await.expect("client task").expect("client run");
    server.stop().await;
}
