//! Client-side RPC stub.
//!
//! Each call runs on its own connection: a query is one request/response
//! round trip, a transfer opens a stream, feeds chunks from a background
//! task and reports progress on an event channel. The correlation UUID sent
//! with both calls is what lets the server route the transfer stream to the
//! file registered by the query.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls_pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::ServerEntry;
use crate::crypto::TlsConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    self, ChunkPayload, FileInfo, MessageType, QueryPayload, TransferBeginPayload,
};
use crate::QUERY_TIMEOUT;

/// Events reported while a transfer stream is running.
#[derive(Debug)]
pub enum TransferEvent {
    /// A block was sent successfully
    Bytes {
        /// Size of the block just sent
        last_transferred: u64,
        /// File offset after the block
        current_offset: u64,
    },
    /// The stream finished and the server acknowledged all bytes
    Closed,
    /// The stream failed
    Failed(Error),
}

/// One dialed connection, plain or TLS.
enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Enable OS-level TCP keep-alive so idle middleboxes do not drop
/// long-running transfer connections.
fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    Ok(())
}

/// Stub for one remote torrxfer server.
#[derive(Debug, Clone)]
pub struct RpcClient {
    address: String,
    port: u16,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl RpcClient {
    /// Stub pointing at an endpoint without probing it. Test-only.
    #[cfg(test)]
    pub(crate) fn unconnected(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
            tls: None,
        }
    }

    /// Build a stub from a configuration entry and verify the server is
    /// reachable with one probe connection.
    ///
    /// # Errors
    ///
    /// Returns an error if TLS material cannot be loaded or the probe
    /// connection fails.
    pub async fn connect(entry: &ServerEntry) -> Result<Self> {
        let tls = if entry.secure {
            let cert_file = entry.cert_file.as_deref().ok_or_else(|| {
                Error::TlsError(format!(
                    "server {} is marked Secure but has no CertFile",
                    entry.address
                ))
            })?;
            Some(
                TlsConfig::client_pinned(cert_file)?
                    .client_config()
                    .ok_or_else(|| Error::TlsError("no client TLS config".to_string()))?,
            )
        } else {
            None
        };

        let client = Self {
            address: entry.address.clone(),
            port: entry.port,
            tls,
        };
        // Fail fast on unreachable servers; the probe connection is dropped.
        drop(client.dial().await?);
        debug!(address = %client.address, port = client.port, "server reachable");
        Ok(client)
    }

    async fn dial(&self) -> Result<Transport> {
        let addr = format!("{}:{}", self.address, self.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::ConnectionFailed {
                address: addr.clone(),
                reason: e.to_string(),
            })?;
        configure_tcp_keepalive(&stream)?;

        match &self.tls {
            Some(config) => {
                let connector = TlsConnector::from(Arc::clone(config));
                let name = ServerName::try_from(self.address.clone())
                    .map_err(|e| Error::TlsError(format!("invalid server name: {e}")))?;
                let tls_stream = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| Error::TlsError(format!("TLS handshake failed: {e}")))?;
                Ok(Transport::Tls(Box::new(tls_stream)))
            }
            None => Ok(Transport::Plain(stream)),
        }
    }

    /// Query the server for its view of `file`.
    ///
    /// Runs under the metadata query deadline. The response carries
    /// `size_on_disk` and the hash of the server's current partial file.
    ///
    /// # Errors
    ///
    /// Returns an error if the call times out, the connection fails, or the
    /// server answers with an error frame.
    pub async fn query_file(&self, file: &FileInfo, correlation_id: Uuid) -> Result<FileInfo> {
        tokio::time::timeout(QUERY_TIMEOUT, self.query_inner(file, correlation_id))
            .await
            .map_err(|_| Error::Timeout(QUERY_TIMEOUT.as_secs()))?
    }

    async fn query_inner(&self, file: &FileInfo, correlation_id: Uuid) -> Result<FileInfo> {
        let mut stream = self.dial().await?;

        let payload = protocol::encode_payload(&QueryPayload {
            client_id: correlation_id,
            file: file.clone(),
        })?;
        protocol::write_frame(&mut stream, MessageType::Query, &payload).await?;

        let (header, payload) = protocol::read_frame(&mut stream).await?;
        match header.message_type {
            MessageType::QueryAck => protocol::decode_payload(&payload),
            MessageType::Error => Err(protocol::error_from_frame(&payload, true)),
            other => Err(Error::UnexpectedMessage {
                expected: "QueryAck".to_string(),
                actual: format!("{other:?}"),
            }),
        }
    }

    /// Open a transfer stream and feed `local` to the server from its
    /// current seek position.
    ///
    /// A background feeder task reads `block_size` chunks and sends them in
    /// offset order; progress, completion and failure are reported on the
    /// returned channel. The stream itself has no deadline — its liveness is
    /// the feeder.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened.
    pub async fn transfer_file(
        &self,
        local: tokio::fs::File,
        block_size: u32,
        offset: u64,
        correlation_id: Uuid,
    ) -> Result<mpsc::Receiver<TransferEvent>> {
        let mut stream = self.dial().await?;

        let payload = protocol::encode_payload(&TransferBeginPayload {
            client_id: correlation_id,
        })?;
        protocol::write_frame(&mut stream, MessageType::TransferBegin, &payload).await?;

        let (event_tx, event_rx) = mpsc::channel(64);
        tokio::spawn(feed_stream(stream, local, block_size, offset, event_tx));
        Ok(event_rx)
    }
}

/// Reads the local file in block-size chunks and streams them, then waits
/// for the server's acknowledgment.
async fn feed_stream(
    mut stream: Transport,
    mut local: tokio::fs::File,
    block_size: u32,
    starting_offset: u64,
    events: mpsc::Sender<TransferEvent>,
) {
    let mut current_offset = starting_offset;
    let mut buf = vec![0u8; block_size as usize];

    loop {
        let n = match local.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = events.send(TransferEvent::Failed(Error::Io(e))).await;
                return;
            }
        };

        let chunk = ChunkPayload {
            offset: current_offset,
            data: buf[..n].to_vec(),
        };
        trace!(size = n, offset = current_offset, "sending chunk");
        if let Err(e) = protocol::write_frame(
            &mut stream,
            MessageType::TransferChunk,
            &protocol::encode_chunk(&chunk),
        )
        .await
        {
            // A failed send mid-stream is transient; the job re-queues.
            let _ = events
                .send(TransferEvent::Failed(Error::TransferFailed(e.to_string())))
                .await;
            return;
        }

        current_offset += n as u64;
        let _ = events
            .send(TransferEvent::Bytes {
                last_transferred: n as u64,
                current_offset,
            })
            .await;
    }

    if let Err(e) = protocol::write_frame(&mut stream, MessageType::TransferDone, &[]).await {
        let _ = events
            .send(TransferEvent::Failed(Error::TransferFailed(e.to_string())))
            .await;
        return;
    }

    // The server's acknowledgment is the authoritative end of the stream.
    let event = match protocol::read_frame(&mut stream).await {
        Ok((header, payload)) => match header.message_type {
            MessageType::TransferAck => TransferEvent::Closed,
            MessageType::Error => {
                TransferEvent::Failed(protocol::error_from_frame(&payload, false))
            }
            other => TransferEvent::Failed(Error::UnexpectedMessage {
                expected: "TransferAck".to_string(),
                actual: format!("{other:?}"),
            }),
        },
        Err(e) => TransferEvent::Failed(Error::TransferFailed(e.to_string())),
    };
    let _ = events.send(event).await;
}
