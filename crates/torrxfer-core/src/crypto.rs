//! Cryptographic primitives for torrxfer.
//!
//! This module provides:
//! - SHA-256 digests of byte slices, whole files, and file prefixes
//! - TLS configuration for the transfer channel
//!
//! File identity across the whole system is the lowercase hex SHA-256 of the
//! full file content; resume validation hashes only the first `offset` bytes
//! of the local file and compares against the server's partial-file hash.

use std::path::Path;
use std::sync::Arc;

use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Compute the lowercase hex SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_digest(hasher)
}

/// Compute the lowercase hex SHA-256 of a whole file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    sha256_reader(&mut file).await
}

/// Compute the lowercase hex SHA-256 of everything a reader yields.
///
/// # Errors
///
/// Returns an error if reading fails.
pub async fn sha256_reader<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_digest(hasher))
}

/// Compute the lowercase hex SHA-256 of the first `limit` bytes of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is shorter than `limit`.
pub async fn sha256_file_prefix(path: &Path, limit: u64) -> Result<String> {
    let file = tokio::fs::File::open(path).await?;
    let mut taken = file.take(limit);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = taken.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        hasher.update(&buf[..n]);
    }
    if total < limit {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("file shorter than prefix: {total} < {limit}"),
        )));
    }
    Ok(hex_digest(hasher))
}

fn hex_digest(hasher: Sha256) -> String {
    use std::fmt::Write;
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
}

/// TLS configuration for torrxfer connections.
///
/// Holds either a server or a client configuration. The server side loads
/// certificate material from PEM files or generates an ephemeral self-signed
/// certificate; the client side pins the certificate from the configured PEM
/// file and trusts nothing else.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    server: Option<Arc<rustls::ServerConfig>>,
    client: Option<Arc<rustls::ClientConfig>>,
}

impl TlsConfig {
    /// Create a server configuration from PEM certificate and key files.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be parsed or the configuration
    /// cannot be built.
    pub fn server_from_pem(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
            .map_err(|e| Error::TlsError(format!("failed to read certificate PEM: {e}")))?
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::TlsError(format!("failed to parse certificate PEM: {e}")))?;
        let key = PrivateKeyDer::from_pem_file(key_path)
            .map_err(|e| Error::TlsError(format!("failed to read private key PEM: {e}")))?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::TlsError(format!("failed to build server config: {e}")))?;

        Ok(Self {
            server: Some(Arc::new(config)),
            client: None,
        })
    }

    /// Create a server configuration with an ephemeral self-signed
    /// certificate for the given host names.
    ///
    /// # Errors
    ///
    /// Returns an error if certificate generation fails.
    pub fn server_self_signed(hosts: &[String]) -> Result<Self> {
        let cert_params = rcgen::CertificateParams::new(hosts.to_vec())
            .map_err(|e| Error::TlsError(format!("failed to create cert params: {e}")))?;
        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| Error::TlsError(format!("failed to generate key pair: {e}")))?;
        let cert = cert_params
            .self_signed(&key_pair)
            .map_err(|e| Error::TlsError(format!("failed to self-sign cert: {e}")))?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| Error::TlsError(format!("failed to convert private key: {e}")))?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| Error::TlsError(format!("failed to build server config: {e}")))?;

        Ok(Self {
            server: Some(Arc::new(config)),
            client: None,
        })
    }

    /// Create a client configuration that trusts exactly the certificate in
    /// the given PEM file.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate cannot be parsed or added to the
    /// root store.
    pub fn client_pinned(cert_path: &Path) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in CertificateDer::pem_file_iter(cert_path)
            .map_err(|e| Error::TlsError(format!("failed to read certificate PEM: {e}")))?
        {
            let cert =
                cert.map_err(|e| Error::TlsError(format!("failed to parse certificate: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| Error::TlsError(format!("untrusted certificate: {e}")))?;
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            server: None,
            client: Some(Arc::new(config)),
        })
    }

    /// Get the server configuration, if this is a server config.
    #[must_use]
    pub fn server_config(&self) -> Option<Arc<rustls::ServerConfig>> {
        self.server.clone()
    }

    /// Get the client configuration, if this is a client config.
    #[must_use]
    pub fn client_config(&self) -> Option<Arc<rustls::ClientConfig>> {
        self.client.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn file_hash_matches_slice_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let content: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        assert_eq!(sha256_file(&path).await.unwrap(), sha256_hex(&content));
    }

    #[tokio::test]
    async fn prefix_hash_matches_truncated_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 199) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let prefix = sha256_file_prefix(&path, 3000).await.unwrap();
        assert_eq!(prefix, sha256_hex(&content[..3000]));
    }

    #[tokio::test]
    async fn prefix_hash_rejects_short_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"tiny").unwrap();

        assert!(sha256_file_prefix(&path, 100).await.is_err());
    }

    #[test]
    fn self_signed_server_config() {
        let config = TlsConfig::server_self_signed(&["localhost".to_string()]).unwrap();
        assert!(config.server_config().is_some());
        assert!(config.client_config().is_none());
    }
}
