//! File Transfer Client Module
//!
//! This module implements the client side of the session protocol:
//! - Establishes the TLS connection to the server
//! - Answers the authentication prompts
//! - Issues commands and drives the chunked transfers, waiting for the
//!   per-chunk acknowledgement on upload
//! - Verifies transfer integrity against the server's reported SHA-256
//!
//! [`ClientSession`] is generic over the stream; [`Client::connect`]
//! produces one over TLS, tests build one over an in-memory duplex.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::auth::AUTH_SUCCESSFUL;
use crate::protocol::{
    Framing, ACK, CHUNK_SIZE, CMD_DELETE, CMD_DOWNLOAD, CMD_LIST, CMD_QUIT, CMD_UPLOAD, CMD_VIEW,
    NO_FILES, READY,
};
use crate::tls::ClientTlsConfig;

/// Client configuration
pub struct ClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// TLS configuration
    pub tls_config: ClientTlsConfig,
}

/// File transfer client
pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Connect to the server and return a session ready to authenticate.
    pub async fn connect(
        &self,
    ) -> Result<ClientSession<tokio_rustls::client::TlsStream<TcpStream>>> {
        info!("🔗 Connecting to {}...", self.config.server_addr);

        let tcp_stream = TcpStream::connect(&self.config.server_addr)
            .await
            .with_context(|| format!("Failed to connect to {}", self.config.server_addr))?;

        let connector = TlsConnector::from(self.config.tls_config.config.clone());
        let tls_stream = connector
            .connect(self.config.tls_config.server_name.clone(), tcp_stream)
            .await
            .context("TLS handshake failed")?;

        info!("🔐 TLS connection established");

        let (_, conn_info) = tls_stream.get_ref();
        if let Some(protocol) = conn_info.protocol_version() {
            debug!("  Protocol: {:?}", protocol);
        }
        if let Some(cipher) = conn_info.negotiated_cipher_suite() {
            debug!("  Cipher: {:?}", cipher.suite());
        }

        Ok(ClientSession::new(tls_stream))
    }
}

/// Connected client session
pub struct ClientSession<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: BufWriter<WriteHalf<S>>,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already-secured stream in a session.
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        }
    }

    /// Answer the server's credential prompts.
    ///
    /// Must be called exactly once, before any command. Fails if the server
    /// rejects the pair; the server ends the session after a rejection.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let prompt = Framing::receive_control(&mut self.reader).await?;
        debug!("Server prompt: {}", prompt.trim_end());
        Framing::send_control(&mut self.writer, username).await?;

        let prompt = Framing::receive_control(&mut self.reader).await?;
        debug!("Server prompt: {}", prompt.trim_end());
        Framing::send_control(&mut self.writer, password).await?;

        let verdict = Framing::receive_control(&mut self.reader).await?;
        if verdict != AUTH_SUCCESSFUL {
            bail!("{verdict}");
        }

        info!("✅ Authenticated as {}", username);
        Ok(())
    }

    /// Upload a local file, returning the server's confirmation line.
    pub async fn upload(&mut self, local_path: &Path, remote_name: &str) -> Result<String> {
        let metadata = fs::metadata(local_path)
            .await
            .with_context(|| format!("Failed to read metadata for {local_path:?}"))?;
        if metadata.is_dir() {
            bail!("Cannot upload a directory: {local_path:?}");
        }
        let file_size = metadata.len();

        Framing::send_control(&mut self.writer, CMD_UPLOAD).await?;
        Framing::send_control(&mut self.writer, remote_name).await?;

        let status = Framing::receive_control(&mut self.reader).await?;
        if status != READY {
            bail!("Upload rejected: {status}");
        }

        info!("📤 Uploading {:?} as '{}'...", local_path, remote_name);

        let file = File::open(local_path).await?;
        let mut file = BufReader::new(file);
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut hasher = Sha256::new();
        let mut sent: u64 = 0;
        let mut server_error: Option<String> = None;

        let pb = create_progress_bar(file_size);
        pb.set_message("Uploading");

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }

            Framing::send_chunk(&mut self.writer, &buf[..n]).await?;

            // One chunk in flight: the next read of the file waits until the
            // server has acknowledged this one.
            let reply = Framing::receive_control(&mut self.reader).await?;
            if reply != ACK {
                server_error = Some(reply);
                break;
            }

            hasher.update(&buf[..n]);
            sent += n as u64;
            pb.set_position(sent);
        }

        Framing::send_end_of_stream(&mut self.writer).await?;
        let confirmation = Framing::receive_control(&mut self.reader).await?;
        pb.finish_and_clear();

        if let Some(error) = server_error {
            bail!("Upload failed: {error}");
        }
        if !confirmation.contains("uploaded successfully") {
            bail!("Upload failed: {confirmation}");
        }

        let digest = hex::encode(hasher.finalize());
        if !confirmation.contains(&digest) {
            bail!("Integrity check failed: sent sha256 {digest}, server reported '{confirmation}'");
        }

        info!("✅ {}", confirmation);
        Ok(confirmation)
    }

    /// Download a remote entry to `local_path`, returning the byte count.
    pub async fn download(&mut self, remote_name: &str, local_path: &Path) -> Result<u64> {
        Framing::send_control(&mut self.writer, CMD_DOWNLOAD).await?;
        Framing::send_control(&mut self.writer, remote_name).await?;

        let status = Framing::receive_control(&mut self.reader).await?;
        let Some(rest) = status.strip_prefix("OK ") else {
            bail!("Download failed: {status}");
        };
        let mut parts = rest.split_whitespace();
        let (Some(size), Some(expected_digest)) = (parts.next(), parts.next()) else {
            bail!("Malformed download status: {status}");
        };
        let file_size: u64 = size
            .parse()
            .with_context(|| format!("Malformed download status: {status}"))?;

        info!(
            "📥 Downloading '{}' ({} bytes) to {:?}...",
            remote_name, file_size, local_path
        );

        if let Some(parent) = local_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let file = File::create(local_path)
            .await
            .with_context(|| format!("Failed to create file: {local_path:?}"))?;
        let mut file = BufWriter::new(file);
        let mut buf = Vec::new();
        let mut hasher = Sha256::new();
        let mut received: u64 = 0;

        let pb = create_progress_bar(file_size);
        pb.set_message("Downloading");

        while let Some(n) = Framing::receive_chunk(&mut self.reader, &mut buf).await? {
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            received += n as u64;
            pb.set_position(received);
        }

        file.flush().await?;
        drop(file);
        pb.finish_and_clear();

        let digest = hex::encode(hasher.finalize());
        if digest != expected_digest {
            fs::remove_file(local_path).await?;
            bail!(
                "Integrity check failed: expected sha256 {expected_digest}, got {digest}. \
                 File deleted."
            );
        }

        info!("✅ Downloaded {} bytes, sha256 verified", received);
        Ok(received)
    }

    /// Fetch the preview of a remote entry.
    pub async fn view(&mut self, remote_name: &str) -> Result<String> {
        Framing::send_control(&mut self.writer, CMD_VIEW).await?;
        Framing::send_control(&mut self.writer, remote_name).await?;
        Ok(Framing::receive_control(&mut self.reader).await?)
    }

    /// Delete a remote entry, returning the server's response line.
    pub async fn delete(&mut self, remote_name: &str) -> Result<String> {
        Framing::send_control(&mut self.writer, CMD_DELETE).await?;
        Framing::send_control(&mut self.writer, remote_name).await?;
        Ok(Framing::receive_control(&mut self.reader).await?)
    }

    /// List the remote entries for the authenticated user.
    pub async fn list(&mut self) -> Result<Vec<String>> {
        Framing::send_control(&mut self.writer, CMD_LIST).await?;
        let listing = Framing::receive_control(&mut self.reader).await?;

        if listing == NO_FILES {
            return Ok(Vec::new());
        }
        Ok(listing.lines().map(String::from).collect())
    }

    /// End the session cleanly. The server sends no reply to `quit`.
    pub async fn quit(mut self) -> Result<()> {
        Framing::send_control(&mut self.writer, CMD_QUIT).await?;
        Ok(())
    }
}

/// Create progress bar for transfers
fn create_progress_bar(total_size: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb
}
