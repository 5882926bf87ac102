//! File Transfer Server Module
//!
//! This module implements the server side of the session protocol:
//! - A supervisor that accepts TLS connections and runs one independent
//!   session task per connection
//! - The per-session command dispatcher
//! - The transfer engine behind the five commands (upload, download, view,
//!   delete, list)
//!
//! Sessions share nothing mutable: each task owns its stream halves and asks
//! the read-only [`StorageResolver`] and [`VerifyCredentials`] capabilities
//! for what it needs. Two sessions for the same identity writing the same
//! filename race at the filesystem; the last write wins.
//!
//! Per-command failures (missing file, rejected filename, storage errors)
//! are reported to the peer as a control message and the command loop keeps
//! going. Channel-level failures end the session; the supervisor logs them
//! and the other sessions never notice.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{authenticate, AuthError, VerifyCredentials};
use crate::protocol::{
    Framing, ProtocolError, ACK, CHUNK_SIZE, CMD_DELETE, CMD_DOWNLOAD, CMD_LIST, CMD_QUIT,
    CMD_UPLOAD, CMD_VIEW, INVALID_ACTION, NOT_FOUND, NO_FILES, READY,
};
use crate::storage::{restrict_entry_permissions, Identity, StorageResolver};
use crate::tls::ServerTlsConfig;

/// Size of the prefix served by `view`.
pub const PREVIEW_SIZE: usize = 1024;

/// How many bytes of a binary file the hex preview shows.
const BINARY_PREVIEW_LEN: usize = 100;

/// Server configuration
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Root directory for per-user storage
    pub storage_root: PathBuf,
    /// TLS configuration
    pub tls_config: ServerTlsConfig,
    /// Maximum concurrent sessions
    pub max_conns: usize,
}

/// File transfer server: accepts connections and supervises sessions.
pub struct Server {
    config: ServerConfig,
    verifier: Arc<dyn VerifyCredentials>,
    conn_limit: Arc<Semaphore>,
}

impl Server {
    pub fn new(config: ServerConfig, verifier: Arc<dyn VerifyCredentials>) -> Self {
        let conn_limit = Arc::new(Semaphore::new(config.max_conns));
        Self {
            config,
            verifier,
            conn_limit,
        }
    }

    /// Accept and serve connections until `shutdown` fires, then let the
    /// in-flight sessions drain.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        fs::create_dir_all(&self.config.storage_root)
            .await
            .with_context(|| {
                format!(
                    "Failed to create storage root: {:?}",
                    self.config.storage_root
                )
            })?;
        let resolver = StorageResolver::new(&self.config.storage_root);

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.bind_addr))?;

        info!("🔒 File transfer server listening on {}", self.config.bind_addr);
        info!("📁 Storage root: {:?}", self.config.storage_root);

        let tls_acceptor = TlsAcceptor::from(self.config.tls_config.config.clone());
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (tcp_stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let permit = match self.conn_limit.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("Connection limit reached, rejecting {}", peer_addr);
                            continue;
                        }
                    };

                    let tls_acceptor = tls_acceptor.clone();
                    let verifier = self.verifier.clone();
                    let resolver = resolver.clone();

                    sessions.spawn(async move {
                        let _permit = permit;

                        match handle_connection(tcp_stream, tls_acceptor, peer_addr, verifier, resolver)
                            .await
                        {
                            Ok(()) => debug!("Connection from {} closed normally", peer_addr),
                            Err(e) => warn!("Connection from {} error: {}", peer_addr, e),
                        }
                    });
                }
            }
        }

        if !sessions.is_empty() {
            info!("Waiting for {} active session(s) to finish", sessions.len());
        }
        while sessions.join_next().await.is_some() {}

        Ok(())
    }
}

/// Handle a single accepted connection: TLS handshake, then the session.
async fn handle_connection(
    tcp_stream: TcpStream,
    tls_acceptor: TlsAcceptor,
    peer_addr: SocketAddr,
    verifier: Arc<dyn VerifyCredentials>,
    resolver: StorageResolver,
) -> Result<()> {
    info!("📥 New connection from {}", peer_addr);

    let tls_stream = tls_acceptor
        .accept(tcp_stream)
        .await
        .context("TLS handshake failed")?;

    debug!("TLS handshake successful with {}", peer_addr);

    serve_session(tls_stream, &peer_addr.to_string(), verifier.as_ref(), &resolver).await?;
    Ok(())
}

/// Run one full session over an already-secured byte stream.
///
/// Authenticates the peer, then loops on commands until `quit`, disconnect,
/// or a channel failure. Generic over the stream so sessions can run over
/// in-memory pipes in tests exactly as they run over TLS in production.
pub async fn serve_session<S>(
    stream: S,
    peer: &str,
    verifier: &dyn VerifyCredentials,
    resolver: &StorageResolver,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    let identity = match authenticate(&mut reader, &mut writer, verifier).await {
        Ok(identity) => identity,
        Err(AuthError::Rejected { .. }) => return Ok(()),
        Err(AuthError::Protocol(e)) => return Err(e),
    };

    loop {
        let action = match Framing::receive_control(&mut reader).await {
            Ok(action) => action,
            Err(ProtocolError::ChannelClosed) => {
                info!("Client {} disconnected", peer);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let action = action.trim();

        info!("User {} requested action: {}", identity, action);

        match action {
            CMD_UPLOAD | CMD_DOWNLOAD | CMD_VIEW | CMD_DELETE => {
                let filename = Framing::receive_control(&mut reader).await?;
                let filename = filename.trim();

                match action {
                    CMD_UPLOAD => {
                        handle_upload(&mut reader, &mut writer, resolver, &identity, filename)
                            .await?
                    }
                    CMD_DOWNLOAD => {
                        handle_download(&mut writer, resolver, &identity, filename).await?
                    }
                    CMD_VIEW => handle_view(&mut writer, resolver, &identity, filename).await?,
                    _ => handle_delete(&mut writer, resolver, &identity, filename).await?,
                }
            }
            CMD_LIST => handle_list(&mut writer, resolver, &identity).await?,
            CMD_QUIT => {
                info!("User {} disconnected", identity);
                return Ok(());
            }
            _ => Framing::send_control(&mut writer, INVALID_ACTION).await?,
        }
    }
}

/// Receive an upload into the identity's storage.
///
/// Replies `OK` once the destination is open, then acknowledges every chunk
/// before the peer may send the next one, so at most one chunk is ever in
/// flight. Chunk delivery is exactly-once: the transport is ordered and
/// reliable, and a lost acknowledgement implies a dead channel, which aborts
/// the transfer and removes the partial entry instead of inviting a
/// retransmit.
async fn handle_upload<R, W>(
    reader: &mut R,
    writer: &mut W,
    resolver: &StorageResolver,
    identity: &Identity,
    filename: &str,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let path = match resolver.resolve(identity, filename).await {
        Ok(path) => path,
        Err(e) => {
            return Framing::send_control(writer, &format!("Error uploading file: {e}")).await;
        }
    };

    let file = match File::create(&path).await {
        Ok(file) => file,
        Err(e) => {
            return Framing::send_control(writer, &format!("Error uploading file: {e}")).await;
        }
    };
    let mut file = BufWriter::new(file);

    Framing::send_control(writer, READY).await?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;
    // Once a write fails we keep draining chunks (answering with the error
    // text instead of ACK) so both ends stay frame-aligned through the
    // peer's end-of-stream.
    let mut failed: Option<String> = None;

    loop {
        let received = match Framing::receive_chunk(reader, &mut buf).await {
            Ok(received) => received,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&path).await;
                return Err(e);
            }
        };

        match received {
            Some(n) => {
                if failed.is_none() {
                    hasher.update(&buf[..n]);
                    if let Err(e) = file.write_all(&buf[..n]).await {
                        failed = Some(format!("Error uploading file: {e}"));
                    } else {
                        total += n as u64;
                    }
                }
                let reply = failed.as_deref().unwrap_or(ACK);
                Framing::send_control(writer, reply).await?;
            }
            None => break,
        }
    }

    if failed.is_none() {
        if let Err(e) = file.flush().await {
            failed = Some(format!("Error uploading file: {e}"));
        }
    }
    drop(file);

    if let Some(message) = failed {
        let _ = fs::remove_file(&path).await;
        return Framing::send_control(writer, &message).await;
    }

    if let Err(e) = restrict_entry_permissions(&path).await {
        return Framing::send_control(writer, &format!("Error uploading file: {e}")).await;
    }

    let digest = hex::encode(hasher.finalize());
    info!(
        "✅ User {} uploaded '{}' ({} bytes, sha256 {})",
        identity, filename, total, digest
    );

    Framing::send_control(
        writer,
        &format!("File '{filename}' uploaded successfully ({total} bytes, sha256 {digest})"),
    )
    .await
}

/// Stream a stored entry to the peer.
///
/// The status control comes first - `OK <size> <sha256>` or an error - so
/// the peer always knows whether a chunk stream follows. Chunks flow
/// without per-chunk acknowledgements and end with the end-of-stream frame.
async fn handle_download<W>(
    writer: &mut W,
    resolver: &StorageResolver,
    identity: &Identity,
    filename: &str,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let path = match resolver.resolve(identity, filename).await {
        Ok(path) => path,
        Err(e) => {
            return Framing::send_control(writer, &format!("Error downloading file: {e}")).await;
        }
    };

    let metadata = match fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Framing::send_control(writer, NOT_FOUND).await,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Framing::send_control(writer, NOT_FOUND).await;
        }
        Err(e) => {
            return Framing::send_control(writer, &format!("Error downloading file: {e}")).await;
        }
    };

    let digest = match file_digest(&path).await {
        Ok(digest) => digest,
        Err(e) => {
            return Framing::send_control(writer, &format!("Error downloading file: {e}")).await;
        }
    };

    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            return Framing::send_control(writer, &format!("Error downloading file: {e}")).await;
        }
    };

    Framing::send_control(writer, &format!("{READY} {} {digest}", metadata.len())).await?;

    info!(
        "📤 Sending '{}' to user {} ({} bytes)",
        filename,
        identity,
        metadata.len()
    );

    let mut file = BufReader::new(file);
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                // The binary stream has started; truncate it with an early
                // end-of-stream and let the digest mismatch tell the peer.
                error!("Error reading '{}' mid-download: {}", filename, e);
                break;
            }
        };
        Framing::send_chunk(writer, &buf[..n]).await?;
    }

    Framing::send_end_of_stream(writer).await
}

/// Send a bounded preview of a stored entry as one control message.
async fn handle_view<W>(
    writer: &mut W,
    resolver: &StorageResolver,
    identity: &Identity,
    filename: &str,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let path = match resolver.resolve(identity, filename).await {
        Ok(path) => path,
        Err(e) => {
            return Framing::send_control(writer, &format!("Error viewing file: {e}")).await;
        }
    };

    let metadata = match fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Framing::send_control(writer, NOT_FOUND).await,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Framing::send_control(writer, NOT_FOUND).await;
        }
        Err(e) => {
            return Framing::send_control(writer, &format!("Error viewing file: {e}")).await;
        }
    };

    let prefix = match read_prefix(&path, PREVIEW_SIZE).await {
        Ok(prefix) => prefix,
        Err(e) => {
            return Framing::send_control(writer, &format!("Error viewing file: {e}")).await;
        }
    };

    Framing::send_control(writer, &render_preview(&prefix, metadata.len())).await
}

/// Remove a stored entry.
async fn handle_delete<W>(
    writer: &mut W,
    resolver: &StorageResolver,
    identity: &Identity,
    filename: &str,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let path = match resolver.resolve(identity, filename).await {
        Ok(path) => path,
        Err(e) => {
            return Framing::send_control(writer, &format!("Error deleting file: {e}")).await;
        }
    };

    match fs::remove_file(&path).await {
        Ok(()) => {
            info!("🗑️  User {} deleted '{}'", identity, filename);
            Framing::send_control(writer, &format!("File '{filename}' deleted successfully."))
                .await
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Framing::send_control(writer, NOT_FOUND).await
        }
        Err(e) => Framing::send_control(writer, &format!("Error deleting file: {e}")).await,
    }
}

/// Send the identity's filenames, sorted, one per line.
async fn handle_list<W>(
    writer: &mut W,
    resolver: &StorageResolver,
    identity: &Identity,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let dir = match resolver.user_dir(identity).await {
        Ok(dir) => dir,
        Err(e) => {
            return Framing::send_control(writer, &format!("Error listing files: {e}")).await;
        }
    };

    let mut names = Vec::new();
    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) => {
            return Framing::send_control(writer, &format!("Error listing files: {e}")).await;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        match entry.file_type().await {
            Ok(kind) if kind.is_file() => names.push(name),
            _ => continue,
        }
    }

    names.sort();

    if names.is_empty() {
        Framing::send_control(writer, NO_FILES).await
    } else {
        Framing::send_control(writer, &names.join("\n")).await
    }
}

/// Format the `view` response for a file of `file_size` bytes whose first
/// bytes are `prefix`.
fn render_preview(prefix: &[u8], file_size: u64) -> String {
    let body = match std::str::from_utf8(prefix) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let hex_bytes: Vec<String> = prefix
                .iter()
                .take(BINARY_PREVIEW_LEN)
                .map(|byte| format!("{byte:02x}"))
                .collect();
            format!(
                "[Binary file preview]\n{}\n[Preview truncated...]",
                hex_bytes.join(" ")
            )
        }
    };

    format!("File size: {file_size} bytes\nPreview of first {PREVIEW_SIZE} bytes:\n\n{body}")
}

/// Read up to `limit` bytes from the start of `path`.
async fn read_prefix(path: &Path, limit: usize) -> io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    let mut buf = vec![0u8; limit];
    let mut filled = 0;

    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    buf.truncate(filled);
    Ok(buf)
}

/// SHA-256 of a file's full contents, hex encoded.
async fn file_digest(path: &Path) -> io::Result<String> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_of_utf8_prefix_is_verbatim() {
        let rendered = render_preview(b"hello, world\n", 13);
        assert_eq!(
            rendered,
            "File size: 13 bytes\nPreview of first 1024 bytes:\n\nhello, world\n"
        );
    }

    #[test]
    fn preview_of_binary_prefix_is_hex_annotated() {
        let rendered = render_preview(&[0xff, 0x00, 0xab], 4096);
        assert!(rendered.starts_with("File size: 4096 bytes\n"));
        assert!(rendered.contains("[Binary file preview]\nff 00 ab\n[Preview truncated...]"));
    }

    #[test]
    fn binary_preview_hexes_at_most_100_bytes() {
        let mut data = vec![0xf8u8; 300];
        data[0] = 0xff;
        let rendered = render_preview(&data, 300);
        let hex_line = rendered
            .lines()
            .find(|line| line.starts_with("ff"))
            .unwrap();
        assert_eq!(hex_line.split(' ').count(), BINARY_PREVIEW_LEN);
    }

    #[tokio::test]
    async fn read_prefix_stops_at_limit_and_at_eof() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("f");

        tokio::fs::write(&path, b"abc").await.unwrap();
        assert_eq!(read_prefix(&path, 10).await.unwrap(), b"abc");

        tokio::fs::write(&path, vec![7u8; 64]).await.unwrap();
        assert_eq!(read_prefix(&path, 16).await.unwrap(), vec![7u8; 16]);
    }

    #[tokio::test]
    async fn file_digest_matches_known_vector() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("f");
        tokio::fs::write(&path, b"Hello, World!").await.unwrap();

        assert_eq!(
            file_digest(&path).await.unwrap(),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }
}
