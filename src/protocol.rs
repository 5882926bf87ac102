//! Wire Protocol Module
//!
//! This module defines the framing layer that turns the raw TLS byte stream
//! into discrete protocol units:
//! - Control frames carrying bounded UTF-8 text (prompts, commands, responses)
//! - Chunk frames carrying raw binary file content
//! - An explicit end-of-stream frame terminating a transfer
//!
//! ## Frame Format
//!
//! ```text
//! +------------+---------+------------------+
//! | Length (4) | Kind(1) | Payload (len-1)  |
//! +------------+---------+------------------+
//! ```
//!
//! The length field is a big-endian u32 counting the kind byte plus the
//! payload. Because every frame declares its size up front, chunk content is
//! never inspected for sentinels: a chunk whose bytes happen to spell a
//! command or an end marker is still just a chunk. The kind a receiver
//! expects at any point is fixed by the command/response sequence; the tag
//! byte turns a desynchronized stream into an immediate error instead of a
//! misread.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum declared frame length (16 MB) - prevents memory exhaustion from a
/// malicious or corrupt peer.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Chunk size for file transfers.
pub const CHUNK_SIZE: usize = 1024;

const KIND_CONTROL: u8 = 0;
const KIND_CHUNK: u8 = 1;
const KIND_END_OF_STREAM: u8 = 2;

/// Command vocabulary, exact lowercase tokens.
pub const CMD_UPLOAD: &str = "upload";
pub const CMD_DOWNLOAD: &str = "download";
pub const CMD_VIEW: &str = "view";
pub const CMD_DELETE: &str = "delete";
pub const CMD_LIST: &str = "list";
pub const CMD_QUIT: &str = "quit";

/// Per-chunk acknowledgement during an upload.
pub const ACK: &str = "ACK";
/// Go-ahead status: bare for upload, `OK <size> <sha256>` for download.
pub const READY: &str = "OK";
pub const NOT_FOUND: &str = "File not found";
pub const INVALID_ACTION: &str = "Invalid action";
pub const NO_FILES: &str = "No files found";

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The peer closed the stream, possibly mid-frame.
    #[error("channel closed by peer")]
    ChannelClosed,

    #[error("frame too large: {len} bytes (max: {max})")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("unknown frame kind: {0:#04x}")]
    UnknownFrameKind(u8),

    #[error("unexpected {got} frame, expected {expected}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },

    #[error("control frame is not valid UTF-8")]
    InvalidControlText(#[from] std::string::FromUtf8Error),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn kind_name(kind: u8) -> &'static str {
    match kind {
        KIND_CONTROL => "control",
        KIND_CHUNK => "chunk",
        KIND_END_OF_STREAM => "end-of-stream",
        _ => "unknown",
    }
}

/// An EOF from the transport means the peer went away; surface it as
/// `ChannelClosed` so sessions can tell disconnects apart from local
/// failures.
fn map_eof(e: io::Error) -> ProtocolError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::ChannelClosed
    } else {
        ProtocolError::Io(e)
    }
}

/// Framing codec for the session protocol.
///
/// All functions are generic over the stream halves so the same code runs
/// over a TLS stream in production and an in-memory duplex in tests.
pub struct Framing;

impl Framing {
    /// Send a control frame containing UTF-8 text.
    pub async fn send_control<W>(writer: &mut W, text: &str) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        Self::send_frame(writer, KIND_CONTROL, text.as_bytes()).await
    }

    /// Receive a control frame, returning its text.
    pub async fn receive_control<R>(reader: &mut R) -> Result<String, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let (kind, len) = Self::read_header(reader).await?;
        if kind != KIND_CONTROL {
            return Err(ProtocolError::UnexpectedFrame {
                expected: "control",
                got: kind_name(kind),
            });
        }
        let payload = Self::read_payload(reader, len).await?;
        Ok(String::from_utf8(payload)?)
    }

    /// Send one binary chunk of a transfer.
    pub async fn send_chunk<W>(writer: &mut W, data: &[u8]) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        Self::send_frame(writer, KIND_CHUNK, data).await
    }

    /// Receive the next transfer frame into `buf`.
    ///
    /// Returns `Some(n)` for a chunk of `n` bytes (now in `buf[..n]`) or
    /// `None` for the end-of-stream marker.
    pub async fn receive_chunk<R>(
        reader: &mut R,
        buf: &mut Vec<u8>,
    ) -> Result<Option<usize>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let (kind, len) = Self::read_header(reader).await?;
        match kind {
            KIND_CHUNK => {
                let n = len as usize - 1;
                if buf.len() < n {
                    buf.resize(n, 0);
                }
                reader.read_exact(&mut buf[..n]).await.map_err(map_eof)?;
                Ok(Some(n))
            }
            KIND_END_OF_STREAM => {
                if len != 1 {
                    return Err(ProtocolError::Malformed(
                        "end-of-stream frame carries a payload",
                    ));
                }
                Ok(None)
            }
            KIND_CONTROL => Err(ProtocolError::UnexpectedFrame {
                expected: "chunk or end-of-stream",
                got: "control",
            }),
            other => Err(ProtocolError::UnknownFrameKind(other)),
        }
    }

    /// Send the end-of-stream marker terminating a transfer.
    pub async fn send_end_of_stream<W>(writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        Self::send_frame(writer, KIND_END_OF_STREAM, &[]).await
    }

    async fn send_frame<W>(writer: &mut W, kind: u8, payload: &[u8]) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let len = payload.len() as u64 + 1;
        if len > MAX_FRAME_LEN as u64 {
            return Err(ProtocolError::FrameTooLarge {
                len: len.min(u32::MAX as u64) as u32,
                max: MAX_FRAME_LEN,
            });
        }

        writer.write_u32(len as u32).await?;
        writer.write_u8(kind).await?;
        writer.write_all(payload).await?;
        // The upload handshake waits on a reply per frame, so every frame
        // must reach the wire before the sender blocks on a read.
        writer.flush().await?;
        Ok(())
    }

    /// Read the length prefix and kind byte of the next frame.
    ///
    /// The returned length has already been validated: at least 1 (the kind
    /// byte) and at most `MAX_FRAME_LEN`. A stream that ends anywhere inside
    /// the header reports `ChannelClosed`.
    async fn read_header<R>(reader: &mut R) -> Result<(u8, u32), ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let len = reader.read_u32().await.map_err(map_eof)?;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        if len == 0 {
            return Err(ProtocolError::Malformed("zero-length frame"));
        }
        let kind = reader.read_u8().await.map_err(map_eof)?;
        Ok((kind, len))
    }

    async fn read_payload<R>(reader: &mut R, len: u32) -> Result<Vec<u8>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        // read_exact loops over short reads until the declared length is
        // fully consumed; a short read is never treated as end-of-channel.
        let mut payload = vec![0u8; len as usize - 1];
        reader.read_exact(&mut payload).await.map_err(map_eof)?;
        Ok(payload)
    }
}
