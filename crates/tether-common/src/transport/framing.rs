use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{Result, TetherError};

/// Size of the length header in length-prefixed mode.
pub const HEADER_LEN: usize = 4;

/// Read buffer size in raw-chunk mode.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Maximum length-prefixed payload (100 MB)
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// How message boundaries are delimited on a byte stream.
///
/// # Wire Protocol
///
/// In length-prefixed mode every message is a 4-byte big-endian length
/// followed by exactly that many payload bytes:
///
/// ```text
/// [4-byte length] [payload]
/// ```
///
/// There is no compression and no checksum. In raw-chunk mode there is no
/// delimiting at all: each read delivers whatever bytes arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    #[default]
    RawChunk,
    LengthPrefixed,
}

impl Framing {
    /// Maps the script-level `setHead(bool)` flag onto a framing mode.
    pub fn from_length_prefixed(length_prefixed: bool) -> Self {
        if length_prefixed {
            Framing::LengthPrefixed
        } else {
            Framing::RawChunk
        }
    }

    pub fn is_length_prefixed(self) -> bool {
        self == Framing::LengthPrefixed
    }
}

/// Encodes a payload for the wire.
///
/// In length-prefixed mode the 4-byte header is prepended; in raw-chunk mode
/// the payload is returned as-is.
///
/// # Errors
///
/// Returns `TetherError::Framing` if the payload does not fit a `u32` length.
pub fn encode_frame(framing: Framing, payload: &[u8]) -> Result<Bytes> {
    match framing {
        Framing::RawChunk => Ok(Bytes::copy_from_slice(payload)),
        Framing::LengthPrefixed => {
            let len = u32::try_from(payload.len()).map_err(|_| {
                TetherError::Framing(format!(
                    "payload of {} bytes does not fit a 4-byte length header",
                    payload.len()
                ))
            })?;

            let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
            buf.put_u32(len);
            buf.put_slice(payload);
            Ok(buf.freeze())
        }
    }
}

/// Reads one message from the stream.
///
/// # Arguments
///
/// * `reader` - The stream to read from
/// * `framing` - Framing mode for this read
/// * `chunk_size` - Buffer size for raw-chunk reads
/// * `max_frame_size` - Largest accepted length-prefixed payload
///
/// # Errors
///
/// - `TetherError::PeerClosed` if the stream ended cleanly before a message started
/// - `TetherError::Framing` on a short header, a short payload or an oversized length
/// - `TetherError::Connection` / `TetherError::Io` for other I/O failures
pub async fn read_frame<R>(
    reader: &mut R,
    framing: Framing,
    chunk_size: usize,
    max_frame_size: usize,
) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    match framing {
        Framing::LengthPrefixed => {
            let mut header = [0u8; HEADER_LEN];
            let mut filled = 0;
            while filled < HEADER_LEN {
                let n = reader
                    .read(&mut header[filled..])
                    .await
                    .map_err(|e| map_io_error(e, "reading length prefix"))?;
                if n == 0 {
                    return Err(if filled == 0 {
                        TetherError::PeerClosed
                    } else {
                        TetherError::Framing(format!(
                            "short read in length prefix ({} of {} bytes)",
                            filled, HEADER_LEN
                        ))
                    });
                }
                filled += n;
            }

            let len = u32::from_be_bytes(header) as usize;
            if len > max_frame_size {
                return Err(TetherError::Framing(format!(
                    "Message too large: {} bytes (max {} bytes)",
                    len, max_frame_size
                )));
            }

            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    TetherError::Framing(format!("short read: expected {} payload bytes", len))
                } else {
                    map_io_error(e, "reading payload")
                }
            })?;

            Ok(Bytes::from(buf))
        }
        Framing::RawChunk => {
            let mut buf = vec![0u8; chunk_size];
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| map_io_error(e, "reading chunk"))?;
            if n == 0 {
                return Err(TetherError::PeerClosed);
            }
            buf.truncate(n);
            Ok(Bytes::from(buf))
        }
    }
}

/// Encodes and writes one message, then flushes.
pub async fn write_frame<W>(writer: &mut W, framing: Framing, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(framing, payload)?;

    writer
        .write_all(&frame)
        .await
        .map_err(|e| map_io_error(e, "writing frame"))?;

    writer
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))?;

    Ok(())
}

/// Map IO errors to appropriate TetherError variants
///
/// - Unexpected EOF -> `PeerClosed`
/// - Reset/aborted/broken connections -> `Connection`
/// - Other IO errors -> `Io`
pub fn map_io_error(err: std::io::Error, context: &str) -> TetherError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof => TetherError::PeerClosed,
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::BrokenPipe => {
            TetherError::Connection(format!("{}: Connection lost", context))
        }
        _ => TetherError::Io(err),
    }
}
