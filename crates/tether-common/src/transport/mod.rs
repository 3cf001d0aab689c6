//! Tether Transport Layer
//!
//! This module delimits messages on a byte stream. It is agnostic of the
//! stream type: anything implementing tokio's `AsyncRead`/`AsyncWrite` works,
//! which keeps sessions testable over in-memory pipes.
//!
//! # Components
//!
//! - **[`Framing`]**: length-prefixed or raw-chunk mode
//! - **[`encode_frame`]** / **[`write_frame`]**: outbound encoding
//! - **[`read_frame`]**: inbound decoding
//!
//! # Message Size Limits
//!
//! Length-prefixed reads enforce a configurable maximum payload size
//! (100 MB by default) so a hostile length header cannot force a huge
//! allocation.

pub mod framing;

pub use framing::{
    encode_frame, map_io_error, read_frame, write_frame, Framing, DEFAULT_CHUNK_SIZE, HEADER_LEN,
    MAX_FRAME_SIZE,
};
