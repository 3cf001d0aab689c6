//! Tether Common Types and Transport
//!
//! This crate provides the error taxonomy, listener configuration and the
//! framing layer shared by every tether component.
//!
//! # Overview
//!
//! Tether embeds a single-threaded JavaScript engine inside a multi-connection
//! TCP server. This crate holds the pieces that do not depend on the engine:
//!
//! - **Protocol Layer**: [`TetherError`], [`ListenerConfig`] and the script-facing
//!   [`ListenOptions`]
//! - **Transport Layer**: length-prefixed and raw-chunk framing over any
//!   `AsyncRead`/`AsyncWrite` byte stream
//!
//! # Wire Format
//!
//! - **Length-prefixed**: `[4-byte length as u32 big-endian] + [payload]`
//! - **Raw chunk**: whatever a single read returned, up to the chunk size
//!
//! # Example
//!
//! ```
//! use tether_common::{encode_frame, Framing};
//!
//! let frame = encode_frame(Framing::LengthPrefixed, b"hi").unwrap();
//! assert_eq!(&frame[..], &[0, 0, 0, 2, b'h', b'i']);
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
pub use transport::*;
