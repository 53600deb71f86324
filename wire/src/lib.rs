//! Wire protocol shared by the tetherfs endpoints.
//!
//! # Overview
//!
//! The filesystem and the helper process on the device speak a small
//! request/response protocol over a reliable byte stream. This crate owns
//! everything that touches the bytes:
//!
//! - A minimal transport seam ([Sink]/[Stream]) with a TCP implementation
//!   and an in-memory [mocks::Channel] pair for tests.
//! - Little-endian framing primitives ([frame]): fixed-width integers and
//!   `u64`-length-prefixed byte fields.
//! - The thirteen procedure payloads ([Request]/[Response]) and the
//!   streaming directory-listing channel ([Dirent]).
//! - The connection handshake ([READY]).
//!
//! # Format
//!
//! Every request is a one-byte procedure tag followed by the procedure's
//! fields in declaration order. Every response begins with a status byte
//! (`0` = success followed by the response payload, nonzero = a POSIX errno
//! from [Status] and no payload). All integers are little-endian and all
//! variable-length fields carry a `u64` length prefix, so the encoding is
//! bit-exact on every platform.

pub mod frame;
pub mod message;
pub mod mocks;
pub mod transport;

pub use message::{Attrs, Dirent, Procedure, Request, Response, Status, Timespec};
pub use transport::{Sink, Stream};

use thiserror::Error;

/// Greeting written by the server immediately after accepting a connection.
///
/// The client reads exactly this many bytes before issuing its first
/// request; any other greeting aborts the connection.
pub const READY: &[u8; 15] = b"SERVER_IS_READY";

/// Upper bound on the announced length of any variable-length field.
///
/// A peer announcing a longer field is treated as a protocol error before
/// any allocation happens.
pub const MAX_FIELD_LEN: u64 = 64 * 1024 * 1024;

/// Errors raised by the transport and the codec.
///
/// All variants are fatal for the connection they occur on; none are
/// retried. Remote operation failures are not errors at this layer, they
/// travel as [Status] values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer closed the connection.
    #[error("stream closed")]
    Closed,
    /// Reading from the transport failed.
    #[error("read failed")]
    ReadFailed,
    /// Writing to the transport failed.
    #[error("write failed")]
    WriteFailed,
    /// The transport timed out.
    #[error("timed out")]
    Timeout,
    /// Binding the listening socket failed.
    #[error("bind failed")]
    BindFailed,
    /// The server greeting did not match [READY].
    #[error("handshake mismatch")]
    HandshakeMismatch,
    /// Received a procedure tag outside the defined range.
    #[error("unknown procedure tag {0}")]
    UnknownProcedure(u8),
    /// A variable-length field announced more than [MAX_FIELD_LEN] bytes.
    #[error("field of {0} bytes exceeds limit")]
    FieldTooLarge(u64),
    /// A path or directory entry name was not valid UTF-8.
    #[error("invalid utf-8 in path or name")]
    InvalidUtf8,
}
