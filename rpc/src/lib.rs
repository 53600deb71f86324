//! RPC endpoints for tetherfs.
//!
//! # Overview
//!
//! The client stub and the server dispatcher, built on
//! [tetherfs-wire](tetherfs_wire). One side runs inside the filesystem
//! process and exposes a method per procedure; the other runs inside the
//! helper process on the device and maps each procedure onto local
//! filesystem operations through the [Handler] trait.
//!
//! Both endpoints are generic over the wire crate's transport seam, so the
//! entire request lifecycle can be exercised in tests over an in-memory
//! channel. The production [Server] accepts TCP connections with a backlog
//! of one: at most one client is served at a time, additional connections
//! wait in the listen queue.

pub mod client;
pub mod handler;
pub mod localfs;
pub mod server;

pub use client::{Client, Dirents};
pub use handler::Handler;
pub use localfs::LocalFs;
pub use server::{serve, Config, Server, StopHandle};

// The wire vocabulary shows up in every handler signature; re-export it.
pub use tetherfs_wire::{Attrs, Dirent, Status, Timespec};

use thiserror::Error as ThisError;

/// Failures surfaced by the RPC endpoints.
///
/// Transport and protocol faults ([Error::Stream]) are fatal for the
/// connection and are never retried here. Remote operation errors
/// ([Error::Remote]) are the statuses of the wire protocol, passed through
/// to the caller unchanged.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Transport or protocol failure.
    #[error("stream: {0}")]
    Stream(#[from] tetherfs_wire::Error),
    /// The remote operation failed.
    #[error("remote: {0}")]
    Remote(#[from] Status),
    /// The peer accepted fewer bytes than requested.
    ///
    /// The page cache treats this as fatal for the page being flushed.
    #[error("short write ({wrote}/{expected} bytes)")]
    ShortWrite { expected: usize, wrote: usize },
}
