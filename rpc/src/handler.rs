//! The procedure surface implemented by the device side.

use bytes::Bytes;
use std::future::Future;
use tetherfs_wire::{Attrs, Dirent, Status, Timespec};

/// One method per procedure; the server dispatcher routes each decoded
/// request to the matching method and encodes the result.
///
/// Every method returns `Result<_, Status>`: a handler failure is a remote
/// operation error carried back to the client as a status byte, never a
/// transport fault. Implementations map their underlying errno through
/// [Status::from_errno], which folds anything outside the wire table into
/// [Status::InvalidArgument].
pub trait Handler: Send + Sync + 'static {
    /// List the children of a directory, excluding `.` and `..`.
    ///
    /// A per-entry stat failure must not abort the listing; the entry is
    /// dropped instead.
    fn listdir(&self, path: &str) -> impl Future<Output = Result<Vec<Dirent>, Status>> + Send;

    /// Stat with `lstat` semantics: symlinks are not traversed.
    fn stat(&self, path: &str) -> impl Future<Output = Result<Attrs, Status>> + Send;

    /// Read the target of a symlink.
    fn readlink(&self, path: &str) -> impl Future<Output = Result<String, Status>> + Send;

    /// Create an empty regular file.
    fn mknod(&self, path: &str) -> impl Future<Output = Result<(), Status>> + Send;

    /// Create a directory.
    fn mkdir(&self, path: &str) -> impl Future<Output = Result<(), Status>> + Send;

    /// Remove a file.
    fn unlink(&self, path: &str) -> impl Future<Output = Result<(), Status>> + Send;

    /// Remove an empty directory.
    fn rmdir(&self, path: &str) -> impl Future<Output = Result<(), Status>> + Send;

    /// Rename with a kernel flag word.
    ///
    /// If the kernel cannot honor the requested flags (for example
    /// exchange on a filesystem without it), the handler reports
    /// [Status::InvalidArgument].
    fn rename(
        &self,
        from: &str,
        to: &str,
        flags: u32,
    ) -> impl Future<Output = Result<(), Status>> + Send;

    /// Truncate or extend a file.
    fn truncate(&self, path: &str, size: i64) -> impl Future<Output = Result<(), Status>> + Send;

    /// Read up to `size` bytes at `offset`. A short read at end of file is
    /// success, not an error.
    fn read(
        &self,
        path: &str,
        offset: i64,
        size: u64,
    ) -> impl Future<Output = Result<Bytes, Status>> + Send;

    /// Write `data` at `offset`, returning the count actually written.
    fn write(
        &self,
        path: &str,
        offset: i64,
        data: &[u8],
    ) -> impl Future<Output = Result<u64, Status>> + Send;

    /// Set access and modification times.
    fn utimens(
        &self,
        path: &str,
        atime: Timespec,
        mtime: Timespec,
    ) -> impl Future<Output = Result<(), Status>> + Send;

    /// Copy up to `size` bytes between two files, stopping at end of input.
    /// A partial copy is success; the count copied is returned.
    fn copy_file_range(
        &self,
        in_path: &str,
        in_offset: i64,
        out_path: &str,
        out_offset: i64,
        size: u64,
    ) -> impl Future<Output = Result<u64, Status>> + Send;
}
