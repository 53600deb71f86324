//! [Handler] that serves the local filesystem, used by the helper process
//! on the device.
//!
//! Each procedure maps onto a single syscall (or a short fixed sequence).
//! The blocking work runs on the runtime's blocking pool; every errno is
//! folded through [Status::from_errno] so only the statuses of the wire
//! table ever travel back.

use crate::Handler;
use bytes::Bytes;
use std::{
    ffi::CString,
    fs, io,
    os::unix::fs::{FileExt as _, MetadataExt as _},
    os::unix::io::AsRawFd as _,
};
use tetherfs_wire::{Attrs, Dirent, Status, Timespec, MAX_FIELD_LEN};
use tokio::task;
use tracing::debug;

/// Serve procedures against the local filesystem, paths taken as sent.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }
}

/// Run a blocking syscall job off the async executor.
async fn run<T, F>(job: F) -> Result<T, Status>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Status> + Send + 'static,
{
    task::spawn_blocking(job)
        .await
        .map_err(|_| Status::InvalidArgument)?
}

fn status_from(err: io::Error) -> Status {
    Status::from_errno(err.raw_os_error().unwrap_or(libc::EINVAL))
}

fn last_errno() -> Status {
    status_from(io::Error::last_os_error())
}

fn cstring(path: &str) -> Result<CString, Status> {
    CString::new(path).map_err(|_| Status::InvalidArgument)
}

fn attrs_from(md: &fs::Metadata) -> Attrs {
    Attrs {
        size: md.size() as i64,
        links: md.nlink(),
        mtime: Timespec {
            secs: md.mtime(),
            nanos: md.mtime_nsec(),
        },
        atime: Timespec {
            secs: md.atime(),
            nanos: md.atime_nsec(),
        },
        ctime: Timespec {
            secs: md.ctime(),
            nanos: md.ctime_nsec(),
        },
        mode: md.mode(),
        uid: md.uid(),
        gid: md.gid(),
    }
}

mod sys {
    use super::*;

    pub fn listdir(path: &str) -> Result<Vec<Dirent>, Status> {
        let dir = fs::read_dir(path).map_err(status_from)?;
        let mut entries = Vec::new();
        for entry in dir {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = ?e, "readdir entry failed");
                    continue;
                }
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                debug!(name = ?entry.file_name(), "skipping non-utf8 entry");
                continue;
            };
            // DirEntry::metadata stats relative to the open directory and
            // does not traverse symlinks. A failure drops the entry, never
            // the listing.
            let md = match entry.metadata() {
                Ok(md) => md,
                Err(e) => {
                    debug!(name, error = ?e, "failed to stat entry");
                    continue;
                }
            };
            entries.push(Dirent {
                name: name.to_owned(),
                attrs: attrs_from(&md),
            });
        }
        Ok(entries)
    }

    pub fn stat(path: &str) -> Result<Attrs, Status> {
        let md = fs::symlink_metadata(path).map_err(status_from)?;
        Ok(attrs_from(&md))
    }

    pub fn readlink(path: &str) -> Result<String, Status> {
        let target = fs::read_link(path).map_err(status_from)?;
        target
            .into_os_string()
            .into_string()
            .map_err(|_| Status::InvalidArgument)
    }

    pub fn mknod(path: &str) -> Result<(), Status> {
        let path = cstring(path)?;
        let rc = unsafe { libc::mknod(path.as_ptr(), libc::S_IFREG | 0o644, 0) };
        if rc < 0 {
            return Err(last_errno());
        }
        Ok(())
    }

    pub fn rename(from: &str, to: &str, flags: u32) -> Result<(), Status> {
        if flags == 0 {
            return fs::rename(from, to).map_err(status_from);
        }
        let from = cstring(from)?;
        let to = cstring(to)?;
        // Flagged renames go through renameat2; not every libc carries a
        // wrapper, so call it by number. Kernels or filesystems that cannot
        // honor the flags fail with EINVAL, which is what the wire reports.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_renameat2,
                libc::AT_FDCWD,
                from.as_ptr(),
                libc::AT_FDCWD,
                to.as_ptr(),
                flags,
            )
        };
        if rc < 0 {
            return Err(last_errno());
        }
        Ok(())
    }

    pub fn truncate(path: &str, size: i64) -> Result<(), Status> {
        if size < 0 {
            return Err(Status::InvalidArgument);
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(status_from)?;
        file.set_len(size as u64).map_err(status_from)
    }

    pub fn read(path: &str, offset: i64, size: u64) -> Result<Bytes, Status> {
        if offset < 0 || size > MAX_FIELD_LEN {
            return Err(Status::InvalidArgument);
        }
        let file = fs::File::open(path).map_err(status_from)?;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file
                .read_at(&mut buf[filled..], offset as u64 + filled as u64)
                .map_err(status_from)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    pub fn write(path: &str, offset: i64, data: &[u8]) -> Result<u64, Status> {
        if offset < 0 {
            return Err(Status::InvalidArgument);
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .map_err(status_from)?;
        file.write_all_at(data, offset as u64).map_err(status_from)?;
        Ok(data.len() as u64)
    }

    pub fn utimens(path: &str, atime: Timespec, mtime: Timespec) -> Result<(), Status> {
        let path = cstring(path)?;
        let times = [
            libc::timespec {
                tv_sec: atime.secs as libc::time_t,
                tv_nsec: atime.nanos as libc::c_long,
            },
            libc::timespec {
                tv_sec: mtime.secs as libc::time_t,
                tv_nsec: mtime.nanos as libc::c_long,
            },
        ];
        let rc = unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), 0) };
        if rc < 0 {
            return Err(last_errno());
        }
        Ok(())
    }

    pub fn copy_file_range(
        in_path: &str,
        in_offset: i64,
        out_path: &str,
        out_offset: i64,
        size: u64,
    ) -> Result<u64, Status> {
        if in_offset < 0 || out_offset < 0 {
            return Err(Status::InvalidArgument);
        }
        let input = fs::File::open(in_path).map_err(status_from)?;
        let output = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(out_path)
            .map_err(status_from)?;

        let mut off_in = in_offset as libc::off64_t;
        let mut off_out = out_offset as libc::off64_t;
        let mut remaining = size as usize;
        let mut copied = 0u64;
        while remaining > 0 {
            let n = unsafe {
                libc::copy_file_range(
                    input.as_raw_fd(),
                    &mut off_in,
                    output.as_raw_fd(),
                    &mut off_out,
                    remaining,
                    0,
                )
            };
            if n < 0 {
                return Err(last_errno());
            }
            if n == 0 {
                // End of input; the partial copy is success.
                break;
            }
            copied += n as u64;
            remaining -= n as usize;
        }
        Ok(copied)
    }
}

impl Handler for LocalFs {
    async fn listdir(&self, path: &str) -> Result<Vec<Dirent>, Status> {
        let path = path.to_owned();
        run(move || sys::listdir(&path)).await
    }

    async fn stat(&self, path: &str) -> Result<Attrs, Status> {
        let path = path.to_owned();
        run(move || sys::stat(&path)).await
    }

    async fn readlink(&self, path: &str) -> Result<String, Status> {
        let path = path.to_owned();
        run(move || sys::readlink(&path)).await
    }

    async fn mknod(&self, path: &str) -> Result<(), Status> {
        let path = path.to_owned();
        run(move || sys::mknod(&path)).await
    }

    async fn mkdir(&self, path: &str) -> Result<(), Status> {
        let path = path.to_owned();
        run(move || fs::create_dir(&path).map_err(status_from)).await
    }

    async fn unlink(&self, path: &str) -> Result<(), Status> {
        let path = path.to_owned();
        run(move || fs::remove_file(&path).map_err(status_from)).await
    }

    async fn rmdir(&self, path: &str) -> Result<(), Status> {
        let path = path.to_owned();
        run(move || fs::remove_dir(&path).map_err(status_from)).await
    }

    async fn rename(&self, from: &str, to: &str, flags: u32) -> Result<(), Status> {
        let (from, to) = (from.to_owned(), to.to_owned());
        run(move || sys::rename(&from, &to, flags)).await
    }

    async fn truncate(&self, path: &str, size: i64) -> Result<(), Status> {
        let path = path.to_owned();
        run(move || sys::truncate(&path, size)).await
    }

    async fn read(&self, path: &str, offset: i64, size: u64) -> Result<Bytes, Status> {
        let path = path.to_owned();
        run(move || sys::read(&path, offset, size)).await
    }

    async fn write(&self, path: &str, offset: i64, data: &[u8]) -> Result<u64, Status> {
        let path = path.to_owned();
        let data = data.to_vec();
        run(move || sys::write(&path, offset, &data)).await
    }

    async fn utimens(&self, path: &str, atime: Timespec, mtime: Timespec) -> Result<(), Status> {
        let path = path.to_owned();
        run(move || sys::utimens(&path, atime, mtime)).await
    }

    async fn copy_file_range(
        &self,
        in_path: &str,
        in_offset: i64,
        out_path: &str,
        out_offset: i64,
        size: u64,
    ) -> Result<u64, Status> {
        let (in_path, out_path) = (in_path.to_owned(), out_path.to_owned());
        run(move || sys::copy_file_range(&in_path, in_offset, &out_path, out_offset, size)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_does_not_follow_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, b"data").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let attrs = sys::stat(link.to_str().unwrap()).unwrap();
        assert_eq!(attrs.mode & libc::S_IFMT, libc::S_IFLNK);
    }

    #[test]
    fn test_read_short_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"0123456789").unwrap();

        let data = sys::read(path.to_str().unwrap(), 6, 100).unwrap();
        assert_eq!(data, b"6789".as_ref());
    }

    #[test]
    fn test_copy_file_range_stops_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, b"abcdef").unwrap();

        let copied = sys::copy_file_range(
            src.to_str().unwrap(),
            2,
            dst.to_str().unwrap(),
            0,
            1024,
        )
        .unwrap();
        assert_eq!(copied, 4);
        assert_eq!(fs::read(&dst).unwrap(), b"cdef");
    }

    #[test]
    fn test_errno_mapping() {
        let missing = sys::stat("/definitely/not/here");
        assert_eq!(missing, Err(Status::NoSuchFileOrDirectory));

        let dir = tempfile::tempdir().unwrap();
        let not_empty = dir.path().join("d");
        fs::create_dir(&not_empty).unwrap();
        fs::write(not_empty.join("f"), b"x").unwrap();
        assert_eq!(
            fs::remove_dir(&not_empty).map_err(status_from),
            Err(Status::DirectoryNotEmpty)
        );
    }

    #[test]
    fn test_rename_bogus_flags() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        fs::write(&a, b"x").unwrap();
        // An undefined flag combination is rejected by the kernel.
        let result = sys::rename(
            a.to_str().unwrap(),
            dir.path().join("b").to_str().unwrap(),
            u32::MAX,
        );
        assert_eq!(result, Err(Status::InvalidArgument));
    }
}
