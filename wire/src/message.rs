//! Request/response families for the thirteen procedures.
//!
//! Both families are closed tagged sums. Requests carry their procedure tag
//! on the wire; responses do not, so decoding a response is parameterized
//! by the procedure the caller is awaiting.

use crate::{frame, transport::Stream, Error, MAX_FIELD_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error as ThisError;

/// The procedure set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Procedure {
    Listdir = 1,
    Stat = 2,
    Readlink = 3,
    Mknod = 4,
    Mkdir = 5,
    Unlink = 6,
    Rmdir = 7,
    Rename = 8,
    Truncate = 9,
    Read = 10,
    Write = 11,
    Utimens = 12,
    CopyFileRange = 13,
}

impl Procedure {
    /// Decode a procedure tag.
    pub fn from_tag(tag: u8) -> Result<Self, Error> {
        match tag {
            1 => Ok(Self::Listdir),
            2 => Ok(Self::Stat),
            3 => Ok(Self::Readlink),
            4 => Ok(Self::Mknod),
            5 => Ok(Self::Mkdir),
            6 => Ok(Self::Unlink),
            7 => Ok(Self::Rmdir),
            8 => Ok(Self::Rename),
            9 => Ok(Self::Truncate),
            10 => Ok(Self::Read),
            11 => Ok(Self::Write),
            12 => Ok(Self::Utimens),
            13 => Ok(Self::CopyFileRange),
            tag => Err(Error::UnknownProcedure(tag)),
        }
    }
}

/// Remote operation errors, carried on the wire as a POSIX errno byte.
///
/// Procedure errors never overlap with transport errors: a nonzero status
/// byte is always one of these values, and any value outside the table is
/// mapped to [Status::InvalidArgument] by the receiver.
#[derive(ThisError, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    #[error("no such file or directory")]
    NoSuchFileOrDirectory = 2,
    #[error("permission denied")]
    PermissionDenied = 13,
    #[error("file exists")]
    FileExists = 17,
    #[error("not a directory")]
    NotADirectory = 20,
    #[error("is a directory")]
    IsADirectory = 21,
    #[error("invalid argument")]
    InvalidArgument = 22,
    #[error("directory not empty")]
    DirectoryNotEmpty = 39,
}

impl Status {
    /// Map an errno to a status, folding everything outside the table into
    /// the generic [Status::InvalidArgument].
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            2 => Self::NoSuchFileOrDirectory,
            13 => Self::PermissionDenied,
            17 => Self::FileExists,
            20 => Self::NotADirectory,
            21 => Self::IsADirectory,
            39 => Self::DirectoryNotEmpty,
            _ => Self::InvalidArgument,
        }
    }

    /// The errno carried on the wire.
    pub fn errno(&self) -> u8 {
        *self as u8
    }

    /// Decode a response status byte: zero is success, everything else is
    /// a remote error.
    pub fn decode(byte: u8) -> Result<(), Self> {
        match byte {
            0 => Ok(()),
            byte => Err(Self::from_errno(byte as i32)),
        }
    }
}

/// Seconds and nanoseconds, encoded as two signed 64-bit integers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timespec {
    pub secs: i64,
    pub nanos: i64,
}

impl Timespec {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.secs);
        buf.put_i64_le(self.nanos);
    }

    async fn read_from<St: Stream>(stream: &mut St) -> Result<Self, Error> {
        Ok(Self {
            secs: frame::recv_i64(stream).await?,
            nanos: frame::recv_i64(stream).await?,
        })
    }
}

/// File attributes, the payload of `Stat` responses and directory entries.
///
/// Captured with `lstat` semantics on the remote: symlinks are not
/// traversed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Attrs {
    pub size: i64,
    pub links: u64,
    pub mtime: Timespec,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Attrs {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.size);
        buf.put_u64_le(self.links);
        self.mtime.write(buf);
        self.atime.write(buf);
        self.ctime.write(buf);
        buf.put_u32_le(self.mode);
        buf.put_u32_le(self.uid);
        buf.put_u32_le(self.gid);
    }

    pub async fn read_from<St: Stream>(stream: &mut St) -> Result<Self, Error> {
        Ok(Self {
            size: frame::recv_i64(stream).await?,
            links: frame::recv_u64(stream).await?,
            mtime: Timespec::read_from(stream).await?,
            atime: Timespec::read_from(stream).await?,
            ctime: Timespec::read_from(stream).await?,
            mode: frame::recv_u32(stream).await?,
            uid: frame::recv_u32(stream).await?,
            gid: frame::recv_u32(stream).await?,
        })
    }
}

/// One entry of the `Listdir` streaming channel.
///
/// Entries are framed as `(name_length: u64, name_bytes, Attrs)`; the end
/// of the stream is a sentinel entry with `name_length = 0`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dirent {
    pub name: String,
    pub attrs: Attrs,
}

impl Dirent {
    pub fn write(&self, buf: &mut BytesMut) {
        frame::put_bytes(buf, self.name.as_bytes());
        self.attrs.write(buf);
    }

    /// Append the end-of-stream sentinel.
    pub fn write_end(buf: &mut BytesMut) {
        buf.put_u64_le(0);
    }

    /// Receive the next entry, or `None` at the end of the stream.
    pub async fn read_from<St: Stream>(stream: &mut St) -> Result<Option<Self>, Error> {
        let len = frame::recv_u64(stream).await?;
        if len == 0 {
            return Ok(None);
        }
        if len > MAX_FIELD_LEN {
            return Err(Error::FieldTooLarge(len));
        }
        let mut name = vec![0u8; len as usize];
        stream.recv(&mut name).await?;
        let name = String::from_utf8(name).map_err(|_| Error::InvalidUtf8)?;
        let attrs = Attrs::read_from(stream).await?;
        Ok(Some(Self { name, attrs }))
    }
}

/// A request: one variant per procedure, fields in wire order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Listdir {
        path: String,
    },
    Stat {
        path: String,
    },
    Readlink {
        path: String,
    },
    Mknod {
        path: String,
    },
    Mkdir {
        path: String,
    },
    Unlink {
        path: String,
    },
    Rmdir {
        path: String,
    },
    Rename {
        from: String,
        to: String,
        flags: u32,
    },
    Truncate {
        path: String,
        size: i64,
    },
    Read {
        path: String,
        offset: i64,
        size: u64,
    },
    Write {
        path: String,
        offset: i64,
        data: Bytes,
    },
    Utimens {
        path: String,
        atime: Timespec,
        mtime: Timespec,
    },
    CopyFileRange {
        in_path: String,
        in_offset: i64,
        out_path: String,
        out_offset: i64,
        size: u64,
    },
}

impl Request {
    pub fn procedure(&self) -> Procedure {
        match self {
            Self::Listdir { .. } => Procedure::Listdir,
            Self::Stat { .. } => Procedure::Stat,
            Self::Readlink { .. } => Procedure::Readlink,
            Self::Mknod { .. } => Procedure::Mknod,
            Self::Mkdir { .. } => Procedure::Mkdir,
            Self::Unlink { .. } => Procedure::Unlink,
            Self::Rmdir { .. } => Procedure::Rmdir,
            Self::Rename { .. } => Procedure::Rename,
            Self::Truncate { .. } => Procedure::Truncate,
            Self::Read { .. } => Procedure::Read,
            Self::Write { .. } => Procedure::Write,
            Self::Utimens { .. } => Procedure::Utimens,
            Self::CopyFileRange { .. } => Procedure::CopyFileRange,
        }
    }

    /// Encode the tag and payload.
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.procedure() as u8);
        match self {
            Self::Listdir { path }
            | Self::Stat { path }
            | Self::Readlink { path }
            | Self::Mknod { path }
            | Self::Mkdir { path }
            | Self::Unlink { path }
            | Self::Rmdir { path } => {
                frame::put_bytes(buf, path.as_bytes());
            }
            Self::Rename { from, to, flags } => {
                frame::put_bytes(buf, from.as_bytes());
                frame::put_bytes(buf, to.as_bytes());
                buf.put_u32_le(*flags);
            }
            Self::Truncate { path, size } => {
                frame::put_bytes(buf, path.as_bytes());
                buf.put_i64_le(*size);
            }
            Self::Read { path, offset, size } => {
                frame::put_bytes(buf, path.as_bytes());
                buf.put_i64_le(*offset);
                buf.put_u64_le(*size);
            }
            Self::Write { path, offset, data } => {
                frame::put_bytes(buf, path.as_bytes());
                buf.put_i64_le(*offset);
                frame::put_bytes(buf, data);
            }
            Self::Utimens { path, atime, mtime } => {
                frame::put_bytes(buf, path.as_bytes());
                atime.write(buf);
                mtime.write(buf);
            }
            Self::CopyFileRange {
                in_path,
                in_offset,
                out_path,
                out_offset,
                size,
            } => {
                frame::put_bytes(buf, in_path.as_bytes());
                buf.put_i64_le(*in_offset);
                frame::put_bytes(buf, out_path.as_bytes());
                buf.put_i64_le(*out_offset);
                buf.put_u64_le(*size);
            }
        }
    }

    /// Receive a full request: tag, then payload.
    pub async fn read_from<St: Stream>(stream: &mut St) -> Result<Self, Error> {
        let procedure = Procedure::from_tag(frame::recv_u8(stream).await?)?;
        Self::read_body(stream, procedure).await
    }

    /// Receive the payload of an already-identified procedure.
    pub async fn read_body<St: Stream>(
        stream: &mut St,
        procedure: Procedure,
    ) -> Result<Self, Error> {
        match procedure {
            Procedure::Listdir => Ok(Self::Listdir {
                path: frame::recv_string(stream).await?,
            }),
            Procedure::Stat => Ok(Self::Stat {
                path: frame::recv_string(stream).await?,
            }),
            Procedure::Readlink => Ok(Self::Readlink {
                path: frame::recv_string(stream).await?,
            }),
            Procedure::Mknod => Ok(Self::Mknod {
                path: frame::recv_string(stream).await?,
            }),
            Procedure::Mkdir => Ok(Self::Mkdir {
                path: frame::recv_string(stream).await?,
            }),
            Procedure::Unlink => Ok(Self::Unlink {
                path: frame::recv_string(stream).await?,
            }),
            Procedure::Rmdir => Ok(Self::Rmdir {
                path: frame::recv_string(stream).await?,
            }),
            Procedure::Rename => Ok(Self::Rename {
                from: frame::recv_string(stream).await?,
                to: frame::recv_string(stream).await?,
                flags: frame::recv_u32(stream).await?,
            }),
            Procedure::Truncate => Ok(Self::Truncate {
                path: frame::recv_string(stream).await?,
                size: frame::recv_i64(stream).await?,
            }),
            Procedure::Read => Ok(Self::Read {
                path: frame::recv_string(stream).await?,
                offset: frame::recv_i64(stream).await?,
                size: frame::recv_u64(stream).await?,
            }),
            Procedure::Write => Ok(Self::Write {
                path: frame::recv_string(stream).await?,
                offset: frame::recv_i64(stream).await?,
                data: Bytes::from(frame::recv_bytes(stream).await?),
            }),
            Procedure::Utimens => Ok(Self::Utimens {
                path: frame::recv_string(stream).await?,
                atime: Timespec::read_from(stream).await?,
                mtime: Timespec::read_from(stream).await?,
            }),
            Procedure::CopyFileRange => Ok(Self::CopyFileRange {
                in_path: frame::recv_string(stream).await?,
                in_offset: frame::recv_i64(stream).await?,
                out_path: frame::recv_string(stream).await?,
                out_offset: frame::recv_i64(stream).await?,
                size: frame::recv_u64(stream).await?,
            }),
        }
    }
}

/// A successful response payload.
///
/// The status byte is not part of the payload; the server writes it before
/// the payload and the client consumes it before decoding. `Listdir`'s
/// payload is empty on the request/response channel, the entries follow on
/// the streaming channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Listdir,
    Stat(Attrs),
    Readlink { target: String },
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Rename,
    Truncate,
    Read(Bytes),
    Write { written: u64 },
    Utimens,
    CopyFileRange { copied: u64 },
}

impl Response {
    pub fn procedure(&self) -> Procedure {
        match self {
            Self::Listdir => Procedure::Listdir,
            Self::Stat(_) => Procedure::Stat,
            Self::Readlink { .. } => Procedure::Readlink,
            Self::Mknod => Procedure::Mknod,
            Self::Mkdir => Procedure::Mkdir,
            Self::Unlink => Procedure::Unlink,
            Self::Rmdir => Procedure::Rmdir,
            Self::Rename => Procedure::Rename,
            Self::Truncate => Procedure::Truncate,
            Self::Read(_) => Procedure::Read,
            Self::Write { .. } => Procedure::Write,
            Self::Utimens => Procedure::Utimens,
            Self::CopyFileRange { .. } => Procedure::CopyFileRange,
        }
    }

    /// Encode the payload (the status byte is written by the caller).
    pub fn write(&self, buf: &mut BytesMut) {
        match self {
            Self::Listdir
            | Self::Mknod
            | Self::Mkdir
            | Self::Unlink
            | Self::Rmdir
            | Self::Rename
            | Self::Truncate
            | Self::Utimens => {}
            Self::Stat(attrs) => attrs.write(buf),
            Self::Readlink { target } => frame::put_bytes(buf, target.as_bytes()),
            Self::Read(data) => frame::put_bytes(buf, data),
            Self::Write { written } => buf.put_u64_le(*written),
            Self::CopyFileRange { copied } => buf.put_u64_le(*copied),
        }
    }

    /// Receive the payload of a successful response to `procedure`.
    pub async fn read_from<St: Stream>(
        stream: &mut St,
        procedure: Procedure,
    ) -> Result<Self, Error> {
        match procedure {
            Procedure::Listdir => Ok(Self::Listdir),
            Procedure::Stat => Ok(Self::Stat(Attrs::read_from(stream).await?)),
            Procedure::Readlink => Ok(Self::Readlink {
                target: frame::recv_string(stream).await?,
            }),
            Procedure::Mknod => Ok(Self::Mknod),
            Procedure::Mkdir => Ok(Self::Mkdir),
            Procedure::Unlink => Ok(Self::Unlink),
            Procedure::Rmdir => Ok(Self::Rmdir),
            Procedure::Rename => Ok(Self::Rename),
            Procedure::Truncate => Ok(Self::Truncate),
            Procedure::Read => Ok(Self::Read(Bytes::from(frame::recv_bytes(stream).await?))),
            Procedure::Write => Ok(Self::Write {
                written: frame::recv_u64(stream).await?,
            }),
            Procedure::Utimens => Ok(Self::Utimens),
            Procedure::CopyFileRange => Ok(Self::CopyFileRange {
                copied: frame::recv_u64(stream).await?,
            }),
        }
    }
}
