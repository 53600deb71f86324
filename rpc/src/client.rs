//! Client stub: one method per procedure.

use crate::Error;
use bytes::{Bytes, BytesMut};
use tetherfs_wire::{
    frame, message::Request, message::Response, Attrs, Dirent, Sink, Status, Stream, Timespec,
    MAX_FIELD_LEN,
};
use tracing::debug;

/// The filesystem-side endpoint of the protocol.
///
/// Every request is serialized into an internal scratch buffer and written
/// to the sink as a single send. Calls are strictly sequential: methods
/// take `&mut self`, and [Client::listdir] returns a receiver that borrows
/// the client until the entry stream has been consumed, so a second request
/// cannot be interleaved with an unfinished listing.
pub struct Client<Si: Sink, St: Stream> {
    sink: Si,
    stream: St,
    scratch: BytesMut,
}

impl<Si: Sink, St: Stream> Client<Si, St> {
    /// Consume the server greeting and return a ready client.
    ///
    /// A greeting other than the expected literal aborts the connection
    /// with [tetherfs_wire::Error::HandshakeMismatch].
    pub async fn handshake(sink: Si, mut stream: St) -> Result<Self, Error> {
        frame::expect_ready(&mut stream).await?;
        debug!("server ready");
        Ok(Self {
            sink,
            stream,
            scratch: BytesMut::new(),
        })
    }

    /// Send `request` and consume the response status byte.
    async fn call(&mut self, request: &Request) -> Result<(), Error> {
        self.scratch.clear();
        request.write(&mut self.scratch);
        self.sink.send(&self.scratch).await?;
        let status = frame::recv_u8(&mut self.stream).await?;
        Status::decode(status)?;
        Ok(())
    }

    /// Send `request` and decode the typed response payload.
    async fn call_decode(&mut self, request: &Request) -> Result<Response, Error> {
        self.call(request).await?;
        Ok(Response::read_from(&mut self.stream, request.procedure()).await?)
    }

    /// List a directory. The returned receiver must be driven to the end
    /// of the stream before the next request; abandoning it mid-stream
    /// desynchronizes the connection, which must then be closed.
    pub async fn listdir(&mut self, path: &str) -> Result<Dirents<'_, St>, Error> {
        self.call(&Request::Listdir { path: path.into() }).await?;
        Ok(Dirents {
            stream: &mut self.stream,
        })
    }

    pub async fn stat(&mut self, path: &str) -> Result<Attrs, Error> {
        match self.call_decode(&Request::Stat { path: path.into() }).await? {
            Response::Stat(attrs) => Ok(attrs),
            _ => unreachable!("decoded for the awaited procedure"),
        }
    }

    pub async fn readlink(&mut self, path: &str) -> Result<String, Error> {
        let request = Request::Readlink { path: path.into() };
        match self.call_decode(&request).await? {
            Response::Readlink { target } => Ok(target),
            _ => unreachable!("decoded for the awaited procedure"),
        }
    }

    pub async fn mknod(&mut self, path: &str) -> Result<(), Error> {
        self.call(&Request::Mknod { path: path.into() }).await
    }

    pub async fn mkdir(&mut self, path: &str) -> Result<(), Error> {
        self.call(&Request::Mkdir { path: path.into() }).await
    }

    pub async fn unlink(&mut self, path: &str) -> Result<(), Error> {
        self.call(&Request::Unlink { path: path.into() }).await
    }

    pub async fn rmdir(&mut self, path: &str) -> Result<(), Error> {
        self.call(&Request::Rmdir { path: path.into() }).await
    }

    pub async fn rename(&mut self, from: &str, to: &str, flags: u32) -> Result<(), Error> {
        self.call(&Request::Rename {
            from: from.into(),
            to: to.into(),
            flags,
        })
        .await
    }

    pub async fn truncate(&mut self, path: &str, size: i64) -> Result<(), Error> {
        self.call(&Request::Truncate {
            path: path.into(),
            size,
        })
        .await
    }

    /// Read up to `size` bytes at `offset`.
    ///
    /// The returned slice aliases the client's scratch buffer and is valid
    /// only until the next call on this client; it may be shorter than
    /// `size` at end of file.
    pub async fn read(&mut self, path: &str, offset: i64, size: u64) -> Result<&[u8], Error> {
        self.call(&Request::Read {
            path: path.into(),
            offset,
            size,
        })
        .await?;

        // Land the payload in the scratch buffer rather than a fresh
        // allocation; the caller copies out what it needs.
        let len = frame::recv_u64(&mut self.stream).await?;
        if len > MAX_FIELD_LEN {
            return Err(tetherfs_wire::Error::FieldTooLarge(len).into());
        }
        self.scratch.clear();
        self.scratch.resize(len as usize, 0);
        self.stream.recv(&mut self.scratch).await?;
        Ok(&self.scratch)
    }

    /// Write `data` at `offset`, returning the count the remote accepted.
    /// Callers must handle short writes.
    pub async fn write(&mut self, path: &str, offset: i64, data: &[u8]) -> Result<u64, Error> {
        let request = Request::Write {
            path: path.into(),
            offset,
            data: Bytes::copy_from_slice(data),
        };
        match self.call_decode(&request).await? {
            Response::Write { written } => Ok(written),
            _ => unreachable!("decoded for the awaited procedure"),
        }
    }

    pub async fn utimens(
        &mut self,
        path: &str,
        atime: Timespec,
        mtime: Timespec,
    ) -> Result<(), Error> {
        self.call(&Request::Utimens {
            path: path.into(),
            atime,
            mtime,
        })
        .await
    }

    /// Copy up to `size` bytes between remote files, returning the count
    /// actually copied. A partial copy is success.
    pub async fn copy_file_range(
        &mut self,
        in_path: &str,
        in_offset: i64,
        out_path: &str,
        out_offset: i64,
        size: u64,
    ) -> Result<u64, Error> {
        let request = Request::CopyFileRange {
            in_path: in_path.into(),
            in_offset,
            out_path: out_path.into(),
            out_offset,
            size,
        };
        match self.call_decode(&request).await? {
            Response::CopyFileRange { copied } => Ok(copied),
            _ => unreachable!("decoded for the awaited procedure"),
        }
    }
}

/// Receiver half of the `Listdir` streaming channel.
///
/// Borrows the client's stream; the client is unusable until this is
/// dropped, and the protocol requires draining to the end-of-stream
/// sentinel first.
pub struct Dirents<'a, St: Stream> {
    stream: &'a mut St,
}

impl<St: Stream> Dirents<'_, St> {
    /// Receive the next directory entry, or `None` at end of stream.
    pub async fn recv_next(&mut self) -> Result<Option<Dirent>, Error> {
        Ok(Dirent::read_from(self.stream).await?)
    }
}
