//! Server endpoint: accept loop and per-connection dispatcher.

use crate::{Error, Handler};
use bytes::{BufMut as _, BytesMut};
use futures::{channel::mpsc, StreamExt as _};
use std::net::{Ipv4Addr, SocketAddr};
use tetherfs_wire::{
    frame,
    message::{Procedure, Request, Response},
    transport::tcp,
    Dirent, Sink, Status, Stream,
};
use tokio::net::{TcpListener, TcpSocket};
use tracing::{debug, error, info, warn};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Port to listen on. Port zero binds an ephemeral port.
    pub port: u16,
}

/// Serve one connection: greet the client, then loop reading a procedure
/// tag, dispatching to the handler, and writing `(status, payload)`.
///
/// Returns `Ok(())` when the client closes the connection between requests
/// and an error on any transport or protocol fault, which is fatal for the
/// connection.
pub async fn serve<Si, St, H>(sink: &mut Si, stream: &mut St, handler: &H) -> Result<(), Error>
where
    Si: Sink,
    St: Stream,
    H: Handler,
{
    frame::send_ready(sink).await?;

    let mut scratch = BytesMut::new();
    loop {
        // Peek the procedure tag. A close here is an orderly shutdown; a
        // close anywhere inside a request body is a protocol fault.
        let tag = match frame::recv_u8(stream).await {
            Ok(tag) => tag,
            Err(tetherfs_wire::Error::Closed) => {
                debug!("client closed connection");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let procedure = Procedure::from_tag(tag)?;
        let request = Request::read_body(stream, procedure).await?;
        debug!(?procedure, "request");

        scratch.clear();
        match request {
            Request::Listdir { path } => match handler.listdir(&path).await {
                Ok(entries) => {
                    scratch.put_u8(0);
                    for entry in &entries {
                        entry.write(&mut scratch);
                    }
                    Dirent::write_end(&mut scratch);
                }
                Err(status) => scratch.put_u8(status.errno()),
            },
            request => match dispatch(handler, request).await {
                Ok(response) => {
                    scratch.put_u8(0);
                    response.write(&mut scratch);
                }
                Err(status) => {
                    debug!(%status, "procedure failed");
                    scratch.put_u8(status.errno());
                }
            },
        }
        sink.send(&scratch).await?;
    }
}

/// Route a decoded request (other than `Listdir`) to the handler method.
async fn dispatch<H: Handler>(handler: &H, request: Request) -> Result<Response, Status> {
    match request {
        Request::Listdir { .. } => unreachable!("listdir is streamed by the caller"),
        Request::Stat { path } => handler.stat(&path).await.map(Response::Stat),
        Request::Readlink { path } => handler
            .readlink(&path)
            .await
            .map(|target| Response::Readlink { target }),
        Request::Mknod { path } => handler.mknod(&path).await.map(|()| Response::Mknod),
        Request::Mkdir { path } => handler.mkdir(&path).await.map(|()| Response::Mkdir),
        Request::Unlink { path } => handler.unlink(&path).await.map(|()| Response::Unlink),
        Request::Rmdir { path } => handler.rmdir(&path).await.map(|()| Response::Rmdir),
        Request::Rename { from, to, flags } => handler
            .rename(&from, &to, flags)
            .await
            .map(|()| Response::Rename),
        Request::Truncate { path, size } => handler
            .truncate(&path, size)
            .await
            .map(|()| Response::Truncate),
        Request::Read { path, offset, size } => {
            handler.read(&path, offset, size).await.map(Response::Read)
        }
        Request::Write { path, offset, data } => handler
            .write(&path, offset, &data)
            .await
            .map(|written| Response::Write { written }),
        Request::Utimens { path, atime, mtime } => handler
            .utimens(&path, atime, mtime)
            .await
            .map(|()| Response::Utimens),
        Request::CopyFileRange {
            in_path,
            in_offset,
            out_path,
            out_offset,
            size,
        } => handler
            .copy_file_range(&in_path, in_offset, &out_path, out_offset, size)
            .await
            .map(|copied| Response::CopyFileRange { copied }),
    }
}

/// TCP server wrapping [serve] in an accept loop.
///
/// The listen backlog is a single connection: one client is served at a
/// time and later connections queue in the kernel until the current one
/// ends.
pub struct Server<H: Handler> {
    listener: TcpListener,
    handler: H,
    stop_tx: mpsc::Sender<()>,
    stop_rx: mpsc::Receiver<()>,
}

/// Clonable handle that interrupts [Server::run].
#[derive(Clone)]
pub struct StopHandle {
    tx: mpsc::Sender<()>,
}

impl StopHandle {
    /// Ask the server to exit. Idempotent; a stop delivered while a
    /// connection is being served drops that connection.
    pub fn stop(&mut self) {
        let _ = self.tx.try_send(());
    }
}

impl<H: Handler> Server<H> {
    /// Bind the listening socket.
    pub async fn bind(cfg: Config, handler: H) -> Result<Self, Error> {
        let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.port));
        let socket = TcpSocket::new_v4().map_err(|_| tetherfs_wire::Error::BindFailed)?;
        socket
            .set_reuseaddr(true)
            .map_err(|_| tetherfs_wire::Error::BindFailed)?;
        socket
            .bind(address)
            .map_err(|_| tetherfs_wire::Error::BindFailed)?;
        let listener = socket
            .listen(1)
            .map_err(|_| tetherfs_wire::Error::BindFailed)?;
        info!(port = cfg.port, "listening");

        let (stop_tx, stop_rx) = mpsc::channel(1);
        Ok(Self {
            listener,
            handler,
            stop_tx,
            stop_rx,
        })
    }

    /// The bound address (useful when binding port zero).
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener
            .local_addr()
            .map_err(|_| tetherfs_wire::Error::BindFailed.into())
    }

    /// A handle that can interrupt [Server::run] from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Accept and serve connections until stopped.
    pub async fn run(mut self) -> Result<(), Error> {
        loop {
            let accepted = tokio::select! {
                _ = self.stop_rx.next() => {
                    info!("server stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = ?e, "failed to accept connection");
                    continue;
                }
            };
            debug!(?peer, "accepted connection");

            let (mut sink, mut stream) = tcp::split(stream);
            tokio::select! {
                _ = self.stop_rx.next() => {
                    info!("server stopped");
                    return Ok(());
                }
                served = serve(&mut sink, &mut stream, &self.handler) => {
                    match served {
                        Ok(()) => debug!(?peer, "connection closed"),
                        Err(e) => warn!(?peer, error = %e, "connection failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Client;
    use bytes::Bytes;
    use futures::{executor::block_on, join};
    use std::{
        collections::HashMap,
        future::Future,
        sync::{Arc, Mutex},
    };
    use tetherfs_wire::{mocks, Attrs, Timespec};

    /// In-memory handler over a map of path to contents.
    #[derive(Clone, Default)]
    struct MemHandler {
        files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    }

    impl MemHandler {
        fn with_file(path: &str, contents: &[u8]) -> Self {
            let handler = Self::default();
            handler
                .files
                .lock()
                .unwrap()
                .insert(path.into(), contents.to_vec());
            handler
        }

        fn attrs_for(contents: &[u8]) -> Attrs {
            Attrs {
                size: contents.len() as i64,
                links: 1,
                mode: 0o100644,
                ..Default::default()
            }
        }
    }

    impl Handler for MemHandler {
        async fn listdir(&self, _path: &str) -> Result<Vec<Dirent>, Status> {
            let files = self.files.lock().unwrap();
            let mut entries: Vec<_> = files
                .iter()
                .map(|(name, contents)| Dirent {
                    name: name.clone(),
                    attrs: Self::attrs_for(contents),
                })
                .collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(entries)
        }

        async fn stat(&self, path: &str) -> Result<Attrs, Status> {
            let files = self.files.lock().unwrap();
            let contents = files.get(path).ok_or(Status::NoSuchFileOrDirectory)?;
            Ok(Self::attrs_for(contents))
        }

        async fn readlink(&self, _path: &str) -> Result<String, Status> {
            Err(Status::InvalidArgument)
        }

        async fn mknod(&self, path: &str) -> Result<(), Status> {
            let mut files = self.files.lock().unwrap();
            if files.contains_key(path) {
                return Err(Status::FileExists);
            }
            files.insert(path.into(), Vec::new());
            Ok(())
        }

        async fn mkdir(&self, _path: &str) -> Result<(), Status> {
            Err(Status::PermissionDenied)
        }

        async fn unlink(&self, path: &str) -> Result<(), Status> {
            self.files
                .lock()
                .unwrap()
                .remove(path)
                .map(|_| ())
                .ok_or(Status::NoSuchFileOrDirectory)
        }

        async fn rmdir(&self, _path: &str) -> Result<(), Status> {
            Err(Status::NotADirectory)
        }

        async fn rename(&self, from: &str, to: &str, flags: u32) -> Result<(), Status> {
            if flags != 0 {
                return Err(Status::InvalidArgument);
            }
            let mut files = self.files.lock().unwrap();
            let contents = files.remove(from).ok_or(Status::NoSuchFileOrDirectory)?;
            files.insert(to.into(), contents);
            Ok(())
        }

        async fn truncate(&self, path: &str, size: i64) -> Result<(), Status> {
            let mut files = self.files.lock().unwrap();
            let contents = files.get_mut(path).ok_or(Status::NoSuchFileOrDirectory)?;
            contents.resize(size as usize, 0);
            Ok(())
        }

        async fn read(&self, path: &str, offset: i64, size: u64) -> Result<Bytes, Status> {
            let files = self.files.lock().unwrap();
            let contents = files.get(path).ok_or(Status::NoSuchFileOrDirectory)?;
            let start = (offset as usize).min(contents.len());
            let end = (start + size as usize).min(contents.len());
            Ok(Bytes::copy_from_slice(&contents[start..end]))
        }

        async fn write(&self, path: &str, offset: i64, data: &[u8]) -> Result<u64, Status> {
            let mut files = self.files.lock().unwrap();
            let contents = files.entry(path.into()).or_default();
            let end = offset as usize + data.len();
            if contents.len() < end {
                contents.resize(end, 0);
            }
            contents[offset as usize..end].copy_from_slice(data);
            Ok(data.len() as u64)
        }

        async fn utimens(&self, _path: &str, _atime: Timespec, _mtime: Timespec) -> Result<(), Status> {
            Ok(())
        }

        async fn copy_file_range(
            &self,
            in_path: &str,
            in_offset: i64,
            out_path: &str,
            out_offset: i64,
            size: u64,
        ) -> Result<u64, Status> {
            let data = self.read(in_path, in_offset, size).await?;
            self.write(out_path, out_offset, &data).await?;
            Ok(data.len() as u64)
        }
    }

    /// Run a client script against [serve] over an in-memory channel.
    fn with_connection<F, Fut>(handler: MemHandler, script: F)
    where
        F: FnOnce(Client<mocks::Sink, mocks::Stream>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let (client_sink, server_stream) = mocks::Channel::init();
        let (mut server_sink, client_stream) = mocks::Channel::init();
        block_on(async move {
            let mut server_stream = server_stream;
            let server = serve(&mut server_sink, &mut server_stream, &handler);
            let driver = async move {
                let client = Client::handshake(client_sink, client_stream).await.unwrap();
                script(client).await;
                // Dropping the client closes the connection; serve exits
                // cleanly.
            };
            let (served, ()) = join!(server, driver);
            served.unwrap();
        });
    }

    #[test]
    fn test_stat_and_read() {
        let handler = MemHandler::with_file("/data/notes.txt", b"hello tetherfs");
        with_connection(handler, |mut client| async move {
            let attrs = client.stat("/data/notes.txt").await.unwrap();
            assert_eq!(attrs.size, 14);

            let data = client.read("/data/notes.txt", 6, 100).await.unwrap();
            // Short read at end of file is success.
            assert_eq!(data, b"tetherfs");
        });
    }

    #[test]
    fn test_remote_error_passthrough() {
        with_connection(MemHandler::default(), |mut client| async move {
            let result = client.stat("/missing").await;
            assert_eq!(result, Err(Error::Remote(Status::NoSuchFileOrDirectory)));

            // The connection survives a remote error.
            client.mknod("/created").await.unwrap();
            assert_eq!(client.stat("/created").await.unwrap().size, 0);
        });
    }

    #[test]
    fn test_listdir_stream() {
        let handler = MemHandler::default();
        for name in ["a.txt", "b.txt", "c.txt"] {
            handler.files.lock().unwrap().insert(name.into(), vec![1]);
        }
        with_connection(handler, |mut client| async move {
            let mut entries = client.listdir("/").await.unwrap();
            let mut names = Vec::new();
            while let Some(entry) = entries.recv_next().await.unwrap() {
                assert_eq!(entry.attrs.size, 1);
                names.push(entry.name);
            }
            assert_eq!(names, ["a.txt", "b.txt", "c.txt"]);
            // The fourth receive was the end-of-stream sentinel; once the
            // receiver is gone the client is usable again.
            drop(entries);
            client.mknod("/after").await.unwrap();
        });
    }

    #[test]
    fn test_write_then_read_back() {
        with_connection(MemHandler::default(), |mut client| async move {
            let written = client.write("/f", 3, b"abc").await.unwrap();
            assert_eq!(written, 3);
            let data = client.read("/f", 0, 6).await.unwrap();
            assert_eq!(data, b"\0\0\0abc");
        });
    }

    #[test]
    fn test_rename_flags_rejected() {
        let handler = MemHandler::with_file("/a", b"x");
        with_connection(handler, |mut client| async move {
            assert_eq!(
                client.rename("/a", "/b", 2).await,
                Err(Error::Remote(Status::InvalidArgument))
            );
            client.rename("/a", "/b", 0).await.unwrap();
            assert_eq!(
                client.stat("/a").await,
                Err(Error::Remote(Status::NoSuchFileOrDirectory))
            );
            client.stat("/b").await.unwrap();
        });
    }

    #[test]
    fn test_copy_file_range_partial() {
        let handler = MemHandler::with_file("/src", b"0123456789");
        with_connection(handler, |mut client| async move {
            // Ask for more than the source holds; the partial copy is
            // success.
            let copied = client.copy_file_range("/src", 4, "/dst", 0, 100).await.unwrap();
            assert_eq!(copied, 6);
            let data = client.read("/dst", 0, 100).await.unwrap();
            assert_eq!(data, b"456789");
        });
    }
}
