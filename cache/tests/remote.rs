//! The whole core wired together: cache on top of the RPC client, client
//! and server over an in-memory channel, everything driven cooperatively
//! on one thread.

use bytes::Bytes;
use futures::{executor::block_on, join, lock::Mutex as AsyncMutex};
use std::sync::{Arc, Mutex};
use tetherfs_cache::{Backing, Cache, Config, Error, FileId};
use tetherfs_rpc::{serve, Client, Handler};
use tetherfs_wire::{mocks, Attrs, Dirent, Status, Timespec};

/// Handler exposing a single in-memory file at `/file`.
#[derive(Clone, Default)]
struct OneFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl Handler for OneFile {
    async fn listdir(&self, _path: &str) -> Result<Vec<Dirent>, Status> {
        Err(Status::PermissionDenied)
    }

    async fn stat(&self, path: &str) -> Result<Attrs, Status> {
        if path != "/file" {
            return Err(Status::NoSuchFileOrDirectory);
        }
        Ok(Attrs {
            size: self.data.lock().unwrap().len() as i64,
            links: 1,
            mode: 0o100644,
            ..Default::default()
        })
    }

    async fn readlink(&self, _path: &str) -> Result<String, Status> {
        Err(Status::InvalidArgument)
    }

    async fn mknod(&self, _path: &str) -> Result<(), Status> {
        Err(Status::PermissionDenied)
    }

    async fn mkdir(&self, _path: &str) -> Result<(), Status> {
        Err(Status::PermissionDenied)
    }

    async fn unlink(&self, _path: &str) -> Result<(), Status> {
        Err(Status::PermissionDenied)
    }

    async fn rmdir(&self, _path: &str) -> Result<(), Status> {
        Err(Status::PermissionDenied)
    }

    async fn rename(&self, _from: &str, _to: &str, _flags: u32) -> Result<(), Status> {
        Err(Status::PermissionDenied)
    }

    async fn truncate(&self, _path: &str, _size: i64) -> Result<(), Status> {
        Err(Status::PermissionDenied)
    }

    async fn read(&self, path: &str, offset: i64, size: u64) -> Result<Bytes, Status> {
        if path != "/file" {
            return Err(Status::NoSuchFileOrDirectory);
        }
        let data = self.data.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let end = (start + size as usize).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn write(&self, path: &str, offset: i64, input: &[u8]) -> Result<u64, Status> {
        if path != "/file" {
            return Err(Status::NoSuchFileOrDirectory);
        }
        let mut data = self.data.lock().unwrap();
        let end = offset as usize + input.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(input);
        Ok(input.len() as u64)
    }

    async fn utimens(
        &self,
        _path: &str,
        _atime: Timespec,
        _mtime: Timespec,
    ) -> Result<(), Status> {
        Err(Status::PermissionDenied)
    }

    async fn copy_file_range(
        &self,
        _in_path: &str,
        _in_offset: i64,
        _out_path: &str,
        _out_offset: i64,
        _size: u64,
    ) -> Result<u64, Status> {
        Err(Status::PermissionDenied)
    }
}

/// [Backing] over the RPC client: fills are remote reads, flushes are
/// remote writes. The client serializes calls behind an async mutex, as
/// concurrent calls on one client are not permitted.
#[derive(Clone)]
struct RemoteBacking {
    client: Arc<AsyncMutex<Client<mocks::Sink, mocks::Stream>>>,
    path: String,
}

impl Backing for RemoteBacking {
    async fn fill(&self, _id: FileId, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let mut client = self.client.lock().await;
        let data = client
            .read(&self.path, offset as i64, buf.len() as u64)
            .await?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    async fn flush(&self, _id: FileId, buf: &[u8], offset: u64) -> Result<usize, Error> {
        let mut client = self.client.lock().await;
        Ok(client.write(&self.path, offset as i64, buf).await? as usize)
    }
}

#[test]
fn test_cache_over_rpc() {
    let handler = OneFile::default();
    handler.data.lock().unwrap().extend_from_slice(&[0xAB; 300]);

    let (client_sink, mut server_stream) = mocks::Channel::init();
    let (mut server_sink, client_stream) = mocks::Channel::init();

    block_on(async move {
        let server = serve(&mut server_sink, &mut server_stream, &handler);

        let device = handler.clone();
        let driver = async move {
            let client = Client::handshake(client_sink, client_stream).await.unwrap();
            let client = Arc::new(AsyncMutex::new(client));
            let backing = RemoteBacking {
                client: client.clone(),
                path: "/file".into(),
            };

            let mut registry = prometheus_client::registry::Registry::default();
            let cache = Cache::new(
                Config {
                    page_size: 64,
                    max_pages: 2,
                },
                &mut registry,
            );
            let id = FileId(1);

            // Reads are served through remote fills.
            let mut out = [0u8; 100];
            let n = cache.read(&backing, id, &mut out, 0).await.unwrap();
            assert_eq!(n, 100);
            assert!(out.iter().all(|b| *b == 0xAB));

            // Writes go back on flush.
            cache.write(id, b"edited", 10).await.unwrap();
            cache.flush(&backing, id, 300).await.unwrap();
            assert_eq!(&device.data.lock().unwrap()[10..16], b"edited");

            // Evictions under pressure park dirty pages as orphans; the
            // adapter drains them through the same backing.
            cache.write(id, b"one", 0).await.unwrap();
            cache.write(id, b"two", 64).await.unwrap();
            cache.write(id, b"three", 128).await.unwrap();
            for page in cache.take_orphans() {
                backing
                    .flush(id, page.contents(), page.offset())
                    .await
                    .unwrap();
            }
            cache.flush(&backing, id, 300).await.unwrap();
            {
                let data = device.data.lock().unwrap();
                assert_eq!(&data[0..3], b"one");
                assert_eq!(&data[64..67], b"two");
                assert_eq!(&data[128..133], b"three");
            }

            // A remote error travels through fill back to the reader
            // unchanged.
            let missing = RemoteBacking {
                client: client.clone(),
                path: "/missing".into(),
            };
            let n = cache
                .read(&missing, FileId(2), &mut out, 0)
                .await;
            assert_eq!(n, Err(Error::Remote(Status::NoSuchFileOrDirectory)));

            // Dropping the client ends the connection and the server loop.
            drop(backing);
            drop(missing);
            drop(cache);
            drop(client);
        };

        let (served, ()) = join!(server, driver);
        served.unwrap();
    });
}
