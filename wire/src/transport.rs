//! Transport seam between the endpoints and the byte stream that carries
//! them.
//!
//! The codec and the RPC endpoints are generic over a [Sink]/[Stream] pair
//! rather than a concrete socket so that tests can run the full protocol
//! over [crate::mocks::Channel]. The [tcp] module provides the production
//! implementation.

use crate::Error;
use std::future::Future;

/// Write half of a connection.
pub trait Sink: Send {
    /// Send the entire buffer, in order, before any subsequent send.
    fn send(&mut self, buf: &[u8]) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Read half of a connection.
pub trait Stream: Send {
    /// Fill `buf` exactly.
    ///
    /// Returns [Error::Closed] if the peer closes the connection before
    /// `buf` is full.
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<(), Error>> + Send;
}

/// TCP-backed transport.
pub mod tcp {
    use crate::Error;
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _},
        net::tcp::{OwnedReadHalf, OwnedWriteHalf},
        time::timeout,
    };

    /// Socket timeout applied to every read and write.
    ///
    /// Timeouts live here, in the transport, and nowhere above it.
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Size of the read-side buffer used to batch small field reads into
    /// fewer syscalls.
    const READ_BUFFER_SIZE: usize = 8 * 1024;

    /// Split a connected TCP stream into a transport pair with the default
    /// timeouts.
    pub fn split(stream: tokio::net::TcpStream) -> (Sink, Stream) {
        split_with_timeout(stream, DEFAULT_TIMEOUT)
    }

    /// Split a connected TCP stream into a transport pair, applying
    /// `io_timeout` to every read and write.
    pub fn split_with_timeout(stream: tokio::net::TcpStream, io_timeout: Duration) -> (Sink, Stream) {
        // Requests are small and latency-bound.
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        (
            Sink {
                write_timeout: io_timeout,
                sink: write,
            },
            Stream {
                read_timeout: io_timeout,
                stream: read,
                buffer: vec![0; READ_BUFFER_SIZE],
                start: 0,
                end: 0,
            },
        )
    }

    /// Implementation of [crate::Sink] for TCP.
    pub struct Sink {
        write_timeout: Duration,
        sink: OwnedWriteHalf,
    }

    impl crate::Sink for Sink {
        async fn send(&mut self, buf: &[u8]) -> Result<(), Error> {
            timeout(self.write_timeout, self.sink.write_all(buf))
                .await
                .map_err(|_| Error::Timeout)?
                .map_err(|_| Error::WriteFailed)?;
            Ok(())
        }
    }

    /// Implementation of [crate::Stream] for TCP.
    ///
    /// Reads are batched through an internal buffer so that the many small
    /// field reads of the codec do not each hit the socket.
    pub struct Stream {
        read_timeout: Duration,
        stream: OwnedReadHalf,
        buffer: Vec<u8>,
        /// Start of valid data in `buffer`.
        start: usize,
        /// End of valid data in `buffer` (exclusive).
        end: usize,
    }

    impl Stream {
        /// Copy buffered bytes into `out`, returning how many were copied.
        fn drain_buffered(&mut self, out: &mut [u8]) -> usize {
            let n = out.len().min(self.end - self.start);
            out[..n].copy_from_slice(&self.buffer[self.start..self.start + n]);
            self.start += n;
            n
        }
    }

    impl crate::Stream for Stream {
        async fn recv(&mut self, buf: &mut [u8]) -> Result<(), Error> {
            let mut filled = self.drain_buffered(buf);
            while filled < buf.len() {
                // Large remainders bypass the buffer to avoid double copies.
                if buf.len() - filled >= self.buffer.len() {
                    let n = timeout(self.read_timeout, self.stream.read(&mut buf[filled..]))
                        .await
                        .map_err(|_| Error::Timeout)?
                        .map_err(|_| Error::ReadFailed)?;
                    if n == 0 {
                        return Err(Error::Closed);
                    }
                    filled += n;
                    continue;
                }

                // Refill the internal buffer, then drain again.
                self.start = 0;
                self.end = 0;
                let n = timeout(self.read_timeout, self.stream.read(&mut self.buffer))
                    .await
                    .map_err(|_| Error::Timeout)?
                    .map_err(|_| Error::ReadFailed)?;
                if n == 0 {
                    return Err(Error::Closed);
                }
                self.end = n;
                filled += self.drain_buffered(&mut buf[filled..]);
            }
            Ok(())
        }
    }
}
