//! Little-endian field primitives shared by the client and server
//! endpoints.
//!
//! Fixed-width integers travel little-endian. Variable-length fields are a
//! `u64` little-endian length followed by that many raw bytes; a length
//! above [MAX_FIELD_LEN] is rejected before any allocation.

use crate::{transport::{Sink, Stream}, Error, MAX_FIELD_LEN, READY};
use bytes::{BufMut, BytesMut};

/// Write the server greeting.
pub async fn send_ready<Si: Sink>(sink: &mut Si) -> Result<(), Error> {
    sink.send(READY).await
}

/// Read and verify the server greeting.
pub async fn expect_ready<St: Stream>(stream: &mut St) -> Result<(), Error> {
    let mut buf = [0u8; READY.len()];
    stream.recv(&mut buf).await?;
    if &buf != READY {
        return Err(Error::HandshakeMismatch);
    }
    Ok(())
}

pub async fn recv_u8<St: Stream>(stream: &mut St) -> Result<u8, Error> {
    let mut buf = [0u8; 1];
    stream.recv(&mut buf).await?;
    Ok(buf[0])
}

pub async fn recv_u32<St: Stream>(stream: &mut St) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    stream.recv(&mut buf).await?;
    Ok(u32::from_le_bytes(buf))
}

pub async fn recv_u64<St: Stream>(stream: &mut St) -> Result<u64, Error> {
    let mut buf = [0u8; 8];
    stream.recv(&mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

pub async fn recv_i64<St: Stream>(stream: &mut St) -> Result<i64, Error> {
    let mut buf = [0u8; 8];
    stream.recv(&mut buf).await?;
    Ok(i64::from_le_bytes(buf))
}

/// Receive a length-prefixed byte field.
pub async fn recv_bytes<St: Stream>(stream: &mut St) -> Result<Vec<u8>, Error> {
    let len = recv_u64(stream).await?;
    if len > MAX_FIELD_LEN {
        return Err(Error::FieldTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    stream.recv(&mut buf).await?;
    Ok(buf)
}

/// Receive a length-prefixed UTF-8 string (paths, link targets).
pub async fn recv_string<St: Stream>(stream: &mut St) -> Result<String, Error> {
    String::from_utf8(recv_bytes(stream).await?).map_err(|_| Error::InvalidUtf8)
}

/// Append a length-prefixed byte field.
pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u64_le(bytes.len() as u64);
    buf.put_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks;
    use futures::{executor::block_on, join};

    #[test]
    fn test_handshake() {
        let (mut sink, mut stream) = mocks::Channel::init();
        block_on(async move {
            let (sent, got) = join!(send_ready(&mut sink), expect_ready(&mut stream));
            sent.unwrap();
            got.unwrap();
        });
    }

    #[test]
    fn test_handshake_mismatch() {
        let (mut sink, mut stream) = mocks::Channel::init();
        block_on(async move {
            crate::Sink::send(&mut sink, b"SERVER_IS_BROKEN").await.unwrap();
            assert!(matches!(
                expect_ready(&mut stream).await,
                Err(Error::HandshakeMismatch)
            ));
        });
    }

    #[test]
    fn test_bytes_round_trip() {
        let (mut sink, mut stream) = mocks::Channel::init();
        block_on(async move {
            let mut buf = BytesMut::new();
            put_bytes(&mut buf, b"some payload");
            crate::Sink::send(&mut sink, &buf).await.unwrap();
            assert_eq!(recv_bytes(&mut stream).await.unwrap(), b"some payload");
        });
    }

    #[test]
    fn test_bytes_over_limit() {
        let (mut sink, mut stream) = mocks::Channel::init();
        block_on(async move {
            let mut buf = BytesMut::new();
            buf.put_u64_le(MAX_FIELD_LEN + 1);
            crate::Sink::send(&mut sink, &buf).await.unwrap();
            assert!(matches!(
                recv_bytes(&mut stream).await,
                Err(Error::FieldTooLarge(n)) if n == MAX_FIELD_LEN + 1
            ));
        });
    }

    #[test]
    fn test_truncated_field() {
        let (mut sink, mut stream) = mocks::Channel::init();
        block_on(async move {
            let mut buf = BytesMut::new();
            buf.put_u64_le(16);
            buf.put_slice(b"short");
            crate::Sink::send(&mut sink, &buf).await.unwrap();
            drop(sink);
            assert!(matches!(recv_bytes(&mut stream).await, Err(Error::Closed)));
        });
    }
}
