//! A mock implementation of a channel that implements the [Sink](crate::Sink)
//! and [Stream](crate::Stream) traits, used to exercise the protocol without
//! a socket.

use crate::Error;
use bytes::{Buf as _, BytesMut};
use futures::channel::oneshot;
use std::sync::{Arc, Mutex};

/// Shared state between the sink and stream halves.
pub struct Channel {
    /// Bytes sent by the sink that are not yet read by the stream.
    buffer: BytesMut,

    /// If the stream is waiting for bytes, the number it is waiting for and
    /// the sender used to wake it once enough have arrived.
    waiter: Option<(usize, oneshot::Sender<()>)>,

    /// Whether the sink half is still alive.
    sink_alive: bool,

    /// Whether the stream half is still alive.
    stream_alive: bool,
}

impl Channel {
    /// Returns a connected Sink/Stream pair.
    pub fn init() -> (Sink, Stream) {
        let channel = Arc::new(Mutex::new(Self {
            buffer: BytesMut::new(),
            waiter: None,
            sink_alive: true,
            stream_alive: true,
        }));
        (
            Sink {
                channel: channel.clone(),
            },
            Stream { channel },
        )
    }
}

/// A mock sink that implements the [crate::Sink] trait.
pub struct Sink {
    channel: Arc<Mutex<Channel>>,
}

impl crate::Sink for Sink {
    async fn send(&mut self, buf: &[u8]) -> Result<(), Error> {
        let waiter = {
            let mut channel = self.channel.lock().unwrap();

            // If the receiver is dead, we cannot send any more messages.
            if !channel.stream_alive {
                return Err(Error::Closed);
            }

            channel.buffer.extend_from_slice(buf);

            // Wake the stream if it now has enough data.
            match &channel.waiter {
                Some((requested, _)) if *requested <= channel.buffer.len() => {
                    channel.waiter.take()
                }
                _ => None,
            }
        };
        if let Some((_, tx)) = waiter {
            // The stream may have been cancelled between registering the
            // waiter and now; that is not the sink's problem.
            let _ = tx.send(());
        }
        Ok(())
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        let mut channel = self.channel.lock().unwrap();
        channel.sink_alive = false;

        // Dropping the sender wakes a waiting stream with an error.
        channel.waiter.take();
    }
}

/// A mock stream that implements the [crate::Stream] trait.
pub struct Stream {
    channel: Arc<Mutex<Channel>>,
}

impl crate::Stream for Stream {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        loop {
            let rx = {
                let mut channel = self.channel.lock().unwrap();
                if channel.buffer.len() >= buf.len() {
                    channel.buffer.copy_to_slice(buf);
                    return Ok(());
                }
                if !channel.sink_alive {
                    return Err(Error::Closed);
                }
                let (tx, rx) = oneshot::channel();
                channel.waiter = Some((buf.len(), tx));
                rx
            };
            rx.await.map_err(|_| Error::Closed)?;
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let mut channel = self.channel.lock().unwrap();
        channel.stream_alive = false;
    }
}
