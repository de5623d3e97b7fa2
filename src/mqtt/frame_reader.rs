//! Reassembles complete MQTT frames from a byte stream.
//!
//! The transport may deliver arbitrarily fragmented reads; bytes are
//! accumulated in an internal buffer until the fixed header and exactly
//! `remaining_length` body bytes have arrived, so a frame is yielded the
//! same way whether the bytes came in one chunk or one at a time. The
//! buffer lives on the reader, which makes `next_frame` safe to drop
//! mid-read (as `tokio::select!` does when another branch wins): progress
//! is kept, nothing on the stream is lost.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use super::codec::{self, CodecError};

/// Frame types the state machine reacts to. Everything else (SUBACK,
/// PINGRESP, ...) is carried as `Other` and ignored by the caller rather
/// than rejected, since the broker is free to send frames this client
/// never acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    ConnAck,
    Publish,
    Other(u8),
}

/// A complete frame: its classified type plus the raw packet bytes
/// (fixed header included) for the codec to pick apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub bytes: Vec<u8>,
}

/// Errors ending the frame stream.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream.
    #[error("connection closed by peer")]
    Closed,

    /// Transport-level read failure.
    #[error("transport error: {0}")]
    Io(std::io::Error),

    /// The stream cannot be re-synchronized, e.g. a multi-byte remaining
    /// length this client does not support.
    #[error("unrecoverable framing error: {0}")]
    Protocol(#[from] CodecError),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Closed
        } else {
            FrameError::Io(err)
        }
    }
}

/// Yields complete MQTT frames from an underlying reader. One instance
/// lives per connection attempt and is dropped with the transport.
pub struct FrameReader<R> {
    reader: R,
    /// Bytes received but not yet consumed as a complete frame.
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(256),
        }
    }

    /// Waits for the next complete frame. Cancellation-safe: dropping the
    /// returned future keeps any partially received bytes buffered.
    pub async fn next_frame(&mut self) -> Result<Frame, FrameError> {
        while self.buf.len() < 2 {
            self.fill().await?;
        }
        let fixed = codec::decode_fixed_header(&self.buf[..2])?;

        let total = fixed.header_len + fixed.remaining_length;
        while self.buf.len() < total {
            self.fill().await?;
        }
        // Anything beyond `total` belongs to the next frame and stays.
        let bytes: Vec<u8> = self.buf.drain(..total).collect();

        let kind = match fixed.message_type() {
            t if t == codec::CONNACK >> 4 => FrameKind::ConnAck,
            t if t == codec::PUBLISH >> 4 => FrameKind::Publish,
            t => FrameKind::Other(t),
        };
        trace!("frame received: {:?} ({} bytes)", kind, bytes.len());

        Ok(Frame { kind, bytes })
    }

    /// Appends whatever the transport has available. A zero-length read
    /// means the peer closed the stream; readiness-based reads otherwise
    /// suspend instead of spinning.
    async fn fill(&mut self) -> Result<(), FrameError> {
        let n = self.reader.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(FrameError::Closed);
        }
        Ok(())
    }
}
