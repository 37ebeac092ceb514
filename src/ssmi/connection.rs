// ABOUTME: Buffered frame I/O for SSMI sessions, split into independently owned read and write halves
// ABOUTME: The reader accumulates bytes until a full line parses; the writer buffers and flushes per frame

use super::frame::{self, Frame};
use bytes::{Buf, BytesMut};
use std::io::{self, Cursor};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

/// Read half of an SSMI connection.
///
/// The session's reader task owns this exclusively, so reads never contend
/// with sends.
#[derive(Debug)]
pub struct FrameReader<R> {
    stream: R,

    // The buffer for reading frames. Unparsed bytes stay here between calls,
    // which is what makes `read_frame` safe to cancel.
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R) -> FrameReader<R> {
        FrameReader {
            stream,
            // SSMI lines are short; 4KB holds a good burst of them.
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Read a single `Frame` value from the underlying stream.
    ///
    /// The function waits until it has retrieved enough data to parse a frame.
    /// Any data remaining in the read buffer after the frame has been parsed is
    /// kept there for the next call to `read_frame`.
    ///
    /// # Returns
    ///
    /// On success, the received frame is returned. If the stream is closed in
    /// a way that doesn't break a frame in half, it returns `None`. Otherwise,
    /// an error is returned.
    pub async fn read_frame(&mut self) -> crate::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            // `0` indicates "end of stream".
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                // A clean shutdown leaves nothing but line noise behind.
                return self
                    .buffer
                    .iter()
                    .all(|b| b.is_ascii_whitespace())
                    .then_some(None)
                    .ok_or_else(|| "connection reset by peer".into());
            }
        }
    }

    /// Tries to parse a frame from the buffer. If the buffer contains enough
    /// data, the frame is returned and the data removed from the buffer. If not
    /// enough data has been buffered yet, `Ok(None)` is returned. If the
    /// buffered data does not represent a valid frame, `Err` is returned.
    fn parse_frame(&mut self) -> crate::Result<Option<Frame>> {
        use frame::Error::Incomplete;

        // Blank lines between frames carry nothing.
        let blank = self
            .buffer
            .iter()
            .take_while(|&&b| b == b'\r' || b == b'\n')
            .count();
        self.buffer.advance(blank);

        let mut buf = Cursor::new(&self.buffer[..]);

        match Frame::check(&mut buf) {
            Ok(_) => {
                let len = buf.position() as usize;
                buf.set_position(0);

                // A malformed line is dropped rather than tearing the session
                // down; the caller decides what to do with the error.
                let parsed = Frame::parse(&mut buf);
                self.buffer.advance(len);

                Ok(Some(parsed?))
            }
            // Not enough data yet; wait for the socket. This is an expected
            // runtime condition, not an error.
            Err(Incomplete) => Ok(None),
            // The stream is in an unrecoverable state (e.g. an oversized line).
            Err(e) => Err(e.into()),
        }
    }
}

/// Write half of an SSMI connection.
#[derive(Debug)]
pub struct FrameWriter<W: AsyncWrite> {
    // Decorated with a `BufWriter` so each frame goes out in one write.
    stream: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(stream: W) -> FrameWriter<W> {
        FrameWriter {
            stream: BufWriter::new(stream),
        }
    }

    /// Write a single `Frame` value to the underlying stream and flush it.
    pub async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.stream.write_all(&frame.to_bytes()).await?;

        // The call above only fills the buffer; flush puts it on the wire.
        self.stream.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
