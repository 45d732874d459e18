//! Length-prefixed text frames
//!
//! Every client line and server reply travels as one frame:
//!
//! ```text
//! +-----------------+---------------------+
//! | payload length  | payload             |
//! | u32, big endian | UTF-8, length bytes |
//! +-----------------+---------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size: 4 bytes length
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default maximum frame payload size (1 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// One length-prefixed payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Frame a line of text
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Bytes::from(text.into()))
    }

    /// Bytes on the wire, header included
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_size());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Split one complete frame off the front of `buf`.
    ///
    /// `Ok(None)` means more bytes are needed; nothing is consumed until
    /// the whole frame is buffered. A declared length above
    /// `max_frame_size` is an `InvalidData` error.
    pub fn decode(buf: &mut BytesMut, max_frame_size: usize) -> io::Result<Option<Frame>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let payload_len = u32::from_be_bytes(header) as usize;

        if payload_len > max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit of {}", payload_len, max_frame_size),
            ));
        }

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        Ok(Some(Frame::new(buf.split_to(payload_len).freeze())))
    }

    /// Interpret the payload as UTF-8 text
    pub fn into_text(self) -> io::Result<String> {
        String::from_utf8(self.payload.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Incremental decoder: feed it whatever arrived, pull out whole frames
#[derive(Debug)]
pub struct FrameCodec {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn decode_next(&mut self) -> io::Result<Option<Frame>> {
        Frame::decode(&mut self.buffer, self.max_frame_size)
    }

    /// Bytes received but not yet returned as a frame
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Reads whole frames off a byte stream
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    codec: FrameCodec,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            codec: FrameCodec::with_max_frame_size(max_frame_size),
            buf: vec![0u8; 4096],
        }
    }

    /// Read the next complete frame.
    ///
    /// Blocks until the full frame has arrived. End of stream, including a
    /// stream that ends part-way through a frame, is reported as
    /// `UnexpectedEof`.
    pub async fn read_frame(&mut self) -> io::Result<Frame> {
        loop {
            if let Some(frame) = self.codec.decode_next()? {
                return Ok(frame);
            }

            let n = self.inner.read(&mut self.buf).await?;
            if n == 0 {
                let msg = if self.codec.buffered_len() > 0 {
                    "connection closed mid-frame"
                } else {
                    "connection closed"
                };
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, msg));
            }
            self.codec.feed(&self.buf[..n]);
        }
    }

    /// Read the next frame as UTF-8 text
    pub async fn read_text(&mut self) -> io::Result<String> {
        self.read_frame().await?.into_text()
    }
}

/// Write one frame and flush it
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    frame: &Frame,
) -> io::Result<()> {
    writer.write_all(&frame.encode_to_bytes()).await?;
    writer.flush().await
}
