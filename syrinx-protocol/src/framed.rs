//! The framed payload stream used inside handlers from 1.21: a sequence of
//! `len`-prefixed chunks terminated by a zero-length chunk. It runs on the
//! main channel after the request arguments and never interleaves with
//! stderr frames.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{IoErrorContext, ProtocolError};
use crate::protocol::MAX_STRING_SIZE;

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Writes a self-delimiting chunk stream. Data is buffered to full chunks;
/// `finish` flushes the tail and writes the terminator.
pub struct FramedSink<W> {
    writer: W,
    buffer: Vec<u8>,
    chunk_size: usize,
}

impl<W: AsyncWrite + Unpin> FramedSink<W> {
    pub fn new(writer: W) -> Self {
        Self::with_chunk_size(writer, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(writer: W, chunk_size: usize) -> Self {
        FramedSink {
            writer,
            buffer: Vec::with_capacity(chunk_size),
            chunk_size,
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let available = self.chunk_size - self.buffer.len();
            let take = remaining.len().min(available);
            self.buffer.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            if self.buffer.len() == self.chunk_size {
                self.flush_chunk().await?;
            }
        }
        Ok(())
    }

    async fn flush_chunk(&mut self) -> Result<(), ProtocolError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let len = self.buffer.len() as u64;
        self.writer
            .write_all(&len.to_le_bytes())
            .await
            .io_context("writing chunk length")?;
        self.writer
            .write_all(&self.buffer)
            .await
            .io_context("writing chunk data")?;
        self.buffer.clear();
        Ok(())
    }

    /// Flush pending data, write the terminating zero chunk and hand the
    /// writer back.
    pub async fn finish(mut self) -> Result<W, ProtocolError> {
        self.flush_chunk().await?;
        self.writer
            .write_all(&0u64.to_le_bytes())
            .await
            .io_context("writing chunk terminator")?;
        Ok(self.writer)
    }
}

/// Reads a chunk stream back into a continuous byte stream. Hitting EOF
/// before the terminator is fatal: the peer died mid-payload.
pub struct FramedSource<R> {
    reader: R,
    chunk: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FramedSource<R> {
    pub fn new(reader: R) -> Self {
        FramedSource {
            reader,
            chunk: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    async fn next_chunk(&mut self) -> Result<(), ProtocolError> {
        let mut len_buf = [0u8; 8];
        self.reader
            .read_exact(&mut len_buf)
            .await
            .map_err(|_| ProtocolError::FrameTruncated)?;
        let len = u64::from_le_bytes(len_buf);
        if len == 0 {
            self.eof = true;
            return Ok(());
        }
        if len > MAX_STRING_SIZE {
            return Err(ProtocolError::StringTooLong {
                length: len,
                max: MAX_STRING_SIZE,
            });
        }
        self.chunk.resize(len as usize, 0);
        self.pos = 0;
        self.reader
            .read_exact(&mut self.chunk)
            .await
            .map_err(|_| ProtocolError::FrameTruncated)?;
        Ok(())
    }

    /// Read into `buf`, returning 0 only at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        if self.eof {
            return Ok(0);
        }
        let mut total = 0;
        while total < buf.len() {
            if self.pos >= self.chunk.len() {
                self.next_chunk().await?;
                if self.eof {
                    break;
                }
            }
            let take = (buf.len() - total).min(self.chunk.len() - self.pos);
            buf[total..total + take].copy_from_slice(&self.chunk[self.pos..self.pos + take]);
            self.pos += take;
            total += take;
        }
        Ok(total)
    }

    /// Drain the stream up to its terminator. Used to keep the connection
    /// in sync when a handler fails mid-payload.
    pub async fn consume_to_end(&mut self) -> Result<(), ProtocolError> {
        while !self.eof {
            self.next_chunk().await?;
        }
        Ok(())
    }

    /// Drain the remaining stream into `sink`, returning the byte count.
    pub async fn copy_to<W: AsyncWrite + Unpin>(
        &mut self,
        sink: &mut W,
    ) -> Result<u64, ProtocolError> {
        let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])
                .await
                .io_context("writing framed payload")?;
            total += n as u64;
        }
        Ok(total)
    }
}

/// Copy a whole source into a framed sink.
pub async fn copy_to_framed<R, W>(
    mut source: R,
    sink: &mut FramedSink<W>,
) -> Result<u64, ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buf).await.io_context("reading source")?;
        if n == 0 {
            break;
        }
        sink.write(&buf[..n]).await?;
        total += n as u64;
    }
    Ok(total)
}
