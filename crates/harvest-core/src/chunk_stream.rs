//! Chunk Stream
//!
//! A read-only, seekable byte stream over an ordered list of independently owned
//! buffers ("chunks"). Wide entities are stored as many bounded-size segments; on read
//! each segment becomes one chunk and the stream stitches them back together without
//! copying.
//!
//! ## Layout
//!
//! ```text
//!   chunks:   [ 0..100 ][ 100..150 ][ 150..350 ]
//!   starts:     0          100         150
//!   position: ---------------^ (120 => chunk 1, offset 20)
//! ```
//!
//! A cumulative start-offset index is built once at construction. A read finds the chunk
//! containing `position` by binary search, then copies forward across chunk boundaries
//! until `count` bytes are copied or the stream is exhausted.
//!
//! ## Semantics
//! - `len()` is fixed at construction and equals the sum of chunk lengths
//! - `position()` is always within `[0, len()]`
//! - reading at or past the end returns `0` and leaves the destination untouched
//! - reading never mutates chunk contents, so rewinding and re-reading yields identical bytes
//!
//! `ChunkStream` implements [`std::io::Read`], [`std::io::Seek`], [`tokio::io::AsyncRead`]
//! and [`tokio::io::AsyncSeek`]. The async forms never suspend.
//!
//! ## Usage
//! ```ignore
//! let mut stream = ChunkStream::new(vec![Bytes::from_static(b"hello "), Bytes::from_static(b"world")]);
//! let mut buf = [0u8; 16];
//! let n = stream.read_into(&mut buf, 0, 16)?;
//! assert_eq!(&buf[..n], b"hello world");
//! ```

use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

use crate::error::{Error, Result};

/// Seekable read-only stream over a list of byte chunks.
#[derive(Debug, Default)]
pub struct ChunkStream {
    chunks: Vec<Bytes>,
    /// Start offset of each entry in `chunks`.
    starts: Vec<u64>,
    length: u64,
    position: u64,
}

impl ChunkStream {
    /// Build a stream over `chunks`. Empty chunks are dropped from the index since they
    /// can never hold the byte at any position.
    pub fn new<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        let mut kept = Vec::new();
        let mut starts = Vec::new();
        let mut length = 0u64;

        for chunk in chunks {
            if chunk.is_empty() {
                continue;
            }
            starts.push(length);
            length += chunk.len() as u64;
            kept.push(chunk);
        }

        Self {
            chunks: kept,
            starts,
            length,
            position: 0,
        }
    }

    /// Total number of bytes in the stream.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the cursor. Positions past the end are rejected.
    pub fn set_position(&mut self, position: u64) -> Result<()> {
        if position > self.length {
            return Err(Error::PositionOutOfRange {
                position,
                length: self.length,
            });
        }
        self.position = position;
        Ok(())
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Copy up to `count` bytes into `buf[offset..offset + count]`, advancing the cursor.
    ///
    /// Returns the number of bytes copied, which is short only when the end of the stream
    /// is reached. Fails with [`Error::BufferOverrun`] when the range does not fit in `buf`.
    pub fn read_into(&mut self, buf: &mut [u8], offset: usize, count: usize) -> Result<usize> {
        let end = offset.checked_add(count).filter(|&end| end <= buf.len());
        let Some(end) = end else {
            return Err(Error::BufferOverrun {
                offset,
                count,
                buffer_len: buf.len(),
            });
        };

        Ok(self.copy_forward(&mut buf[offset..end]))
    }

    /// Async form of [`read_into`](Self::read_into). Completes without suspending.
    pub async fn read_into_async(
        &mut self,
        buf: &mut [u8],
        offset: usize,
        count: usize,
    ) -> Result<usize> {
        self.read_into(buf, offset, count)
    }

    /// Concatenate the whole stream, independent of the cursor.
    pub fn to_bytes(&self) -> Bytes {
        match self.chunks.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            many => {
                let mut out = BytesMut::with_capacity(self.length as usize);
                for chunk in many {
                    out.extend_from_slice(chunk);
                }
                out.freeze()
            }
        }
    }

    fn copy_forward(&mut self, dst: &mut [u8]) -> usize {
        if dst.is_empty() || self.position >= self.length {
            return 0;
        }

        // Last chunk whose start is <= position. position < length guarantees one exists.
        let mut index = self.starts.partition_point(|&start| start <= self.position) - 1;
        let mut copied = 0;

        while copied < dst.len() && index < self.chunks.len() {
            let chunk = &self.chunks[index];
            let within = (self.position - self.starts[index]) as usize;
            let take = (chunk.len() - within).min(dst.len() - copied);

            dst[copied..copied + take].copy_from_slice(&chunk[within..within + take]);
            copied += take;
            self.position += take as u64;
            index += 1;
        }

        copied
    }

    fn resolve_seek(&self, target: SeekFrom) -> io::Result<u64> {
        let resolved = match target {
            SeekFrom::Start(pos) => Some(pos),
            SeekFrom::End(delta) => self.length.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };

        match resolved {
            Some(pos) if pos <= self.length => Ok(pos),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek target {target:?} is outside of stream length {}", self.length),
            )),
        }
    }
}

impl io::Read for ChunkStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.copy_forward(buf))
    }
}

impl io::Seek for ChunkStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = self.resolve_seek(pos)?;
        Ok(self.position)
    }
}

impl AsyncRead for ChunkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let copied = this.copy_forward(buf.initialize_unfilled());
        buf.advance(copied);
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for ChunkStream {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        this.position = this.resolve_seek(position)?;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn stream_of(sizes: &[usize]) -> (ChunkStream, Vec<u8>) {
        let all = pattern(sizes.iter().sum());
        let mut chunks = Vec::new();
        let mut at = 0;
        for &size in sizes {
            chunks.push(Bytes::copy_from_slice(&all[at..at + size]));
            at += size;
        }
        (ChunkStream::new(chunks), all)
    }

    #[test]
    fn test_length_is_sum_of_chunks() {
        let (stream, _) = stream_of(&[100, 50, 200]);
        assert_eq!(stream.len(), 350);
        assert_eq!(stream.position(), 0);
    }

    #[test]
    fn test_read_all_in_one_call() {
        let (mut stream, expected) = stream_of(&[100, 50, 200]);
        let mut buf = vec![0u8; 350];
        let n = stream.read_into(&mut buf, 0, 350).unwrap();
        assert_eq!(n, 350);
        assert_eq!(buf, expected);
        assert_eq!(stream.position(), 350);
    }

    #[test]
    fn test_read_with_empty_chunks_interleaved() {
        let (mut stream, expected) = stream_of(&[0, 100, 0, 0, 1, 0, 49, 0]);
        assert_eq!(stream.len(), 150);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_read_past_end_leaves_buffer_untouched() {
        let (mut stream, _) = stream_of(&[10]);
        stream.set_position(10).unwrap();
        let mut buf = [0xAAu8; 4];
        assert_eq!(stream.read_into(&mut buf, 0, 4).unwrap(), 0);
        assert_eq!(buf, [0xAA; 4]);
    }

    #[test]
    fn test_short_read_near_end() {
        let (mut stream, expected) = stream_of(&[6, 4]);
        stream.set_position(7).unwrap();
        let mut buf = [0xFFu8; 8];
        let n = stream.read_into(&mut buf, 2, 6).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[2..5], &expected[7..10]);
        assert_eq!(buf[0..2], [0xFFu8; 2]);
        assert_eq!(buf[5..], [0xFFu8; 3]);
    }

    #[test]
    fn test_zero_count_is_noop() {
        let (mut stream, _) = stream_of(&[5]);
        let mut buf = [0u8; 1];
        assert_eq!(stream.read_into(&mut buf, 1, 0).unwrap(), 0);
        assert_eq!(stream.position(), 0);
    }

    #[test]
    fn test_buffer_overrun_rejected() {
        let (mut stream, _) = stream_of(&[5]);
        let mut buf = [0u8; 4];
        let err = stream.read_into(&mut buf, 2, 3).unwrap_err();
        assert!(matches!(err, Error::BufferOverrun { offset: 2, count: 3, buffer_len: 4 }));

        let err = stream.read_into(&mut buf, usize::MAX, 1).unwrap_err();
        assert!(matches!(err, Error::BufferOverrun { .. }));
    }

    #[test]
    fn test_set_position_bounds() {
        let (mut stream, _) = stream_of(&[5]);
        assert!(stream.set_position(5).is_ok());
        assert!(matches!(
            stream.set_position(6),
            Err(Error::PositionOutOfRange { position: 6, length: 5 })
        ));
    }

    #[test]
    fn test_seek_variants() {
        let (mut stream, expected) = stream_of(&[3, 3, 3]);
        assert_eq!(stream.seek(SeekFrom::End(-2)).unwrap(), 7);
        assert_eq!(stream.seek(SeekFrom::Current(-4)).unwrap(), 3);
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, &expected[3..6]);

        assert!(stream.seek(SeekFrom::Current(-10)).is_err());
        assert!(stream.seek(SeekFrom::End(1)).is_err());
        assert_eq!(stream.position(), 6);
    }

    #[test]
    fn test_to_bytes_ignores_cursor() {
        let (mut stream, expected) = stream_of(&[2, 2]);
        stream.set_position(3).unwrap();
        assert_eq!(stream.to_bytes().as_ref(), expected.as_slice());
        assert_eq!(stream.position(), 3);
    }

    #[test]
    fn test_empty_stream() {
        let mut stream = ChunkStream::new(Vec::new());
        assert!(stream.is_empty());
        let mut buf = [0u8; 8];
        assert_eq!(stream.read_into(&mut buf, 0, 8).unwrap(), 0);
        assert!(stream.to_bytes().is_empty());
    }
}
