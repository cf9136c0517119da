//! Edge-case tests for ChunkStream reads across chunk boundaries.

use std::io::{Read, Seek, SeekFrom};

use bytes::Bytes;
use harvest_core::ChunkStream;

// ---------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------

fn build(sizes: &[usize]) -> (ChunkStream, Vec<u8>) {
    let total: usize = sizes.iter().sum();
    let expected: Vec<u8> = (0..total).map(|i| (i * 7 % 256) as u8).collect();
    let mut chunks = Vec::with_capacity(sizes.len());
    let mut at = 0;
    for &size in sizes {
        chunks.push(Bytes::copy_from_slice(&expected[at..at + size]));
        at += size;
    }
    (ChunkStream::new(chunks), expected)
}

const CASES: &[&[usize]] = &[
    &[],
    &[0],
    &[1],
    &[100, 50, 200],
    &[0, 100, 0, 0, 1, 0, 49, 0],
    &[1, 1, 1, 1, 1, 1, 1],
    &[4096, 3, 65536],
];

// ---------------------------------------------------------------
// Multiple reads
// ---------------------------------------------------------------

#[test]
fn multiple_small_reads_reproduce_content() {
    for sizes in CASES {
        for read_size in [1usize, 3, 7, 64, 1000] {
            let (mut stream, expected) = build(sizes);
            let mut out = Vec::new();
            let mut buf = vec![0u8; read_size];
            loop {
                let n = stream.read_into(&mut buf, 0, read_size).unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            assert_eq!(out, expected, "sizes {sizes:?}, read size {read_size}");
        }
    }
}

#[test]
fn reads_at_offsets_into_larger_buffer() {
    let (mut stream, expected) = build(&[100, 50, 200]);
    let mut buf = vec![0u8; 400];
    let first = stream.read_into(&mut buf, 10, 120).unwrap();
    let second = stream.read_into(&mut buf, 10 + first, 400 - 10 - first).unwrap();
    assert_eq!(first, 120);
    assert_eq!(second, 230);
    assert_eq!(&buf[10..360], expected.as_slice());
    assert!(buf[..10].iter().all(|&b| b == 0));
    assert!(buf[360..].iter().all(|&b| b == 0));
}

#[test]
fn rewind_and_reread_is_identical() {
    for sizes in CASES {
        let (mut stream, expected) = build(sizes);
        let mut first = Vec::new();
        stream.read_to_end(&mut first).unwrap();

        stream.seek(SeekFrom::Start(0)).unwrap();
        let mut second = Vec::new();
        stream.read_to_end(&mut second).unwrap();

        assert_eq!(first, expected);
        assert_eq!(second, expected);
    }
}

#[test]
fn seek_into_middle_of_chunk() {
    let (mut stream, expected) = build(&[100, 50, 200]);
    for start in [0u64, 1, 99, 100, 101, 149, 150, 151, 349, 350] {
        stream.set_position(start).unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, expected[start as usize..], "start {start}");
    }
}

// ---------------------------------------------------------------
// Async reads
// ---------------------------------------------------------------

mod async_reads {
    use std::io::SeekFrom;

    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    use super::{build, CASES};

    #[tokio::test]
    async fn async_read_matches_sync_read() {
        for sizes in CASES {
            let (mut stream, expected) = build(sizes);
            let mut out = Vec::new();
            stream.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, expected);

            stream.seek(SeekFrom::Start(0)).await.unwrap();
            let mut buf = vec![0u8; expected.len() + 8];
            let n = stream
                .read_into_async(&mut buf, 4, expected.len() + 4)
                .await
                .unwrap();
            assert_eq!(n, expected.len());
            assert_eq!(&buf[4..4 + n], expected.as_slice());
        }
    }

    #[tokio::test]
    async fn async_read_at_end_returns_zero() {
        let (mut stream, _) = build(&[10, 10]);
        stream.seek(SeekFrom::End(0)).await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }
}
