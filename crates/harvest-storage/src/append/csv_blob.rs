//! Compacted blob encoding.
//!
//! A compacted blob is a header line followed by one CSV row per record, optionally
//! gzipped:
//!
//! ```text
//! Id,Version,Size\n
//! NuGet.Versioning,5.11.0,120311\n
//! Newtonsoft.Json,13.0.3,712409\n
//! ```
//!
//! Rows are read with a bounded per-row buffer. A row larger than the buffer restarts
//! the read with a doubled buffer, up to a hard maximum.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

fn writer_builder() -> csv::WriterBuilder {
    let mut builder = csv::WriterBuilder::new();
    builder
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'));
    builder
}

fn into_inner(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    writer.into_inner().map_err(|e| Error::Io(e.into_error()))
}

/// Render column names as a CSV header line without terminator.
pub(crate) fn header_line(columns: &[&str]) -> Result<String> {
    let mut writer = writer_builder().from_writer(Vec::new());
    writer.write_record(columns)?;
    let bytes = into_inner(writer)?;
    let mut line = String::from_utf8(bytes).map_err(|e| Error::Serialization(e.to_string()))?;
    if line.ends_with('\n') {
        line.pop();
    }
    Ok(line)
}

/// Header line, newline, then one row per record.
pub(crate) fn write_csv<T: Serialize>(header: &str, records: &[T]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(header.len() + 1);
    out.extend_from_slice(header.as_bytes());
    out.push(b'\n');

    let mut writer = writer_builder().from_writer(out);
    for record in records {
        writer.serialize(record)?;
    }
    into_inner(writer)
}

pub(crate) fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub(crate) fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Lowercase hex SHA-256 of `data`.
pub(crate) fn content_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

enum RowError {
    TooLarge(usize),
    Failed(Error),
}

impl From<csv::Error> for RowError {
    fn from(e: csv::Error) -> Self {
        RowError::Failed(e.into())
    }
}

/// Parse a blob written by [`write_csv`].
///
/// # Errors
///
/// - `HeaderMismatch`: the first line is not `expected_header`
/// - `BufferTooSmall`: a row is larger than `max_buffer`
pub(crate) fn read_csv<T: DeserializeOwned>(
    expected_header: &str,
    data: &[u8],
    initial_buffer: usize,
    max_buffer: usize,
) -> Result<Vec<T>> {
    let (header, body) = match data.iter().position(|b| *b == b'\n') {
        Some(end) => (&data[..end], &data[end + 1..]),
        None => (data, &data[data.len()..]),
    };
    let header = header.strip_suffix(b"\r").unwrap_or(header);
    if header != expected_header.as_bytes() {
        return Err(Error::HeaderMismatch {
            expected: expected_header.to_string(),
            actual: String::from_utf8_lossy(header).into_owned(),
        });
    }

    let mut buffer = initial_buffer.max(1);
    loop {
        match read_rows(body, buffer) {
            Ok(records) => return Ok(records),
            Err(RowError::TooLarge(row_bytes)) if buffer < max_buffer => {
                let next = buffer.saturating_mul(2).min(max_buffer);
                tracing::debug!(
                    row_bytes,
                    buffer_bytes = buffer,
                    next_buffer_bytes = next,
                    "CSV row exceeds buffer, retrying with a larger one"
                );
                buffer = next;
            }
            Err(RowError::TooLarge(row_bytes)) => {
                return Err(Error::BufferTooSmall {
                    row_bytes,
                    max: max_buffer,
                })
            }
            Err(RowError::Failed(e)) => return Err(e),
        }
    }
}

fn read_rows<T: DeserializeOwned>(body: &[u8], buffer: usize) -> std::result::Result<Vec<T>, RowError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .buffer_capacity(buffer)
        .from_reader(body);
    let mut row = csv::ByteRecord::new();
    let mut records = Vec::new();
    loop {
        let start = reader.position().byte();
        if !reader.read_byte_record(&mut row)? {
            return Ok(records);
        }
        let row_bytes = (reader.position().byte() - start) as usize;
        if row_bytes > buffer {
            return Err(RowError::TooLarge(row_bytes));
        }
        records.push(row.deserialize(None)?);
    }
}
