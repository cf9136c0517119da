//! Segment row encoding.
//!
//! Converts payloads into segment rows and segment rows back into [`WideEntity`]s,
//! verifying on the way back that every segment the count property announces is
//! present exactly once.

use bytes::Bytes;
use harvest_table::size::utf16_len;
use harvest_table::{
    entity_size, EntitySizeCalculator, PropertyValue, TableRow, CLIENT_REQUEST_ID_LEN,
    CLIENT_REQUEST_ID_PROPERTY,
};

use super::WideEntity;
use crate::config::{CHUNK_PROPERTIES, MAX_CHUNK_SIZE, MAX_KEY_CHARS, SEGMENT_COUNT_PROPERTY};
use crate::error::{Error, Result};

pub(crate) const SEPARATOR: char = '~';

/// Greatest `char`; `"{rk}~{MAX}"` sorts after every segment key of `rk`.
const MAX_CHAR: char = char::MAX;

/// Characters a segment suffix adds to a row key (`~00`).
const SUFFIX_CHARS: usize = 3;

/// Number of segment rows a payload of `len` bytes occupies. Never zero.
pub fn segment_count(len: usize, segment_size: usize) -> usize {
    len.div_ceil(segment_size).max(1)
}

pub(crate) fn segment_row_key(row_key: &str, index: usize) -> String {
    format!("{row_key}{SEPARATOR}{index:02}")
}

/// Smallest and greatest possible segment keys of every entity in `[min, max]`.
pub(crate) fn data_range(min_row_key: &str, max_row_key: &str) -> (String, String) {
    (
        min_row_key.to_string(),
        format!("{max_row_key}{SEPARATOR}{MAX_CHAR}"),
    )
}

/// Every segment key of one entity.
pub(crate) fn entity_range(row_key: &str) -> (String, String) {
    (
        format!("{row_key}{SEPARATOR}"),
        format!("{row_key}{SEPARATOR}{MAX_CHAR}"),
    )
}

/// Like [`data_range`] but ending at the last entity's first segment.
pub(crate) fn head_range(min_row_key: &str, max_row_key: &str) -> (String, String) {
    (min_row_key.to_string(), segment_row_key(max_row_key, 0))
}

/// Split a segment row key into the entity row key and segment index.
pub(crate) fn parse_segment_row_key(row_key: &str) -> Option<(&str, usize)> {
    let (prefix, index) = row_key.rsplit_once(SEPARATOR)?;
    if index.len() < 2 || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((prefix, index.parse().ok()?))
}

pub(crate) fn validate_keys(partition_key: &str, row_key: &str) -> Result<()> {
    if row_key.contains(SEPARATOR) {
        return Err(Error::InvalidArgument(format!(
            "row key '{row_key}' must not contain '{SEPARATOR}'"
        )));
    }
    if utf16_len(row_key) + SUFFIX_CHARS > MAX_KEY_CHARS {
        return Err(Error::InvalidArgument(format!(
            "row key is longer than {} characters",
            MAX_KEY_CHARS - SUFFIX_CHARS
        )));
    }
    if utf16_len(partition_key) > MAX_KEY_CHARS {
        return Err(Error::InvalidArgument(format!(
            "partition key is longer than {MAX_KEY_CHARS} characters"
        )));
    }
    Ok(())
}

/// Cut `content` into segment rows. Payload slices share `content`'s buffer.
pub(crate) fn build_segments(
    partition_key: &str,
    row_key: &str,
    content: &Bytes,
    segment_size: usize,
) -> Vec<TableRow> {
    let count = segment_count(content.len(), segment_size);
    (0..count)
        .map(|index| {
            let start = index * segment_size;
            let end = (start + segment_size).min(content.len());
            let mut row = TableRow::new(partition_key, segment_row_key(row_key, index));
            if index == 0 {
                row.set(SEGMENT_COUNT_PROPERTY, PropertyValue::Int32(count as i32));
            }

            let mut offset = start;
            for name in CHUNK_PROPERTIES {
                if offset >= end {
                    break;
                }
                let chunk_end = (offset + MAX_CHUNK_SIZE).min(end);
                row.set(name, PropertyValue::Binary(content.slice(offset..chunk_end)));
                offset = chunk_end;
            }
            row
        })
        .collect()
}

/// Entity size of `row` once the retry layer has stamped its client request id.
pub(crate) fn stored_size(row: &TableRow) -> usize {
    let mut size = entity_size(row);
    if row.get(CLIENT_REQUEST_ID_PROPERTY).is_none() {
        let mut calc = EntitySizeCalculator::new();
        calc.add_property_overhead(CLIENT_REQUEST_ID_PROPERTY.len())
            .add_string_data(CLIENT_REQUEST_ID_LEN);
        size += calc.size();
    }
    size
}

/// Entity size of a delete action's key-only payload.
pub(crate) fn key_size(partition_key: &str, row_key: &str) -> usize {
    let mut calc = EntitySizeCalculator::new();
    calc.add_entity_overhead()
        .add_partition_key(utf16_len(partition_key))
        .add_row_key(utf16_len(row_key));
    calc.size()
}

/// Payload chunks of one segment row, in property order.
fn chunks_of(row: &TableRow) -> Result<Vec<Bytes>> {
    let mut chunks = Vec::new();
    let mut ended = false;
    for name in CHUNK_PROPERTIES {
        match row.get(name).and_then(PropertyValue::as_binary) {
            Some(_) if ended => {
                return Err(Error::InvariantViolation(format!(
                    "segment {}/{} has a gap before property {name}",
                    row.partition_key, row.row_key
                )))
            }
            Some(chunk) => chunks.push(chunk.clone()),
            None => ended = true,
        }
    }
    Ok(chunks)
}

/// Group rows sorted by key into per-entity segment lists.
///
/// Segment keys of one entity are contiguous in key order because entity row keys
/// never contain the separator.
pub(crate) fn group_rows(rows: Vec<TableRow>) -> Result<Vec<(String, Vec<TableRow>)>> {
    let mut groups: Vec<(String, Vec<TableRow>)> = Vec::new();
    for row in rows {
        let prefix = match parse_segment_row_key(&row.row_key) {
            Some((prefix, _)) => prefix.to_string(),
            None => {
                return Err(Error::InvariantViolation(format!(
                    "row {}/{} is not a wide entity segment",
                    row.partition_key, row.row_key
                )))
            }
        };
        match groups.last_mut() {
            Some((last_prefix, segments))
                if *last_prefix == prefix
                    && segments
                        .first()
                        .is_some_and(|s| s.partition_key == row.partition_key) =>
            {
                segments.push(row)
            }
            _ => groups.push((prefix, vec![row])),
        }
    }
    Ok(groups)
}

/// Rebuild an entity from its segment rows.
///
/// Without data only segment 0 is inspected; callers may pass the other segment rows
/// or not.
pub(crate) fn assemble(
    row_key: String,
    segments: Vec<TableRow>,
    include_data: bool,
) -> Result<WideEntity> {
    let Some(first) = segments.first() else {
        return Err(Error::InvariantViolation(format!(
            "entity '{row_key}' has no segments"
        )));
    };
    let partition_key = first.partition_key.clone();

    if parse_segment_row_key(&first.row_key).map(|(_, index)| index) != Some(0) {
        return Err(Error::InvariantViolation(format!(
            "entity {partition_key}/{row_key} is missing segment 0"
        )));
    }
    let count = first
        .get(SEGMENT_COUNT_PROPERTY)
        .and_then(PropertyValue::as_i32)
        .filter(|count| *count > 0)
        .ok_or_else(|| {
            Error::InvariantViolation(format!(
                "entity {partition_key}/{row_key} has no valid segment count"
            ))
        })? as usize;
    let etag = first.etag.clone().ok_or_else(|| {
        Error::InvariantViolation(format!("entity {partition_key}/{row_key} has no etag"))
    })?;
    let timestamp = first.timestamp;

    let chunks = if include_data {
        if segments.len() != count {
            return Err(Error::InvariantViolation(format!(
                "entity {partition_key}/{row_key} declares {count} segments but {} were found",
                segments.len()
            )));
        }
        let mut chunks = Vec::new();
        for (expected, row) in segments.iter().enumerate() {
            let index = parse_segment_row_key(&row.row_key).map(|(_, index)| index);
            if index != Some(expected) {
                return Err(Error::InvariantViolation(format!(
                    "entity {partition_key}/{row_key} has segment '{}' where {expected} was expected",
                    row.row_key
                )));
            }
            chunks.extend(chunks_of(row)?);
        }
        Some(chunks)
    } else {
        None
    };

    Ok(WideEntity::new(
        partition_key,
        row_key,
        etag,
        timestamp,
        count,
        chunks,
    ))
}
