//! Entity and Request Size Model
//!
//! Table backends limit both the size of a single entity and the size of the encoded
//! transaction request. Callers that pack payloads into rows need to predict both
//! without talking to the backend.
//!
//! ## Entity size
//!
//! ```text
//!   4                                  entity overhead
//! + 2 * len(partition_key)             UTF-16 code units
//! + 2 * len(row_key)
//! + Σ (8 + 2 * len(name) + value)      per property
//!
//!   value: Int32 = 4, Int64 = 8, String = 4 + 2 * len, Binary = 4 + bytes
//! ```
//!
//! ## Request size
//!
//! The request body carries every row in a text encoding: binary values are base64,
//! and each action and property pays a fixed envelope. [`request_size`] is an upper
//! estimate used by the in-memory backend to enforce `max_request_bytes`.

use crate::types::{PropertyValue, TableAction, TableRow};

const ENTITY_OVERHEAD: usize = 4;
const PROPERTY_OVERHEAD: usize = 8;
const INT32_SIZE: usize = 4;
const INT64_SIZE: usize = 8;
const LENGTH_PREFIX: usize = 4;

const ACTION_ENVELOPE_BYTES: usize = 256;
const PROPERTY_ENVELOPE_BYTES: usize = 32;

/// Number of UTF-16 code units in `s`.
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Incremental entity size accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntitySizeCalculator {
    size: usize,
}

impl EntitySizeCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn reset(&mut self) {
        self.size = 0;
    }

    pub fn add_entity_overhead(&mut self) -> &mut Self {
        self.size += ENTITY_OVERHEAD;
        self
    }

    /// Partition key of `chars` UTF-16 code units.
    pub fn add_partition_key(&mut self, chars: usize) -> &mut Self {
        self.size += 2 * chars;
        self
    }

    /// Row key of `chars` UTF-16 code units.
    pub fn add_row_key(&mut self, chars: usize) -> &mut Self {
        self.size += 2 * chars;
        self
    }

    /// Property name of `chars` UTF-16 code units, excluding the value.
    pub fn add_property_overhead(&mut self, chars: usize) -> &mut Self {
        self.size += PROPERTY_OVERHEAD + 2 * chars;
        self
    }

    pub fn add_int32_data(&mut self) -> &mut Self {
        self.size += INT32_SIZE;
        self
    }

    pub fn add_int64_data(&mut self) -> &mut Self {
        self.size += INT64_SIZE;
        self
    }

    pub fn add_string_data(&mut self, chars: usize) -> &mut Self {
        self.size += LENGTH_PREFIX + 2 * chars;
        self
    }

    pub fn add_binary_data(&mut self, bytes: usize) -> &mut Self {
        self.size += LENGTH_PREFIX + bytes;
        self
    }

    pub fn add_value(&mut self, value: &PropertyValue) -> &mut Self {
        match value {
            PropertyValue::Int32(_) => self.add_int32_data(),
            PropertyValue::Int64(_) => self.add_int64_data(),
            PropertyValue::String(s) => self.add_string_data(utf16_len(s)),
            PropertyValue::Binary(b) => self.add_binary_data(b.len()),
        }
    }
}

/// Size of `row` under the entity size model.
pub fn entity_size(row: &TableRow) -> usize {
    let mut calc = EntitySizeCalculator::new();
    calc.add_entity_overhead()
        .add_partition_key(utf16_len(&row.partition_key))
        .add_row_key(utf16_len(&row.row_key));
    for (name, value) in &row.properties {
        calc.add_property_overhead(utf16_len(name)).add_value(value);
    }
    calc.size()
}

fn base64_len(bytes: usize) -> usize {
    bytes.div_ceil(3) * 4
}

fn encoded_value_len(value: &PropertyValue) -> usize {
    match value {
        PropertyValue::Int32(_) => 11,
        PropertyValue::Int64(_) => 20,
        PropertyValue::String(s) => s.len(),
        PropertyValue::Binary(b) => base64_len(b.len()),
    }
}

/// Estimated encoded size of a transaction request body.
pub fn request_size(actions: &[TableAction]) -> usize {
    actions
        .iter()
        .map(|action| {
            let keys = ACTION_ENVELOPE_BYTES + action.partition_key().len() + action.row_key().len();
            let props: usize = action
                .row()
                .map(|row| {
                    row.properties
                        .iter()
                        .map(|(name, value)| {
                            PROPERTY_ENVELOPE_BYTES + name.len() + encoded_value_len(value)
                        })
                        .sum()
                })
                .unwrap_or(0);
            keys + props
        })
        .sum()
}
