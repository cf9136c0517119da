//! Header line cache.
//!
//! Rendering a header goes through the CSV writer so quoting matches the data rows.
//! Each record type is rendered once per cache and never invalidated. One cache is
//! created at startup and shared by every [`AppendResultStorageService`].
//!
//! [`AppendResultStorageService`]: super::AppendResultStorageService

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::csv_blob::header_line;
use super::CsvRecord;
use crate::error::Result;

#[derive(Debug, Default)]
pub struct HeaderCache {
    headers: RwLock<HashMap<TypeId, Arc<str>>>,
}

impl HeaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header line of `T`, without line terminator.
    pub fn get<T: CsvRecord>(&self) -> Result<Arc<str>> {
        let type_id = TypeId::of::<T>();
        {
            let headers = self.headers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(header) = headers.get(&type_id) {
                return Ok(header.clone());
            }
        }

        let rendered: Arc<str> = header_line(T::HEADER)?.into();
        let mut headers = self.headers.write().unwrap_or_else(|e| e.into_inner());
        Ok(headers.entry(type_id).or_insert(rendered).clone())
    }

    pub fn len(&self) -> usize {
        self.headers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
