//! Record hooks for the append log.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A typed row that can be appended to the log and compacted into CSV.
///
/// Fields are written in declaration order and must line up with [`CsvRecord::HEADER`].
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize)]
/// struct PackageVersion {
///     id: String,
///     version: String,
///     size: u64,
/// }
///
/// impl CsvRecord for PackageVersion {
///     const HEADER: &'static [&'static str] = &["id", "version", "size"];
///
///     fn bucket_key(&self) -> String {
///         self.id.to_lowercase()
///     }
///
///     fn record_key(&self) -> Option<String> {
///         Some(format!("{}/{}", self.id.to_lowercase(), self.version))
///     }
/// }
/// ```
pub trait CsvRecord: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Column names.
    const HEADER: &'static [&'static str];

    /// Key hashed to pick the record's bucket. Records that must be deduplicated
    /// against each other need the same bucket key.
    fn bucket_key(&self) -> String;

    /// Identity that must be unique after pruning, if the type has one.
    fn record_key(&self) -> Option<String> {
        None
    }
}
