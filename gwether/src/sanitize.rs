//! Series key derivation.
//!
//! A sensor is identified upstream by its `(model, id, channel)` triple. The
//! model is free text, so it is reduced to `[a-z0-9]` before it becomes part
//! of a file name. The resulting [`SeriesKey`] is stable across casing and
//! punctuation differences in the reported model.

use std::fmt;
use std::path::{Path, PathBuf};

/// Lower-cases `raw` and drops every character outside `[a-z0-9]`.
///
/// The output is always a safe path component (possibly empty), and the
/// function is idempotent: `sanitize(&sanitize(s)) == sanitize(s)`.
///
/// # Examples
///
/// ```rust
/// use gwether::sanitize::sanitize;
///
/// assert_eq!(sanitize("Acurite-Tower"), "acuritetower");
/// assert_eq!(sanitize("../../etc"), "etc");
/// ```
pub fn sanitize(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect();
    tracing::debug!(raw, sanitized = %sanitized, "sanitized model");
    sanitized
}

/// Identity of one logical series: `sanitize(model)-id-channel`.
///
/// Used as the file stem of the series file; the full [`locator`](Self::locator)
/// is the key of the handle cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey(String);

impl SeriesKey {
    /// Builds the key for a sensor triple.
    pub fn new(model: &str, id: i64, channel: i64) -> Self {
        Self(format!("{}-{id}-{channel}", sanitize(model)))
    }

    /// Returns the key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `{directory}/{key}.{extension}`.
    pub fn locator(&self, directory: &Path, extension: &str) -> PathBuf {
        directory.join(format!("{}.{extension}", self.0))
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
