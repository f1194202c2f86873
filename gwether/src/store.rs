//! Storage backend for per-sensor series.
//!
//! The dispatcher does not touch files directly. It asks a [`SeriesBackend`]
//! where a series lives and to open it, and writes through the returned
//! [`SeriesWriter`]. [`SeriesStore`] is the on-disk backend: one
//! [`SeriesFile`] per sensor inside a single directory.
//!
//! # File Layout
//!
//! ```text
//! storage_dir/
//! ├── acuritetower-1234-2.rrd     <- sanitize(model)-id-channel.ext
//! ├── nexusth-7-1.rrd
//! └── ...
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Result, StoreError};
use crate::sanitize::SeriesKey;
use crate::series_file::SeriesFile;
use crate::template::SeriesTemplate;

/// Default extension of series files.
pub const DEFAULT_EXTENSION: &str = "rrd";

/// Write side of one open series.
///
/// Implementations must tolerate concurrent callers; the cache hands the
/// same handle to every delivery thread.
pub trait SeriesWriter: Send + Sync {
    /// Stores `value` at `timestamp` (unix seconds).
    ///
    /// # Errors
    ///
    /// Returns an error if the series rejects the sample.
    fn update(&self, timestamp: i64, value: f64) -> Result<()>;

    /// Flushes buffered writes. The default does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Resolves and opens series.
pub trait SeriesBackend: Send + Sync {
    /// Handle type handed out for each series.
    type Handle: SeriesWriter;

    /// Returns where the series for `key` lives.
    fn locator(&self, key: &SeriesKey) -> PathBuf;

    /// Opens the series at `locator`, creating and configuring it if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the series can be neither opened nor created.
    fn open_or_create(&self, locator: &Path) -> Result<Self::Handle>;
}

/// Directory of round-robin series files sharing one template.
///
/// # Example
///
/// ```rust,no_run
/// use gwether::store::{SeriesBackend, SeriesStore, SeriesWriter};
/// use gwether::sanitize::SeriesKey;
/// use gwether::template::SeriesTemplate;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = SeriesStore::open("./rrd", "rrd", SeriesTemplate::default())?;
/// let locator = store.locator(&SeriesKey::new("Acurite-Tower", 1234, 2));
/// let handle = store.open_or_create(&locator)?;
/// handle.update(1_700_000_000, 21.5)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SeriesStore {
    directory: PathBuf,
    extension: String,
    template: SeriesTemplate,
}

impl SeriesStore {
    /// Prepares `directory` (creating it if needed) for series files.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory cannot be created or the
    /// extension is not a plain alphanumeric word, and
    /// [`TemplateError`](crate::error::TemplateError) for an invalid template.
    pub fn open<P: AsRef<Path>>(directory: P, extension: &str, template: SeriesTemplate) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StoreError::InvalidExtension {
                extension: extension.to_string(),
            }
            .into());
        }

        template.validate()?;

        fs::create_dir_all(&directory).map_err(|e| StoreError::DirectoryAccess {
            path: directory.clone(),
            source: e,
        })?;

        tracing::debug!(
            directory = %directory.display(),
            extension,
            data_source = %template.data_source,
            "series store ready"
        );

        Ok(Self {
            directory,
            extension: extension.to_string(),
            template,
        })
    }

    /// Returns the storage directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns the series file extension.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Returns the template applied to new series.
    pub fn template(&self) -> &SeriesTemplate {
        &self.template
    }
}

impl SeriesBackend for SeriesStore {
    type Handle = SeriesHandle;

    fn locator(&self, key: &SeriesKey) -> PathBuf {
        key.locator(&self.directory, &self.extension)
    }

    fn open_or_create(&self, locator: &Path) -> Result<SeriesHandle> {
        SeriesFile::open_or_create(locator, &self.template).map(SeriesHandle::new)
    }
}

/// Shared handle on one series file.
///
/// Writes are serialized by an internal mutex, so updates to one series never
/// interleave while different series are written in parallel.
#[derive(Debug)]
pub struct SeriesHandle {
    file: Mutex<SeriesFile>,
}

impl SeriesHandle {
    /// Wraps an open series file.
    pub fn new(file: SeriesFile) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }

    /// Returns the newest stored sample.
    pub fn last_sample(&self) -> Option<(i64, f64)> {
        self.lock().last_sample()
    }

    /// Returns stored samples with `start <= timestamp < end`, oldest first.
    pub fn fetch(&self, start: i64, end: i64) -> Vec<(i64, f64)> {
        self.lock().fetch(start, end)
    }

    /// Returns the path of the underlying file.
    pub fn path(&self) -> PathBuf {
        self.lock().path().to_path_buf()
    }

    // A panic mid-update leaves at most one half-written slot behind, which
    // the next update to that slot overwrites.
    fn lock(&self) -> MutexGuard<'_, SeriesFile> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SeriesWriter for SeriesHandle {
    fn update(&self, timestamp: i64, value: f64) -> Result<()> {
        self.lock().update(timestamp, value)
    }

    fn flush(&self) -> Result<()> {
        self.lock().sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GwetherError;

    #[test]
    fn test_open_creates_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().join("nested").join("rrd");

        let store = SeriesStore::open(&dir, "rrd", SeriesTemplate::default()).unwrap();
        assert!(dir.is_dir());
        assert_eq!(store.directory(), dir);
        assert_eq!(store.extension(), "rrd");
    }

    #[test]
    fn test_rejects_bad_extension() {
        let temp_dir = tempfile::tempdir().unwrap();
        for ext in ["", "r/d", "..", "rrd.bak"] {
            let result = SeriesStore::open(temp_dir.path(), ext, SeriesTemplate::default());
            assert!(
                matches!(result, Err(GwetherError::Store(StoreError::InvalidExtension { .. }))),
                "accepted {ext:?}"
            );
        }
    }

    #[test]
    fn test_locator_inside_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SeriesStore::open(temp_dir.path(), "rrd", SeriesTemplate::default()).unwrap();

        let locator = store.locator(&SeriesKey::new("Acurite-Tower", 1234, 2));
        assert_eq!(locator, temp_dir.path().join("acuritetower-1234-2.rrd"));
    }

    #[test]
    fn test_handle_writes_through() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SeriesStore::open(temp_dir.path(), "rrd", SeriesTemplate::default()).unwrap();
        let locator = store.locator(&SeriesKey::new("Nexus-TH", 7, 1));

        let handle = store.open_or_create(&locator).unwrap();
        handle.update(1_700_000_000, 19.5).unwrap();
        handle.flush().unwrap();
        assert_eq!(handle.last_sample(), Some((1_700_000_000, 19.5)));
        assert_eq!(handle.path(), locator);
        drop(handle);

        // Reopening sees the same data
        let handle = store.open_or_create(&locator).unwrap();
        assert_eq!(handle.fetch(0, i64::MAX), vec![(1_700_000_000, 19.5)]);
    }
}
