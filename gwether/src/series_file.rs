//! Memory-mapped round-robin series file.
//!
//! Each sensor series lives in its own fixed-size file holding a ring of
//! `(timestamp, value)` slots for a single data source. The file is sized
//! once from its [`SeriesTemplate`] and never grows.
//!
//! # File Format
//!
//! All integers are little-endian.
//!
//! ```text
//! [0..64)          Header
//!   [0..4)           magic "GWRR"
//!   [4..8)           format version (u32)
//!   [8..16)          step in seconds (u64)
//!   [16..20)         slot count (u32)
//!   [20..24)         write cursor (u32)
//!   [24..32)         last update, unix seconds (i64)
//!   [32..52)         data source name, NUL padded
//!   [52..64)         reserved
//! [64..64+8N)      timestamp column (i64, 0 = empty slot)
//! [64+8N..64+16N)  value column (f64, NaN = unknown)
//! ```
//!
//! # Slot Mapping
//!
//! `slot = (timestamp / step) % slot_count`. Two samples within the same step
//! land in the same slot and the later one wins. Updates must be strictly
//! newer than the last update, mirroring rrdtool's one-second minimum step.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use memmap2::MmapMut;

use crate::error::{GwetherError, RecordError, Result, SeriesIoError, TemplateError};
use crate::template::{MAX_DATA_SOURCE_LEN, SeriesTemplate};

/// Magic bytes identifying a series file.
const MAGIC: [u8; 4] = *b"GWRR";

/// Current file format version.
const VERSION: u32 = 1;

/// Size of the header in bytes.
const HEADER_SIZE: usize = 64;

const OFF_VERSION: usize = 4;
const OFF_STEP: usize = 8;
const OFF_SLOT_COUNT: usize = 16;
const OFF_CURSOR: usize = 20;
const OFF_LAST_UPDATE: usize = 24;
const OFF_DATA_SOURCE: usize = 32;
const DATA_SOURCE_FIELD: usize = MAX_DATA_SOURCE_LEN + 1;

/// Bytes per slot and column (timestamps and values are both 8 bytes).
const CELL_SIZE: usize = 8;

/// Name a new file is built under before it is renamed to `path`.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

fn is_empty_file(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.len() == 0)
}

/// Total file size for a given slot count.
fn file_size(slot_count: u32) -> usize {
    HEADER_SIZE + 2 * CELL_SIZE * slot_count as usize
}

/// A single round-robin series backed by a memory-mapped file.
///
/// `SeriesFile` is a single-writer structure: mutation goes through `&mut self`
/// and callers sharing one across threads wrap it in a lock.
#[derive(Debug)]
pub struct SeriesFile {
    /// Memory mapping of the whole file.
    mmap: MmapMut,
    /// Path to the file (for error reporting).
    path: PathBuf,
    /// Cached from the header.
    slot_count: u32,
    /// Cached from the header, in seconds.
    step: u64,
}

impl SeriesFile {
    /// Creates a new series file laid out from `template`.
    ///
    /// Fails if the file already exists. The file is built under a staging
    /// name next to `path` and renamed into place once its header is written,
    /// so `path` never refers to a half-initialized file.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] for an invalid template and
    /// [`SeriesIoError::CreateFailed`] if the file cannot be created or mapped.
    pub fn create<P: AsRef<Path>>(path: P, template: &SeriesTemplate) -> Result<Self> {
        let path = path.as_ref();
        template.validate()?;

        let slot_count =
            u32::try_from(template.slot_count()).map_err(|_| TemplateError::InvalidTiming {
                reason: format!("slot count {} does not fit the file format", template.slot_count()),
            })?;
        let step = template.step.as_secs();

        let create_err = |source| SeriesIoError::CreateFailed {
            path: path.to_path_buf(),
            source,
        };

        match path.try_exists() {
            Ok(false) => {}
            Ok(true) => return Err(create_err(io::Error::from(ErrorKind::AlreadyExists)).into()),
            Err(e) => return Err(create_err(e).into()),
        }

        let staging = staging_path(path);
        let result = Self::build_staged(&staging, path, slot_count, step, &template.data_source)
            .and_then(|series| {
                fs::rename(&staging, path).map_err(create_err)?;
                Ok(series)
            });
        if result.is_err() {
            let _ = fs::remove_file(&staging);
        }
        let series = result?;

        tracing::debug!(
            path = %path.display(),
            slot_count,
            step,
            data_source = %template.data_source,
            "created series file"
        );
        Ok(series)
    }

    /// Writes a fully initialized file at `staging` that will live at `path`.
    fn build_staged(
        staging: &Path,
        path: &Path,
        slot_count: u32,
        step: u64,
        data_source: &str,
    ) -> Result<Self> {
        let create_err = |source| SeriesIoError::CreateFailed {
            path: path.to_path_buf(),
            source,
        };

        // A leftover staging file from an interrupted create is overwritten.
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(staging)
            .map_err(create_err)?;

        file.set_len(file_size(slot_count) as u64)
            .map_err(create_err)?;

        // SAFETY: the staging file was just truncated and sized by us and is
        // not visible under its final name yet; no other mapping of it exists.
        let mmap = unsafe { MmapMut::map_mut(&file).map_err(create_err)? };

        let mut series = Self {
            mmap,
            path: path.to_path_buf(),
            slot_count,
            step,
        };
        series.initialize(data_source);
        series.mmap.flush().map_err(create_err)?;
        Ok(series)
    }

    /// Opens an existing series file and validates its header.
    ///
    /// # Errors
    ///
    /// Returns [`SeriesIoError::OpenFailed`] if the file cannot be opened or
    /// mapped, and [`SeriesIoError::Corrupted`] if its header or size is wrong.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let open_err = |source| SeriesIoError::OpenFailed {
            path: path.to_path_buf(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(open_err)?;

        // SAFETY: the mapping is private to this process's handle on the
        // file; the header is validated before any offset is trusted.
        let mmap = unsafe { MmapMut::map_mut(&file).map_err(open_err)? };

        Self::from_mmap(mmap, path)
    }

    /// Opens `path` if it exists, otherwise creates it from `template`.
    ///
    /// An existing file must store the template's data source; its step and
    /// size are taken from the file. An empty file at `path` (left by an
    /// interrupted create or an external tool) is replaced by a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Mismatch`] if the existing file stores a
    /// different data source, or any error of [`create`](Self::create) and
    /// [`open`](Self::open).
    pub fn open_or_create<P: AsRef<Path>>(path: P, template: &SeriesTemplate) -> Result<Self> {
        let path = path.as_ref();

        let series = match Self::create(path, template) {
            Ok(series) => return Ok(series),
            Err(GwetherError::SeriesIo(SeriesIoError::CreateFailed { source, .. }))
                if source.kind() == ErrorKind::AlreadyExists =>
            {
                if is_empty_file(path) {
                    tracing::warn!(path = %path.display(), "replacing empty series file");
                    fs::remove_file(path).map_err(|source| SeriesIoError::CreateFailed {
                        path: path.to_path_buf(),
                        source,
                    })?;
                    return Self::create(path, template);
                }
                Self::open(path)?
            }
            Err(e) => return Err(e),
        };

        let found = series.data_source();
        if found != template.data_source {
            return Err(TemplateError::Mismatch {
                path: path.to_path_buf(),
                expected: template.data_source.clone(),
                found,
            }
            .into());
        }

        tracing::debug!(path = %path.display(), "reopened series file");
        Ok(series)
    }

    fn from_mmap(mmap: MmapMut, path: &Path) -> Result<Self> {
        let corrupted = |reason: String| SeriesIoError::Corrupted {
            path: path.to_path_buf(),
            reason,
        };

        if mmap.len() < HEADER_SIZE {
            return Err(corrupted(format!(
                "file too small: {} bytes, expected at least {HEADER_SIZE}",
                mmap.len()
            ))
            .into());
        }

        let mut series = Self {
            mmap,
            path: path.to_path_buf(),
            slot_count: 0,
            step: 0,
        };

        let magic: [u8; 4] = series.read_bytes(0);
        if magic != MAGIC {
            return Err(corrupted(format!(
                "invalid magic bytes: expected {MAGIC:?}, found {magic:?}"
            ))
            .into());
        }

        let version = series.read_u32(OFF_VERSION);
        if version != VERSION {
            return Err(corrupted(format!(
                "unsupported version: expected {VERSION}, found {version}"
            ))
            .into());
        }

        series.slot_count = series.read_u32(OFF_SLOT_COUNT);
        series.step = series.read_u64(OFF_STEP);
        if series.slot_count == 0 || series.step == 0 {
            return Err(corrupted("zero slot count or step".to_string()).into());
        }

        let expected = file_size(series.slot_count);
        if series.mmap.len() != expected {
            return Err(corrupted(format!(
                "file size mismatch: {} bytes, expected {expected}",
                series.mmap.len()
            ))
            .into());
        }

        if series.write_cursor() >= series.slot_count {
            return Err(corrupted(format!(
                "write cursor {} out of range",
                series.write_cursor()
            ))
            .into());
        }

        Ok(series)
    }

    /// Writes the header and fills the value column with NaN.
    ///
    /// The timestamp column is already zero from `set_len`.
    fn initialize(&mut self, data_source: &str) {
        self.mmap[..4].copy_from_slice(&MAGIC);
        self.write_bytes(OFF_VERSION, VERSION.to_le_bytes());
        self.write_bytes(OFF_STEP, self.step.to_le_bytes());
        self.write_bytes(OFF_SLOT_COUNT, self.slot_count.to_le_bytes());
        self.write_bytes(OFF_CURSOR, 0u32.to_le_bytes());
        self.write_bytes(OFF_LAST_UPDATE, 0i64.to_le_bytes());

        let mut name = [0u8; DATA_SOURCE_FIELD];
        let bytes = data_source.as_bytes();
        name[..bytes.len()].copy_from_slice(bytes);
        self.write_bytes(OFF_DATA_SOURCE, name);

        let nan = f64::NAN.to_le_bytes();
        for slot in 0..self.slot_count {
            self.write_bytes(self.value_offset(slot), nan);
        }
    }

    /// Stores `value` at `timestamp` (unix seconds).
    ///
    /// NaN is accepted and records an unknown sample.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::InvalidTimestamp`] for a non-positive timestamp,
    /// [`RecordError::NotMonotonic`] if `timestamp` is not newer than the last
    /// update, and [`RecordError::InvalidValue`] for an infinite value.
    pub fn update(&mut self, timestamp: i64, value: f64) -> Result<()> {
        if timestamp <= 0 {
            return Err(RecordError::InvalidTimestamp { timestamp }.into());
        }

        let last_update = self.last_update();
        if timestamp <= last_update {
            return Err(RecordError::NotMonotonic {
                timestamp,
                last_update,
            }
            .into());
        }

        if value.is_infinite() {
            return Err(RecordError::InvalidValue {
                value,
                reason: "infinite values are not allowed".to_string(),
            }
            .into());
        }

        let slot = self.compute_slot(timestamp);
        self.write_bytes(self.timestamp_offset(slot), timestamp.to_le_bytes());
        self.write_bytes(self.value_offset(slot), value.to_le_bytes());
        self.write_bytes(OFF_CURSOR, slot.to_le_bytes());
        self.write_bytes(OFF_LAST_UPDATE, timestamp.to_le_bytes());

        Ok(())
    }

    /// Returns stored samples with `start <= timestamp < end`, oldest first.
    ///
    /// Slots holding data older than one retention period before the last
    /// update are stale ring contents and are skipped, as are unknown values.
    pub fn fetch(&self, start: i64, end: i64) -> Vec<(i64, f64)> {
        let horizon = self.last_update().saturating_sub(self.retention_secs());
        let mut samples: Vec<(i64, f64)> = (0..self.slot_count)
            .filter_map(|slot| {
                let ts = self.read_i64(self.timestamp_offset(slot));
                if ts == 0 || ts <= horizon || ts < start || ts >= end {
                    return None;
                }
                let value = self.read_f64(self.value_offset(slot));
                (!value.is_nan()).then_some((ts, value))
            })
            .collect();
        samples.sort_unstable_by_key(|&(ts, _)| ts);
        samples
    }

    /// Returns the newest stored sample, if any.
    pub fn last_sample(&self) -> Option<(i64, f64)> {
        if self.last_update() == 0 {
            return None;
        }
        let slot = self.write_cursor();
        Some((
            self.read_i64(self.timestamp_offset(slot)),
            self.read_f64(self.value_offset(slot)),
        ))
    }

    /// Flushes outstanding writes to disk.
    ///
    /// # Errors
    ///
    /// Returns [`SeriesIoError::SyncFailed`] if the flush fails.
    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().map_err(|source| {
            SeriesIoError::SyncFailed {
                path: self.path.clone(),
                source,
            }
            .into()
        })
    }

    /// Returns the template this file was created with.
    pub fn template(&self) -> SeriesTemplate {
        SeriesTemplate {
            data_source: self.data_source(),
            step: Duration::from_secs(self.step),
            retention: Duration::from_secs(self.retention_span()),
        }
    }

    /// Returns the stored data source name.
    pub fn data_source(&self) -> String {
        let field: [u8; DATA_SOURCE_FIELD] = self.read_bytes(OFF_DATA_SOURCE);
        let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        String::from_utf8_lossy(&field[..len]).into_owned()
    }

    /// Returns the number of slots in the ring.
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Returns the step in seconds.
    pub fn step_secs(&self) -> u64 {
        self.step
    }

    /// Returns the timestamp of the newest update, or 0 if never updated.
    pub fn last_update(&self) -> i64 {
        self.read_i64(OFF_LAST_UPDATE)
    }

    /// Returns the slot holding the newest sample.
    pub fn write_cursor(&self) -> u32 {
        self.read_u32(OFF_CURSOR)
    }

    /// Returns the path to this file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // ts > 0; result < slot_count (u32)
    fn compute_slot(&self, timestamp: i64) -> u32 {
        ((timestamp as u64 / self.step) % u64::from(self.slot_count)) as u32
    }

    /// Seconds covered by the whole ring.
    fn retention_span(&self) -> u64 {
        self.step.saturating_mul(u64::from(self.slot_count))
    }

    fn retention_secs(&self) -> i64 {
        i64::try_from(self.retention_span()).unwrap_or(i64::MAX)
    }

    fn timestamp_offset(&self, slot: u32) -> usize {
        HEADER_SIZE + slot as usize * CELL_SIZE
    }

    fn value_offset(&self, slot: u32) -> usize {
        HEADER_SIZE + (self.slot_count as usize + slot as usize) * CELL_SIZE
    }

    fn read_bytes<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut buf = [0u8; N];
        buf.copy_from_slice(&self.mmap[offset..offset + N]);
        buf
    }

    fn write_bytes<const N: usize>(&mut self, offset: usize, bytes: [u8; N]) {
        self.mmap[offset..offset + N].copy_from_slice(&bytes);
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.read_bytes(offset))
    }

    fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.read_bytes(offset))
    }

    fn read_i64(&self, offset: usize) -> i64 {
        i64::from_le_bytes(self.read_bytes(offset))
    }

    fn read_f64(&self, offset: usize) -> f64 {
        f64::from_le_bytes(self.read_bytes(offset))
    }
}
