//! Error types for gwether.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The main error type for all gwether operations.
///
/// Per-message failures ([`DecodeError`], [`RecordError`]) are logged and the
/// message dropped by the dispatcher. Startup failures ([`StoreError`],
/// [`TemplateError`], and with the `mqtt` feature `TransportError`) abort the
/// process before any message is handled.
#[derive(Error, Debug)]
pub enum GwetherError {
    /// The storage directory could not be prepared.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The payload could not be decoded into an event.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A series file rejected an update.
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// A record template is invalid or does not match an existing file.
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// Error during series file I/O.
    #[error("series I/O error: {0}")]
    SeriesIo(#[from] SeriesIoError),

    /// Error talking to the MQTT broker.
    #[cfg(feature = "mqtt")]
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors that can occur when preparing the storage directory.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The storage directory could not be created or accessed.
    #[error("failed to access storage directory '{}': {source}", path.display())]
    DirectoryAccess {
        /// The path that could not be accessed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configured file extension cannot be used in a file name.
    #[error("invalid series file extension '{extension}'")]
    InvalidExtension {
        /// The rejected extension.
        extension: String,
    },
}

/// A message dropped by the dispatcher.
///
/// The message is logged and not retried; at QoS 0 this is data loss.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The series for the reading could not be opened or created.
    #[error("cannot open series '{}': {source}", locator.display())]
    Open {
        /// Where the series lives.
        locator: PathBuf,
        /// Why opening failed.
        #[source]
        source: Box<GwetherError>,
    },

    /// The series rejected the update.
    #[error("cannot update series '{}': {source}", locator.display())]
    Write {
        /// Where the series lives.
        locator: PathBuf,
        /// Why the write failed.
        #[source]
        source: Box<GwetherError>,
    },
}

/// Errors produced while decoding an inbound payload.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The payload is not well-formed JSON or a field has the wrong type.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The `time` field does not follow the `YYYY-MM-DD HH:MM:SS` layout.
    #[error(transparent)]
    Timestamp(#[from] TimestampFormatError),
}

/// A reading time that could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid reading time '{value}': {reason}")]
pub struct TimestampFormatError {
    /// The raw text of the `time` field.
    pub value: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Errors that can occur when writing a sample to a series file.
#[derive(Error, Debug)]
pub enum RecordError {
    /// The timestamp is zero or negative.
    #[error("timestamp {timestamp} is outside valid range")]
    InvalidTimestamp {
        /// The invalid timestamp, in unix seconds.
        timestamp: i64,
    },

    /// The timestamp is not newer than the last update of the series.
    #[error("illegal update at {timestamp}: last update was {last_update} (minimum one second step)")]
    NotMonotonic {
        /// The rejected timestamp, in unix seconds.
        timestamp: i64,
        /// The newest timestamp already stored.
        last_update: i64,
    },

    /// The value is invalid (e.g., infinite).
    #[error("invalid value: {value} ({reason})")]
    InvalidValue {
        /// The invalid value.
        value: f64,
        /// Why the value is invalid.
        reason: String,
    },
}

/// Errors that can occur while validating a record template.
#[derive(Error, Debug)]
pub enum TemplateError {
    /// The data source name is empty, too long or has forbidden characters.
    #[error("invalid data source name '{name}': {reason}")]
    InvalidDataSource {
        /// The rejected name.
        name: String,
        /// Why the name is invalid.
        reason: String,
    },

    /// Step or retention are unusable.
    #[error("invalid template timing: {reason}")]
    InvalidTiming {
        /// Description of what is wrong.
        reason: String,
    },

    /// Retention divided by step gives too many slots.
    #[error("template would have {slot_count} slots (max {max_slots}): retention {retention:?} / step {step:?}")]
    TooManySlots {
        /// The computed slot count.
        slot_count: u64,
        /// The maximum allowed slots.
        max_slots: u64,
        /// The configured retention.
        retention: Duration,
        /// The configured step.
        step: Duration,
    },

    /// An existing series file was created with a different data source.
    #[error("series '{}' stores '{found}', expected '{expected}'", path.display())]
    Mismatch {
        /// The series file path.
        path: PathBuf,
        /// Data source configured by the caller.
        expected: String,
        /// Data source found in the file header.
        found: String,
    },
}

/// Errors that can occur during series file I/O.
#[derive(Error, Debug)]
pub enum SeriesIoError {
    /// Failed to create or size a new series file.
    #[error("failed to create series '{}': {source}", path.display())]
    CreateFailed {
        /// The series file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to open or map an existing series file.
    #[error("failed to open series '{}': {source}", path.display())]
    OpenFailed {
        /// The series file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to flush the mapping to disk.
    #[error("failed to sync series '{}' to disk: {source}", path.display())]
    SyncFailed {
        /// The series file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not a series file or its layout is inconsistent.
    #[error("series '{}' is corrupted: {reason}", path.display())]
    Corrupted {
        /// The series file path.
        path: PathBuf,
        /// Description of the corruption.
        reason: String,
    },
}

/// Errors that can occur while connecting to or subscribing on the broker.
#[cfg(feature = "mqtt")]
#[derive(Error, Debug)]
pub enum TransportError {
    /// The broker address could not be parsed.
    #[error("invalid broker address '{address}': {reason}")]
    InvalidBroker {
        /// The rejected address.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The connection was refused or failed before acknowledgement.
    #[error("failed to connect to MQTT broker {broker}: {reason}")]
    Connect {
        /// The broker address.
        broker: String,
        /// Description of the failure.
        reason: String,
    },

    /// The broker rejected or never acknowledged the subscription.
    #[error("failed to subscribe to '{topic}': {reason}")]
    Subscribe {
        /// The topic filter.
        topic: String,
        /// Description of the failure.
        reason: String,
    },

    /// The client request queue is closed.
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// A network or delivery thread could not be spawned.
    #[error("failed to spawn {name} thread: {source}")]
    Thread {
        /// Which thread.
        name: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Type alias for `Result<T, GwetherError>`.
pub type Result<T> = std::result::Result<T, GwetherError>;
