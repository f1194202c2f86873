//! # gwether
//!
//! Sensor-reading ingestion into per-sensor round-robin series files.
//!
//! gwether subscribes to the JSON events `rtl_433` publishes over MQTT, one
//! per received radio packet, and records each temperature reading in a
//! fixed-size series file named after the sensor that sent it. Files are
//! created on first sight of a sensor and kept open for the life of the
//! process.
//!
//! ## Key Properties
//!
//! - One series file per `(model, id, channel)`, with a filesystem-safe name
//! - Each series is opened or created exactly once, even under concurrent delivery
//! - Bounded storage: file size is fixed by step and retention, not data volume
//! - A bad message is logged and dropped; the stream never stops
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gwether::{Dispatcher, MessageHandler, SeriesStore, SeriesTemplate};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // 60s resolution kept for a week, files named <key>.rrd
//! let store = SeriesStore::open("./rrd", "rrd", SeriesTemplate::default())?;
//! let dispatcher = Dispatcher::new(store);
//!
//! // Normally called by the MQTT transport for each delivered message
//! dispatcher.handle(br#"{"time":"2024-01-02 03:04:05","model":"Nexus-TH","id":7,"channel":1,"temperature_C":19.5}"#);
//!
//! // ./rrd/nexusth-7-1.rrd now holds one sample
//! dispatcher.flush_all();
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`sanitize`] — Series key derivation and file naming
//! - [`event`] — Payload decoding and reading times
//! - [`template`] — Series file layout parameters
//! - [`series_file`] — Memory-mapped round-robin file format
//! - [`store`] — Storage directory and series handles
//! - [`cache`] — Open handle cache
//! - [`dispatch`] — Per-message ingestion
//! - [`delivery`] — Delivery worker pool
//! - `transport` — MQTT connection and lifecycle (feature `mqtt`)
//! - [`error`] — Error types

pub mod cache;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod sanitize;
pub mod series_file;
pub mod store;
pub mod template;
#[cfg(feature = "mqtt")]
pub mod transport;

// Re-export primary API types at crate root for convenience.
pub use cache::HandleCache;
pub use dispatch::{Dispatcher, IngestStats, MessageHandler};
pub use error::{GwetherError, IngestError, Result};
pub use event::{Event, ReadingTime};
pub use sanitize::{SeriesKey, sanitize};
pub use store::{SeriesBackend, SeriesHandle, SeriesStore, SeriesWriter};
pub use template::SeriesTemplate;
