//! Per-message ingestion.
//!
//! The transport calls [`MessageHandler::handle`] once per delivered message,
//! possibly from several threads at once. [`Dispatcher`] decodes the payload,
//! derives the series key, fetches or creates the series handle through the
//! [`HandleCache`], and writes the reading. Any failure drops that one message
//! with a log line; the stream itself never stops.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::HandleCache;
use crate::error::IngestError;
use crate::event::Event;
use crate::sanitize::SeriesKey;
use crate::store::{SeriesBackend, SeriesWriter};

/// Receives raw message payloads from a transport.
pub trait MessageHandler: Send + Sync {
    /// Processes one payload. Must not panic on bad input.
    fn handle(&self, payload: &[u8]);
}

/// Snapshot of ingestion counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Payloads handed to the dispatcher.
    pub received: u64,
    /// Readings stored successfully.
    pub written: u64,
    /// Payloads dropped because they could not be decoded.
    pub decode_failures: u64,
    /// Readings dropped because the series could not be opened or updated.
    pub write_failures: u64,
    /// Series handles opened or created.
    pub series_opened: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    written: AtomicU64,
    decode_failures: AtomicU64,
    write_failures: AtomicU64,
    series_opened: AtomicU64,
}

/// Routes decoded readings to their series.
///
/// # Example
///
/// ```rust,no_run
/// use gwether::dispatch::{Dispatcher, MessageHandler};
/// use gwether::store::SeriesStore;
/// use gwether::template::SeriesTemplate;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = SeriesStore::open("./rrd", "rrd", SeriesTemplate::default())?;
/// let dispatcher = Dispatcher::new(store);
///
/// dispatcher.handle(br#"{"time":"2024-01-02 03:04:05","model":"Nexus-TH","id":7,"channel":1,"temperature_C":19.5}"#);
/// assert_eq!(dispatcher.stats().written, 1);
/// # Ok(())
/// # }
/// ```
pub struct Dispatcher<B: SeriesBackend> {
    backend: B,
    cache: HandleCache<B::Handle>,
    counters: Counters,
}

impl<B: SeriesBackend> Dispatcher<B> {
    /// Creates a dispatcher with an empty handle cache.
    pub fn new(backend: B) -> Self {
        Self::with_cache(backend, HandleCache::new())
    }

    /// Creates a dispatcher writing through `cache`.
    ///
    /// Handles already in the cache are reused as-is; the backend is only
    /// asked to open locators the cache does not hold.
    pub fn with_cache(backend: B, cache: HandleCache<B::Handle>) -> Self {
        Self {
            backend,
            cache,
            counters: Counters::default(),
        }
    }

    /// Decodes `payload` and writes the reading to its series.
    ///
    /// Returns the key of the series written to.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Decode`] for an undecodable payload (the cache
    /// is not touched), [`IngestError::Open`] if the series cannot be opened,
    /// and [`IngestError::Write`] if the series rejects the reading.
    pub fn dispatch(&self, payload: &[u8]) -> Result<SeriesKey, IngestError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let event = Event::decode(payload).inspect_err(|_| {
            self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
        })?;

        let key = event.series_key();
        let locator = self.backend.locator(&key);

        let handle = self
            .cache
            .get_or_create(&locator, |locator| {
                self.backend.open_or_create(locator).inspect(|_| {
                    self.counters.series_opened.fetch_add(1, Ordering::Relaxed);
                })
            })
            .map_err(|source| {
                self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                IngestError::Open {
                    locator: locator.clone(),
                    source: Box::new(source),
                }
            })?;

        tracing::debug!(
            locator = %locator.display(),
            temperature = event.temperature_c,
            time = %event.time,
            "updating series"
        );

        handle
            .update(event.time.unix_seconds(), event.temperature_c)
            .map_err(|source| {
                self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                IngestError::Write {
                    locator,
                    source: Box::new(source),
                }
            })?;

        self.counters.written.fetch_add(1, Ordering::Relaxed);
        Ok(key)
    }

    /// Returns a snapshot of the ingestion counters.
    pub fn stats(&self) -> IngestStats {
        IngestStats {
            received: self.counters.received.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
            series_opened: self.counters.series_opened.load(Ordering::Relaxed),
        }
    }

    /// Flushes every cached series. Returns the number of failures, each of
    /// which is logged.
    pub fn flush_all(&self) -> usize {
        let mut failures = 0;
        for (locator, handle) in self.cache.handles() {
            if let Err(e) = handle.flush() {
                tracing::warn!(locator = %locator.display(), "flush failed: {e}");
                failures += 1;
            }
        }
        failures
    }

    /// Returns the handle cache.
    pub fn cache(&self) -> &HandleCache<B::Handle> {
        &self.cache
    }

    /// Returns the storage backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: SeriesBackend> MessageHandler for Dispatcher<B> {
    fn handle(&self, payload: &[u8]) {
        tracing::debug!(payload = %String::from_utf8_lossy(payload), "received message");

        if let Err(e) = self.dispatch(payload) {
            tracing::warn!("dropping message: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GwetherError, RecordError, Result};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    /// In-memory series recording every update.
    #[derive(Debug, Default)]
    struct MemorySeries {
        updates: Mutex<Vec<(i64, f64)>>,
    }

    impl SeriesWriter for MemorySeries {
        fn update(&self, timestamp: i64, value: f64) -> Result<()> {
            if timestamp <= 0 {
                return Err(RecordError::InvalidTimestamp { timestamp }.into());
            }
            self.updates.lock().unwrap().push((timestamp, value));
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct MemoryBackend {
        opened: Mutex<Vec<PathBuf>>,
    }

    impl SeriesBackend for MemoryBackend {
        type Handle = MemorySeries;

        fn locator(&self, key: &SeriesKey) -> PathBuf {
            key.locator(Path::new("/mem"), "rrd")
        }

        fn open_or_create(&self, locator: &Path) -> Result<MemorySeries> {
            self.opened.lock().unwrap().push(locator.to_path_buf());
            Ok(MemorySeries::default())
        }
    }

    fn payload(model: &str, id: i64, channel: i64, time: &str, temp: f64) -> Vec<u8> {
        format!(
            r#"{{"time":"{time}","model":"{model}","id":{id},"channel":{channel},"temperature_C":{temp}}}"#
        )
        .into_bytes()
    }

    fn updates(dispatcher: &Dispatcher<MemoryBackend>, locator: &str) -> Vec<(i64, f64)> {
        dispatcher
            .cache()
            .get(Path::new(locator))
            .map(|h| h.updates.lock().unwrap().clone())
            .unwrap_or_default()
    }

    #[test]
    fn test_same_triple_resolves_to_same_handle() {
        let dispatcher = Dispatcher::new(MemoryBackend::default());

        dispatcher.dispatch(&payload("Nexus-TH", 7, 1, "2024-01-02 03:04:05", 19.5)).unwrap();
        let first = dispatcher.cache().get(Path::new("/mem/nexusth-7-1.rrd")).unwrap();

        dispatcher.dispatch(&payload("NEXUS-TH", 7, 1, "2024-01-02 03:05:05", 19.6)).unwrap();
        let second = dispatcher.cache().get(Path::new("/mem/nexusth-7-1.rrd")).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(dispatcher.backend().opened.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_payload_leaves_cache_untouched() {
        let dispatcher = Dispatcher::new(MemoryBackend::default());
        dispatcher.dispatch(&payload("a", 1, 0, "2024-01-02 03:04:05", 1.0)).unwrap();

        for bad in [
            &br#"{"model":"a","id":1"#[..],
            br#"{"model":"b","id":"not-a-number"}"#,
            br#"{"model":"b","id":2,"time":"02/01/2024"}"#,
            b"",
        ] {
            let err = dispatcher.dispatch(bad).unwrap_err();
            assert!(matches!(err, IngestError::Decode(_)));
        }

        assert_eq!(dispatcher.cache().len(), 1);
        assert_eq!(updates(&dispatcher, "/mem/a-1-0.rrd").len(), 1);

        // The stream continues
        dispatcher.dispatch(&payload("a", 1, 0, "2024-01-02 03:05:05", 2.0)).unwrap();
        assert_eq!(updates(&dispatcher, "/mem/a-1-0.rrd").len(), 2);

        let stats = dispatcher.stats();
        assert_eq!(stats.received, 6);
        assert_eq!(stats.decode_failures, 4);
        assert_eq!(stats.written, 2);
    }

    #[test]
    fn test_write_failure_is_reported() {
        let dispatcher = Dispatcher::new(MemoryBackend::default());

        let err = dispatcher.dispatch(&payload("a", 1, 0, "null", 1.0)).unwrap_err();
        match err {
            IngestError::Write { locator, source } => {
                assert_eq!(locator, PathBuf::from("/mem/a-1-0.rrd"));
                assert!(matches!(
                    *source,
                    GwetherError::Record(RecordError::InvalidTimestamp { timestamp: 0 })
                ));
            }
            other => panic!("expected write error, got {other:?}"),
        }
        assert_eq!(dispatcher.stats().write_failures, 1);
    }

    #[test]
    fn test_handle_never_panics_on_garbage() {
        let dispatcher = Dispatcher::new(MemoryBackend::default());
        dispatcher.handle(b"\xff\xfe not json");
        dispatcher.handle(b"[1,2,3]");
        dispatcher.handle(br#"{"time":"null"}"#);
        assert_eq!(dispatcher.stats().written, 0);
        assert_eq!(dispatcher.stats().received, 3);
    }

    #[test]
    fn test_with_cache_reuses_supplied_handles() {
        let cache = HandleCache::new();
        let locator = Path::new("/mem/a-1-0.rrd");
        let seeded = cache
            .get_or_create(locator, |_| Ok::<_, GwetherError>(MemorySeries::default()))
            .unwrap();

        let dispatcher = Dispatcher::with_cache(MemoryBackend::default(), cache);
        dispatcher.dispatch(&payload("a", 1, 0, "2024-01-02 03:04:05", 1.0)).unwrap();

        assert!(dispatcher.backend().opened.lock().unwrap().is_empty());
        assert_eq!(seeded.updates.lock().unwrap().len(), 1);
        assert_eq!(dispatcher.stats().series_opened, 0);
    }

    #[test]
    fn test_open_failure_not_cached() {
        #[derive(Debug)]
        struct FailingBackend;

        impl SeriesBackend for FailingBackend {
            type Handle = MemorySeries;

            fn locator(&self, key: &SeriesKey) -> PathBuf {
                key.locator(Path::new("/ro"), "rrd")
            }

            fn open_or_create(&self, locator: &Path) -> Result<MemorySeries> {
                Err(GwetherError::Store(crate::error::StoreError::DirectoryAccess {
                    path: locator.to_path_buf(),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                }))
            }
        }

        let dispatcher = Dispatcher::new(FailingBackend);
        let err = dispatcher.dispatch(&payload("a", 1, 0, "2024-01-02 03:04:05", 1.0)).unwrap_err();
        assert!(matches!(err, IngestError::Open { .. }));
        assert!(dispatcher.cache().is_empty());
        assert_eq!(dispatcher.stats().series_opened, 0);
    }
}
