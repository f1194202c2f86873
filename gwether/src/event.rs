//! Decoding of inbound sensor readings.
//!
//! Payloads are JSON objects as emitted by `rtl_433`:
//!
//! ```json
//! {"time": "2024-01-02 03:04:05", "model": "Acurite-Tower", "id": 1234,
//!  "channel": 2, "temperature_C": 21.5}
//! ```
//!
//! Unknown fields are ignored; missing and `null` fields take their zero
//! value. The `time` field is local wall-clock time; `null` (bare or quoted)
//! means the reading carries no timestamp.
//!
//! Local time is resolved through chrono's [`Local`], which follows `TZ` and
//! the system zone database. The zone is not frozen at startup: changing `TZ`
//! or `/etc/localtime` while running affects readings decoded afterwards.

use std::fmt;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::Deserialize;

use crate::error::{DecodeError, TimestampFormatError};
use crate::sanitize::SeriesKey;

/// Layout of the `time` field.
pub const TIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

/// Absolute time of a reading, or the zero value when none was reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadingTime(Option<DateTime<Local>>);

impl ReadingTime {
    /// The "no timestamp" value.
    pub const fn zero() -> Self {
        Self(None)
    }

    /// Parses the textual form of a `time` field.
    ///
    /// Surrounding double quotes are trimmed. `null` maps to [`zero`](Self::zero);
    /// anything else must match [`TIME_LAYOUT`] and name an existing local time.
    /// When a local time occurs twice (DST fall-back) the earlier instant wins.
    ///
    /// # Errors
    ///
    /// Returns [`TimestampFormatError`] if the text does not match the layout
    /// or falls into a DST gap.
    pub fn parse(text: &str) -> Result<Self, TimestampFormatError> {
        let trimmed = text.trim_matches('"');
        if trimmed == "null" {
            return Ok(Self::zero());
        }

        check_layout(trimmed).map_err(|reason| TimestampFormatError {
            value: text.to_string(),
            reason: reason.to_string(),
        })?;

        let naive = NaiveDateTime::parse_from_str(trimmed, TIME_LAYOUT).map_err(|e| {
            TimestampFormatError {
                value: text.to_string(),
                reason: e.to_string(),
            }
        })?;

        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|t| Self(Some(t)))
            .ok_or_else(|| TimestampFormatError {
                value: text.to_string(),
                reason: "local time does not exist in this time zone".to_string(),
            })
    }

    /// Returns true for the "no timestamp" value.
    pub fn is_zero(&self) -> bool {
        self.0.is_none()
    }

    /// Returns the instant, if any.
    pub fn instant(&self) -> Option<DateTime<Local>> {
        self.0
    }

    /// Returns unix seconds, or 0 for the zero value.
    ///
    /// Series files reject non-positive timestamps, so a reading without a
    /// time is dropped at write time rather than at decode time.
    pub fn unix_seconds(&self) -> i64 {
        self.0.map_or(0, |t| t.timestamp())
    }
}

/// Checks the fixed-width `YYYY-MM-DD HH:MM:SS` shape.
///
/// chrono's parser tolerates single-digit fields, extra whitespace, a signed
/// year and leap seconds; none of those are valid reading times.
fn check_layout(text: &str) -> Result<(), &'static str> {
    let bytes = text.as_bytes();
    if bytes.len() != 19 {
        return Err("expected YYYY-MM-DD HH:MM:SS");
    }
    let shape_ok = bytes.iter().enumerate().all(|(i, &b)| match i {
        4 | 7 => b == b'-',
        10 => b == b' ',
        13 | 16 => b == b':',
        _ => b.is_ascii_digit(),
    });
    if !shape_ok {
        return Err("expected YYYY-MM-DD HH:MM:SS");
    }
    if bytes[17] > b'5' {
        return Err("second out of range");
    }
    Ok(())
}

impl fmt::Display for ReadingTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(t) => write!(f, "{}", t.format(TIME_LAYOUT)),
            None => f.write_str("null"),
        }
    }
}

/// Wire shape of a reading before the time field is interpreted.
#[derive(Deserialize, Default)]
#[serde(default)]
struct RawEvent {
    time: Option<String>,
    model: Option<String>,
    id: Option<i64>,
    channel: Option<i64>,
    #[serde(rename = "temperature_C")]
    temperature_c: Option<f64>,
}

/// One decoded sensor reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// When the reading was taken.
    pub time: ReadingTime,
    /// Sensor model as reported upstream.
    pub model: String,
    /// Sensor instance identifier.
    pub id: i64,
    /// Sub-channel of the sensor.
    pub channel: i64,
    /// Temperature in degrees Celsius.
    pub temperature_c: f64,
}

impl Event {
    /// Decodes a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Json`] for malformed JSON or mistyped fields, and
    /// [`DecodeError::Timestamp`] when the `time` field cannot be parsed. A bad
    /// time fails the whole event.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawEvent = serde_json::from_slice(payload)?;
        let time = match raw.time.as_deref() {
            Some(text) => ReadingTime::parse(text)?,
            None => ReadingTime::zero(),
        };

        Ok(Self {
            time,
            model: raw.model.unwrap_or_default(),
            id: raw.id.unwrap_or_default(),
            channel: raw.channel.unwrap_or_default(),
            temperature_c: raw.temperature_c.unwrap_or_default(),
        })
    }

    /// Returns the series this reading belongs to.
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(&self.model, self.id, self.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(text: &str) -> DateTime<Local> {
        let naive = NaiveDateTime::parse_from_str(text, TIME_LAYOUT).unwrap();
        Local.from_local_datetime(&naive).earliest().unwrap()
    }

    #[test]
    fn test_decode_full_payload() {
        let payload = br#"{"time":"2024-01-02 03:04:05","model":"Acurite-Tower","id":1234,"channel":2,"temperature_C":21.5}"#;
        let event = Event::decode(payload).unwrap();

        assert_eq!(event.time.instant(), Some(local("2024-01-02 03:04:05")));
        assert_eq!(event.model, "Acurite-Tower");
        assert_eq!(event.id, 1234);
        assert_eq!(event.channel, 2);
        assert_eq!(event.temperature_c, 21.5);
        assert_eq!(event.series_key().as_str(), "acuritetower-1234-2");
    }

    #[test]
    fn test_quoted_null_time_is_zero() {
        let event = Event::decode(br#"{"time":"null","model":"m","id":1}"#).unwrap();
        assert!(event.time.is_zero());
        assert_eq!(event.time.unix_seconds(), 0);
        assert_eq!(event.time.to_string(), "null");
    }

    #[test]
    fn test_bare_null_and_missing_time_are_zero() {
        assert!(Event::decode(br#"{"time":null}"#).unwrap().time.is_zero());
        assert!(Event::decode(br#"{"model":"m"}"#).unwrap().time.is_zero());
    }

    #[test]
    fn test_missing_fields_default_to_zero() {
        let event = Event::decode(br#"{"time":"2024-06-01 12:00:00","model":"Nexus-TH","id":7}"#)
            .unwrap();
        assert_eq!(event.channel, 0);
        assert_eq!(event.temperature_c, 0.0);
    }

    #[test]
    fn test_null_fields_default_to_zero() {
        let payload = br#"{"time":"2024-06-01 12:00:00","model":null,"id":null,"channel":null,"temperature_C":null}"#;
        let event = Event::decode(payload).unwrap();
        assert_eq!(event.model, "");
        assert_eq!(event.id, 0);
        assert_eq!(event.channel, 0);
        assert_eq!(event.temperature_c, 0.0);
        assert_eq!(event.series_key().as_str(), "-0-0");
    }

    #[test]
    fn test_parse_accepts_last_second_of_minute() {
        let t = ReadingTime::parse("2024-01-02 03:04:59").unwrap();
        assert_eq!(t.to_string(), "2024-01-02 03:04:59");
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let payload = br#"{"model":"m","id":1,"humidity":55,"battery_ok":1,"mic":"CRC"}"#;
        assert!(Event::decode(payload).is_ok());
    }

    #[test]
    fn test_malformed_json() {
        let err = Event::decode(br#"{"model":"m","id":1"#).unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn test_wrong_field_type() {
        let err = Event::decode(br#"{"model":"m","id":"not-a-number"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn test_bad_time_fails_event() {
        let err = Event::decode(br#"{"time":"2024-01-02T03:04:05Z","model":"m","id":1}"#)
            .unwrap_err();
        match err {
            DecodeError::Timestamp(e) => assert_eq!(e.value, "2024-01-02T03:04:05Z"),
            other => panic!("expected timestamp error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_trims_quotes() {
        let t = ReadingTime::parse("\"2024-01-02 03:04:05\"").unwrap();
        assert_eq!(t.instant(), Some(local("2024-01-02 03:04:05")));
        assert!(ReadingTime::parse("\"null\"").unwrap().is_zero());
    }

    #[test]
    fn test_display_round_trips_layout() {
        let t = ReadingTime::parse("2023-11-05 23:59:59").unwrap();
        assert_eq!(t.to_string(), "2023-11-05 23:59:59");
    }

    #[test]
    fn test_parse_rejects_partial_layouts() {
        for text in [
            "2024-01-02",
            "03:04:05",
            "2024-13-01 00:00:00",
            "",
            "yesterday",
            "2024-1-2 3:4:5",
            "2024-01-0203:04:05",
            "2024-01-02   03:04:05",
            "+2024-01-02 03:04:05",
            "2024-01-02 03:04:60",
            "2024-01-02T03:04:05",
            " 2024-01-02 03:04:05",
        ] {
            assert!(ReadingTime::parse(text).is_err(), "accepted {text:?}");
        }
    }
}
