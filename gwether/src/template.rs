//! Record templates for series files.
//!
//! A [`SeriesTemplate`] fixes the layout of a series file when it is first
//! created: the name of the single data source it stores, the sample step,
//! and how long samples are retained. Reopening an existing file checks the
//! data source against the template but keeps the file's own step and size.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TemplateError};

/// Maximum number of slots allowed in a single series file.
///
/// Each slot costs 16 bytes (timestamp + value), so this caps a file at
/// roughly 160 MB.
const MAX_SLOTS: u64 = 10_000_000;

/// Maximum length of a data source name, in bytes.
pub const MAX_DATA_SOURCE_LEN: usize = 19;

/// Data source name used for temperature series.
pub const DEFAULT_DATA_SOURCE: &str = "temp_C";

/// Configuration applied to every newly created series file.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use gwether::template::SeriesTemplate;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// // One sample per minute for a day
/// let template = SeriesTemplate::new(
///     "temp_C",
///     Duration::from_secs(60),
///     Duration::from_secs(86400),
/// )?;
/// assert_eq!(template.slot_count(), 1440);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesTemplate {
    /// Name of the stored data source (e.g. `temp_C`).
    pub data_source: String,
    /// Time covered by one slot.
    #[serde(with = "duration_serde")]
    pub step: Duration,
    /// How far back samples are kept before slots are reused.
    #[serde(with = "duration_serde")]
    pub retention: Duration,
}

impl SeriesTemplate {
    /// Creates and validates a template.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] if the configuration is invalid.
    pub fn new(data_source: &str, step: Duration, retention: Duration) -> Result<Self> {
        let template = Self {
            data_source: data_source.to_string(),
            step,
            retention,
        };
        template.validate()?;
        Ok(template)
    }

    /// Validates this template.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] if validation fails.
    pub fn validate(&self) -> Result<()> {
        let name = &self.data_source;
        if name.is_empty() || name.len() > MAX_DATA_SOURCE_LEN {
            return Err(TemplateError::InvalidDataSource {
                name: name.clone(),
                reason: format!("length must be between 1 and {MAX_DATA_SOURCE_LEN} bytes"),
            }
            .into());
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(TemplateError::InvalidDataSource {
                name: name.clone(),
                reason: "only ASCII letters, digits and '_' are allowed".to_string(),
            }
            .into());
        }

        if self.step.as_secs() == 0 || self.step.subsec_nanos() != 0 {
            return Err(TemplateError::InvalidTiming {
                reason: format!("step ({:?}) must be a whole number of seconds", self.step),
            }
            .into());
        }

        if self.retention < self.step {
            return Err(TemplateError::InvalidTiming {
                reason: format!(
                    "retention ({:?}) must be >= step ({:?})",
                    self.retention, self.step
                ),
            }
            .into());
        }

        let slot_count = self.slot_count();
        if slot_count > MAX_SLOTS {
            return Err(TemplateError::TooManySlots {
                slot_count,
                max_slots: MAX_SLOTS,
                retention: self.retention,
                step: self.step,
            }
            .into());
        }

        Ok(())
    }

    /// Number of slots in the round-robin file: `retention / step`.
    ///
    /// Returns 0 for a zero step.
    pub fn slot_count(&self) -> u64 {
        let step = self.step.as_secs();
        if step == 0 {
            return 0;
        }
        self.retention.as_secs() / step
    }
}

impl Default for SeriesTemplate {
    /// `temp_C`, one-minute step, seven days of retention.
    fn default() -> Self {
        Self {
            data_source: DEFAULT_DATA_SOURCE.to_string(),
            step: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 86400),
        }
    }
}

/// Serde helper for `Duration` as whole seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GwetherError;

    #[test]
    fn test_default_is_valid() {
        let template = SeriesTemplate::default();
        assert!(template.validate().is_ok());
        assert_eq!(template.data_source, "temp_C");
        assert_eq!(template.slot_count(), 10080);
    }

    #[test]
    fn test_rejects_bad_data_source() {
        for name in ["", "temp C", "temperature_celsius_x", "t-c"] {
            let result = SeriesTemplate::new(name, Duration::from_secs(60), Duration::from_secs(3600));
            assert!(
                matches!(
                    result,
                    Err(GwetherError::Template(TemplateError::InvalidDataSource { .. }))
                ),
                "accepted {name:?}"
            );
        }
    }

    #[test]
    fn test_rejects_bad_timing() {
        let zero_step = SeriesTemplate::new("temp_C", Duration::ZERO, Duration::from_secs(60));
        assert!(zero_step.is_err());

        let fractional = SeriesTemplate::new("temp_C", Duration::from_millis(1500), Duration::from_secs(60));
        assert!(fractional.is_err());

        let short = SeriesTemplate::new("temp_C", Duration::from_secs(60), Duration::from_secs(30));
        assert!(short.is_err());
    }

    #[test]
    fn test_rejects_too_many_slots() {
        let result = SeriesTemplate::new("temp_C", Duration::from_secs(1), Duration::from_secs(MAX_SLOTS + 1));
        assert!(matches!(
            result,
            Err(GwetherError::Template(TemplateError::TooManySlots { .. }))
        ));
    }

    #[test]
    fn test_serde_as_seconds() {
        let template = SeriesTemplate::new("temp_C", Duration::from_secs(300), Duration::from_secs(86400)).unwrap();
        let json = serde_json::to_value(&template).unwrap();
        assert_eq!(json["step"], 300);
        assert_eq!(json["retention"], 86400);

        let back: SeriesTemplate = serde_json::from_value(json).unwrap();
        assert_eq!(back, template);
    }
}
