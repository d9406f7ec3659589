//! Audit Configuration
//!
//! The configuration is a JSON document persisted next to the tool. Time
//! windows are expressed as Go-style duration strings (`"48h"`, `"20m"`,
//! `"1h30m"`) because the documents are written and edited by operators.
//!
//! Invariant enforced at load: `check_oldest > check_youngest`, both
//! positive. A violation is a fatal startup error.

use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;

/// Credentials and location of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsConfig {
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Everything the auditor needs: the sampling seed, the sample size, the
/// modification-time window, the audit cadence, and both buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    pub random_seed: i64,
    pub check_count: usize,
    /// Keys modified more recently than `now - check_youngest` are skipped;
    /// replication may not have caught up with them yet.
    #[serde(with = "duration_str")]
    pub check_youngest: Duration,
    /// Keys modified before `now - check_oldest` are skipped.
    #[serde(with = "duration_str")]
    pub check_oldest: Duration,
    /// Interval between audit iterations.
    #[serde(with = "duration_str")]
    pub check_frequency: Duration,
    pub source: AwsConfig,
    pub destination: AwsConfig,
}

/// Error from loading or validating a configuration document.
#[derive(Debug)]
pub enum ConfigError {
    /// The document could not be read or decoded.
    Parse(serde_json::Error),
    /// `check_oldest` does not exceed `check_youngest`.
    Window { oldest: Duration, youngest: Duration },
    /// A duration field is zero.
    NonPositive(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(e) => write!(f, "can't decode config: {}", e),
            ConfigError::Window { oldest, youngest } => write!(
                f,
                "cannot look for events where oldest ({:?}) is less or equal to youngest ({:?})",
                oldest, youngest
            ),
            ConfigError::NonPositive(field) => {
                write!(f, "config field {:?} must be a positive duration", field)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl AuditConfig {
    /// Decode a configuration document and validate it.
    pub fn load(reader: impl io::Read) -> Result<AuditConfig, ConfigError> {
        let cfg: AuditConfig = serde_json::from_reader(reader)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_youngest.is_zero() {
            return Err(ConfigError::NonPositive("check_youngest"));
        }
        if self.check_oldest.is_zero() {
            return Err(ConfigError::NonPositive("check_oldest"));
        }
        if self.check_frequency.is_zero() {
            return Err(ConfigError::NonPositive("check_frequency"));
        }
        if self.check_oldest <= self.check_youngest {
            return Err(ConfigError::Window {
                oldest: self.check_oldest,
                youngest: self.check_youngest,
            });
        }
        Ok(())
    }

    /// A filled-in starting point for operators, written by `makeconfig`.
    pub fn sample() -> AuditConfig {
        let placeholder = AwsConfig {
            bucket: "my_bucket".to_string(),
            region: "us-east-1".to_string(),
            access_key: "something".to_string(),
            secret_key: "somethingelse".to_string(),
        };
        AuditConfig {
            random_seed: 42,
            check_count: 30,
            check_youngest: Duration::from_secs(48 * 3600),
            check_oldest: Duration::from_secs(14 * 24 * 3600),
            check_frequency: Duration::from_secs(20 * 60),
            source: placeholder.clone(),
            destination: placeholder,
        }
    }

    /// Render the document the way it is persisted on disk.
    pub fn to_document(&self) -> Result<String, serde_json::Error> {
        to_indented_json(self)
    }
}

/// Serialize with the three-space indentation used by all on-disk
/// documents (config and model).
pub(crate) fn to_indented_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    use serde::ser::Error;

    let mut buf = Vec::new();
    let fmt = serde_json::ser::PrettyFormatter::with_indent(b"   ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, fmt);
    value.serialize(&mut ser)?;
    String::from_utf8(buf).map_err(serde_json::Error::custom)
}

/// Serde helper: `Duration` as a Go-style duration string.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        parse_duration(&text).map_err(serde::de::Error::custom)
    }

    /// Parse a sequence of `<decimal><unit>` components, e.g. `"1h30m"`.
    /// Supported units: `ns`, `us`, `ms`, `s`, `m`, `h`.
    pub fn parse_duration(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty duration".to_string());
        }
        if text == "0" {
            return Ok(Duration::ZERO);
        }

        let mut total_secs = 0f64;
        let mut rest = text;
        while !rest.is_empty() {
            let digits_end = rest
                .find(|c: char| !c.is_ascii_digit() && c != '.')
                .ok_or_else(|| format!("duration {:?} is missing a unit", text))?;
            if digits_end == 0 {
                return Err(format!("invalid duration {:?}", text));
            }
            let value: f64 = rest[..digits_end]
                .parse()
                .map_err(|_| format!("invalid number in duration {:?}", text))?;

            let after_digits = &rest[digits_end..];
            let unit_len = after_digits
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(after_digits.len());
            let unit_secs = match &after_digits[..unit_len] {
                "ns" => 1e-9,
                "us" => 1e-6,
                "ms" => 1e-3,
                "s" => 1.0,
                "m" => 60.0,
                "h" => 3600.0,
                unit => return Err(format!("unknown unit {:?} in duration {:?}", unit, text)),
            };
            total_secs += value * unit_secs;
            rest = &after_digits[unit_len..];
        }
        Ok(Duration::from_secs_f64(total_secs))
    }

    /// Inverse of `parse_duration` for the durations that appear in
    /// configs: largest units first, zero components omitted.
    pub fn format_duration(d: &Duration) -> String {
        if d.is_zero() {
            return "0s".to_string();
        }

        let secs = d.as_secs();
        let nanos = d.subsec_nanos();
        let parts = [
            (secs / 3600, "h"),
            (secs % 3600 / 60, "m"),
            (secs % 60, "s"),
            (u64::from(nanos / 1_000_000), "ms"),
            (u64::from(nanos % 1_000_000 / 1_000), "us"),
            (u64::from(nanos % 1_000), "ns"),
        ];

        let mut out = String::new();
        for (value, unit) in parts {
            if value != 0 {
                out.push_str(&value.to_string());
                out.push_str(unit);
            }
        }
        out
    }
}
