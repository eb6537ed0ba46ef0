use std::fmt;

use thiserror::Error;

use super::KeyMode;

/// Errors that can occur while decoding an aggregation key string.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyDecodeError {
    #[error("key {key:?}: expected at least {expected} segments")]
    TooFewSegments { key: String, expected: usize },

    #[error("key {key:?}: invalid day segment {day:?}")]
    InvalidDay { key: String, day: String },

    #[error("key {key:?}: empty segment")]
    EmptySegment { key: String },
}

/// Namespace shared by every field of one routed record:
/// `sensor[:protocol]:day`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPrefix {
    pub sensor: String,
    pub protocol: Option<String>,
    pub day: String,
}

impl KeyPrefix {
    /// Full key for one field of this prefix.
    pub fn with_field(&self, field: &str) -> AggregationKey {
        AggregationKey {
            sensor: self.sensor.clone(),
            protocol: self.protocol.clone(),
            day: self.day.clone(),
            field: field.to_string(),
        }
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.protocol {
            Some(protocol) => write!(f, "{}:{}:{}", self.sensor, protocol, self.day),
            None => write!(f, "{}:{}", self.sensor, self.day),
        }
    }
}

/// Identifies one histogram series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregationKey {
    pub sensor: String,
    pub protocol: Option<String>,
    pub day: String,
    pub field: String,
}

impl AggregationKey {
    /// Colon-delimited wire form.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Decodes a wire key. Segments are taken from the right so that the
    /// sensor name is allowed to contain colons.
    pub fn decode(key: &str, mode: KeyMode) -> Result<Self, KeyDecodeError> {
        let expected = match mode {
            KeyMode::Plain => 3,
            KeyMode::Combined => 4,
        };

        let mut parts = key.rsplitn(expected, ':');
        let too_few = || KeyDecodeError::TooFewSegments {
            key: key.to_string(),
            expected,
        };

        let field = parts.next().ok_or_else(too_few)?;
        let day = parts.next().ok_or_else(too_few)?;
        let protocol = match mode {
            KeyMode::Plain => None,
            KeyMode::Combined => Some(parts.next().ok_or_else(too_few)?),
        };
        let sensor = parts.next().ok_or_else(too_few)?;

        if [sensor, day, field].iter().any(|s| s.is_empty()) || protocol == Some("") {
            return Err(KeyDecodeError::EmptySegment {
                key: key.to_string(),
            });
        }

        if !is_day(day) {
            return Err(KeyDecodeError::InvalidDay {
                key: key.to_string(),
                day: day.to_string(),
            });
        }

        Ok(Self {
            sensor: sensor.to_string(),
            protocol: protocol.map(str::to_string),
            day: day.to_string(),
            field: field.to_string(),
        })
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.protocol {
            Some(protocol) => write!(
                f,
                "{}:{}:{}:{}",
                self.sensor, protocol, self.day, self.field
            ),
            None => write!(f, "{}:{}:{}", self.sensor, self.day, self.field),
        }
    }
}

/// Returns true for an eight digit `YYYYMMDD` segment.
pub fn is_day(s: &str) -> bool {
    s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit())
}
