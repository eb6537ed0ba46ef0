//! Aggregation key routing.
//!
//! Every record is mapped to a [`KeyPrefix`] (`sensor:day`, or
//! `sensor:protocol:day` in combined mode) shared by all of its fields.

pub mod key;
pub mod protocols;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate};
use thiserror::Error;

use crate::field::catalog::{PROTOCOL, TIMESTAMP};
use crate::field::{FieldValue, PacketRecord};

pub use key::{AggregationKey, KeyDecodeError, KeyPrefix};
pub use protocols::ProtocolTable;

/// Keying mode of a store instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyMode {
    /// `sensor:day:field`
    Plain,
    /// `sensor:protocol:day:field`
    Combined,
}

impl KeyMode {
    pub fn from_flag(combined: bool) -> Self {
        if combined {
            Self::Combined
        } else {
            Self::Plain
        }
    }

    pub fn is_combined(self) -> bool {
        self == Self::Combined
    }

    /// Value persisted in the run parameters record.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "false",
            Self::Combined => "true",
        }
    }
}

impl fmt::Display for KeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Self::Combined),
            "false" | "0" => Ok(Self::Plain),
            other => Err(format!("invalid keying mode: {other}")),
        }
    }
}

/// Errors that can occur while routing a record.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouteError {
    #[error("record has no timestamp")]
    MissingTimestamp,

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("record has no protocol")]
    MissingProtocol,

    #[error("unknown protocol number: {0}")]
    UnknownProtocol(String),
}

/// Computes key prefixes. Immutable once built and shared by all workers.
#[derive(Debug, Clone)]
pub struct KeyRouter {
    mode: KeyMode,
    protocols: ProtocolTable,
}

impl KeyRouter {
    /// Creates a new router for the given keying mode.
    pub fn new(mode: KeyMode, protocols: ProtocolTable) -> Self {
        Self { mode, protocols }
    }

    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    /// Routes one record of `sensor`.
    pub fn route(&self, sensor: &str, record: &PacketRecord) -> Result<KeyPrefix, RouteError> {
        let timestamp = record.get(TIMESTAMP).ok_or(RouteError::MissingTimestamp)?;
        let day = day_of(timestamp)?;

        let protocol = match self.mode {
            KeyMode::Plain => None,
            KeyMode::Combined => {
                let value = record.get(PROTOCOL).ok_or(RouteError::MissingProtocol)?;
                let name = value
                    .as_int()
                    .and_then(|n| self.protocols.name(n))
                    .ok_or_else(|| RouteError::UnknownProtocol(value.to_string()))?;
                Some(name.to_string())
            }
        };

        Ok(KeyPrefix {
            sensor: sensor.to_string(),
            protocol,
            day,
        })
    }
}

/// Derives the UTC `YYYYMMDD` day of a timestamp.
///
/// Accepts epoch seconds (`1704067200.123`, as the dissector prints them),
/// `YYYY-MM-DD HH:MM:SS[.frac]` (annotated documents) and bare `YYYYMMDD`.
pub fn day_of(timestamp: &FieldValue) -> Result<String, RouteError> {
    let invalid = || RouteError::InvalidTimestamp(timestamp.to_string());

    let text = match timestamp {
        FieldValue::Int(secs) => return epoch_day(*secs).ok_or_else(invalid),
        FieldValue::Text(s) => s.trim(),
    };

    if key::is_day(text) {
        return Ok(text.to_string());
    }

    if let Some(date) = text.get(..10).filter(|d| d.as_bytes().get(4) == Some(&b'-')) {
        return NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map(|d| d.format("%Y%m%d").to_string())
            .map_err(|_| invalid());
    }

    let secs = text.split('.').next().unwrap_or_default();
    let secs: i64 = secs.parse().map_err(|_| invalid())?;
    epoch_day(secs).ok_or_else(invalid)
}

fn epoch_day(secs: i64) -> Option<String> {
    DateTime::from_timestamp(secs, 0).map(|dt| dt.format("%Y%m%d").to_string())
}
