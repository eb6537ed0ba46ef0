//! Dissector output line to [`PacketRecord`] conversion.

use thiserror::Error;

use super::catalog::FieldSpec;
use super::strategy::ParseStrategy;
use super::{FieldValue, PacketRecord};

/// Errors that can occur while normalizing one dissector line.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("line {line}: expected {expected} fields, got {actual}")]
    FieldCount {
        line: usize,
        expected: usize,
        actual: usize,
    },
}

/// Converts dissector lines into typed records for a fixed field list.
///
/// Built once per run; the strategy is resolved here and never recomputed
/// per record.
#[derive(Debug, Clone)]
pub struct Normalizer {
    fields: Vec<&'static FieldSpec>,
    strategy: ParseStrategy,
}

impl Normalizer {
    /// Creates a normalizer for the ordered field list the dissector emits.
    pub fn new(fields: Vec<&'static FieldSpec>) -> Self {
        let strategy = ParseStrategy::for_fields(&fields);
        Self { fields, strategy }
    }

    pub fn fields(&self) -> &[&'static FieldSpec] {
        &self.fields
    }

    pub fn strategy(&self) -> &ParseStrategy {
        &self.strategy
    }

    /// Dissector field names, in `-e` order.
    pub fn dissector_fields(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.dissector).collect()
    }

    /// Normalizes one line. `line_no` is only used for error reporting.
    ///
    /// Tokens are separated by a single space or tab; consecutive
    /// separators denote empty fields.
    pub fn normalize(&self, line_no: usize, line: &str) -> Result<PacketRecord, NormalizeError> {
        let line = line.trim_end_matches(['\n', '\r']);
        let tokens: Vec<&str> = line.split([' ', '\t']).collect();

        if tokens.len() != self.fields.len() {
            return Err(NormalizeError::FieldCount {
                line: line_no,
                expected: self.fields.len(),
                actual: tokens.len(),
            });
        }

        let mut record = PacketRecord::new();
        for (spec, token) in self.fields.iter().zip(tokens) {
            let value = match spec.sentinel {
                Some(sentinel) => FieldValue::Int(parse_int(token).unwrap_or(sentinel)),
                None => FieldValue::from(token),
            };
            record.insert(spec.name, value);
        }

        self.strategy.apply(&mut record);
        Ok(record)
    }
}

/// Parses decimal or `0x`-prefixed hexadecimal integers.
fn parse_int(token: &str) -> Option<i64> {
    let token = token.trim();
    if let Some(hex) = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        return i64::from_str_radix(hex, 16).ok();
    }
    token.parse().ok()
}
