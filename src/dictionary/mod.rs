//! Annotation dictionaries.
//!
//! Enrichment passes number their annotation values per file
//! ([`local::LocalDictionary`]). The [`global::GlobalReconciler`] maps those
//! values onto one store-wide numbering per [`AnnotationKind`], and
//! [`reverse`] builds the id to value index once ingestion is idle.

pub mod global;
pub mod local;
pub mod reverse;

use std::fmt;

use thiserror::Error;

pub use global::{AllocationState, GlobalReconciler, Resolution, ResolutionStats};
pub use local::{AnnotationValue, LocalDictionary, LocalId};

/// Prefix of annotation fields in packet records.
pub const ANNOTATION_PREFIX: &str = "a_";

/// Category of enrichment data. Each kind owns its own id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnnotationKind {
    Geo,
    PassiveDns,
    Asn,
}

impl AnnotationKind {
    /// Numeric type code used in documents and store keys.
    pub fn code(self) -> u8 {
        match self {
            Self::Geo => 11,
            Self::PassiveDns => 12,
            Self::Asn => 13,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            11 => Some(Self::Geo),
            12 => Some(Self::PassiveDns),
            13 => Some(Self::Asn),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Geo => "geo",
            Self::PassiveDns => "pdns",
            Self::Asn => "asn",
        }
    }

    pub fn all() -> &'static [AnnotationKind] {
        &[Self::Geo, Self::PassiveDns, Self::Asn]
    }

    /// Allocation counter for this kind.
    pub fn counter_key(self) -> String {
        format!("RTI_{}", self.code())
    }

    /// Link from an annotated object to its global id.
    pub fn origin_link_key(self, origin: &str) -> String {
        format!("AR_{}_{}", self.code(), origin)
    }
}

impl fmt::Display for AnnotationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store-wide identifier of one annotation value within its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub i64);

impl GlobalId {
    /// Assigned to annotation references that cannot be traced to a value.
    pub const UNRESOLVED: GlobalId = GlobalId(-1);

    pub fn is_resolved(self) -> bool {
        self != Self::UNRESOLVED
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised for malformed annotation field names.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AnnotationFieldError {
    #[error("{0}: not an annotation field")]
    MissingPrefix(String),

    #[error("{0}: missing or invalid type code")]
    InvalidType(String),

    #[error("{field}: unknown annotation type {code}")]
    UnknownKind { field: String, code: i64 },

    #[error("{0}: missing annotation name")]
    MissingName(String),
}

/// A parsed `a_<type>_<name>` field, e.g. `a_13_ipsrc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnnotationField {
    pub kind: AnnotationKind,
    pub name: String,
}

impl AnnotationField {
    pub fn parse(field: &str) -> Result<Self, AnnotationFieldError> {
        let rest = field
            .strip_prefix(ANNOTATION_PREFIX)
            .ok_or_else(|| AnnotationFieldError::MissingPrefix(field.to_string()))?;

        let (code, name) = rest
            .split_once('_')
            .ok_or_else(|| AnnotationFieldError::MissingName(field.to_string()))?;

        let code: i64 = code
            .parse()
            .map_err(|_| AnnotationFieldError::InvalidType(field.to_string()))?;

        let kind = AnnotationKind::from_code(code).ok_or(AnnotationFieldError::UnknownKind {
            field: field.to_string(),
            code,
        })?;

        if name.is_empty() {
            return Err(AnnotationFieldError::MissingName(field.to_string()));
        }

        Ok(Self {
            kind,
            name: name.to_string(),
        })
    }

    /// Returns true for names carrying the annotation prefix.
    pub fn is_annotation(field: &str) -> bool {
        field.starts_with(ANNOTATION_PREFIX)
    }

    /// Hash of value to global id.
    pub fn registration_key(&self) -> String {
        format!("RT_a_{}_{}", self.kind.code(), self.name)
    }

    /// Hash of global id to value, built by [`reverse::build_reverse_index`].
    pub fn reverse_key(&self) -> String {
        format!("TR_a_{}_{}", self.kind.code(), self.name)
    }

    /// Record field naming the annotated object: the first `_` segment of
    /// the name (`ipsrc` for `a_12_ipsrc_reverse`).
    pub fn origin_field(&self) -> &str {
        self.name.split('_').next().unwrap_or(&self.name)
    }
}

impl fmt::Display for AnnotationField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a_{}_{}", self.kind.code(), self.name)
    }
}
