use std::collections::HashMap;
use std::fmt;

use super::AnnotationKind;

/// Per-file identifier assigned by an enrichment pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub i64);

/// One annotation value (a country, a passive DNS name list, an AS number).
///
/// Strings are kept as-is. Any other JSON value is stored in its compact
/// JSON rendering so equal values always produce equal text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnnotationValue(String);

impl AnnotationValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Self(s.clone()),
            other => Self(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnnotationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local annotation entries of one file, keyed by `(kind, local id)`.
#[derive(Debug, Clone, Default)]
pub struct LocalDictionary {
    entries: HashMap<(AnnotationKind, LocalId), AnnotationValue>,
}

impl LocalDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry. A later entry for the same key replaces the earlier.
    pub fn insert(&mut self, kind: AnnotationKind, id: LocalId, value: AnnotationValue) {
        self.entries.insert((kind, id), value);
    }

    pub fn get(&self, kind: AnnotationKind, id: LocalId) -> Option<&AnnotationValue> {
        self.entries.get(&(kind, id))
    }

    /// Returns true if any entry of `kind` is present.
    pub fn has_kind(&self, kind: AnnotationKind) -> bool {
        self.entries.keys().any(|(k, _)| *k == kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_scoped_by_kind() {
        let mut dict = LocalDictionary::new();
        dict.insert(AnnotationKind::Asn, LocalId(1), AnnotationValue::new("AS64500"));
        dict.insert(AnnotationKind::Geo, LocalId(1), AnnotationValue::new("LU"));

        assert_eq!(dict.get(AnnotationKind::Asn, LocalId(1)).unwrap().as_str(), "AS64500");
        assert_eq!(dict.get(AnnotationKind::Geo, LocalId(1)).unwrap().as_str(), "LU");
        assert!(dict.get(AnnotationKind::PassiveDns, LocalId(1)).is_none());
        assert!(!dict.has_kind(AnnotationKind::PassiveDns));
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn test_value_from_json() {
        let names = serde_json::json!(["a.example", "b.example"]);
        assert_eq!(
            AnnotationValue::from_json(&names).as_str(),
            r#"["a.example","b.example"]"#
        );
        assert_eq!(
            AnnotationValue::from_json(&serde_json::json!("LU")).as_str(),
            "LU"
        );
        assert_eq!(AnnotationValue::from_json(&serde_json::json!(64500)).as_str(), "64500");
    }
}
