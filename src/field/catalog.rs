use thiserror::Error;

/// Record field holding the packet timestamp.
pub const TIMESTAMP: &str = "timestamp";

/// Record field holding the IP protocol number.
pub const PROTOCOL: &str = "protocol";

/// Fields that are carried on records but never histogrammed.
pub const NON_INDEXED: &[&str] = &[
    "",
    "filename",
    "sensorname",
    TIMESTAMP,
    "packet_id",
    "type",
    "state",
];

/// Sentinel used for absent ports, addresses and protocol numbers.
pub const MISSING: i64 = -1;

/// One dissector field and the record field it is normalized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name as passed to the dissection tool (`-e ip.len`).
    pub dissector: &'static str,
    /// Field name in normalized records and aggregation keys.
    pub name: &'static str,
    /// Integer substituted when the token is empty or non-numeric.
    /// `None` for fields that are kept as text.
    pub sentinel: Option<i64>,
}

/// Every field the normalizer knows, in default dissection order.
pub const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        dissector: "frame.time_epoch",
        name: TIMESTAMP,
        sentinel: None,
    },
    FieldSpec {
        dissector: "ip.len",
        name: "length",
        sentinel: Some(-1),
    },
    FieldSpec {
        dissector: "ip.proto",
        name: PROTOCOL,
        sentinel: None,
    },
    FieldSpec {
        dissector: "ip.src",
        name: "ipsrc",
        sentinel: None,
    },
    FieldSpec {
        dissector: "ip.dst",
        name: "ipdst",
        sentinel: None,
    },
    FieldSpec {
        dissector: "ip.ttl",
        name: "ipttl",
        sentinel: Some(-1),
    },
    FieldSpec {
        dissector: "ip.dsfield",
        name: "iptos",
        sentinel: Some(0),
    },
    FieldSpec {
        dissector: "tcp.srcport",
        name: "tsport",
        sentinel: None,
    },
    FieldSpec {
        dissector: "udp.srcport",
        name: "usport",
        sentinel: None,
    },
    FieldSpec {
        dissector: "tcp.dstport",
        name: "tdport",
        sentinel: None,
    },
    FieldSpec {
        dissector: "udp.dstport",
        name: "udport",
        sentinel: None,
    },
    FieldSpec {
        dissector: "tcp.seq",
        name: "tcpseq",
        sentinel: Some(-1),
    },
    FieldSpec {
        dissector: "tcp.ack",
        name: "tcpack",
        sentinel: Some(-1),
    },
    FieldSpec {
        dissector: "icmp.code",
        name: "icmpcode",
        sentinel: Some(255),
    },
    FieldSpec {
        dissector: "icmp.type",
        name: "icmptype",
        sentinel: Some(255),
    },
];

/// Errors raised while resolving a user field filter.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown dissector field: {0}")]
    UnknownField(String),

    #[error("field listed more than once: {0}")]
    Duplicate(String),
}

/// Looks up a field by its dissector name (`ip.src`).
pub fn by_dissector(name: &str) -> Option<&'static FieldSpec> {
    FIELDS.iter().find(|f| f.dissector == name)
}

/// Looks up a field by its record name (`ipsrc`).
pub fn by_name(name: &str) -> Option<&'static FieldSpec> {
    FIELDS.iter().find(|f| f.name == name)
}

/// Returns true if the record field produces histogram entries.
pub fn is_indexed(name: &str) -> bool {
    !NON_INDEXED.contains(&name)
}

/// Resolves a dissector field filter into the ordered field list.
///
/// An empty filter selects every known field. The timestamp and protocol
/// fields are always present: when missing from the filter they are
/// inserted at positions 0 and 1.
pub fn resolve_filter(filter: &[String]) -> Result<Vec<&'static FieldSpec>, CatalogError> {
    if filter.is_empty() {
        return Ok(FIELDS.iter().collect());
    }

    let mut resolved: Vec<&'static FieldSpec> = Vec::with_capacity(filter.len() + 2);
    for name in filter {
        let spec = by_dissector(name).ok_or_else(|| CatalogError::UnknownField(name.clone()))?;
        if resolved.iter().any(|f| f.dissector == spec.dissector) {
            return Err(CatalogError::Duplicate(name.clone()));
        }
        resolved.push(spec);
    }

    for (position, required) in [TIMESTAMP, PROTOCOL].into_iter().enumerate() {
        if !resolved.iter().any(|f| f.name == required) {
            if let Some(spec) = by_name(required) {
                resolved.insert(position, spec);
            }
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(fields: &[&FieldSpec]) -> Vec<&'static str> {
        fields.iter().map(|f| f.name).collect()
    }

    #[test]
    fn test_empty_filter_selects_all_fields() {
        let fields = resolve_filter(&[]).unwrap();
        assert_eq!(fields.len(), FIELDS.len());
        assert_eq!(fields[0].name, TIMESTAMP);
    }

    #[test]
    fn test_filter_inserts_timestamp_and_protocol() {
        let filter = vec!["tcp.dstport".to_string(), "udp.dstport".to_string()];
        let fields = resolve_filter(&filter).unwrap();
        assert_eq!(names(&fields), vec![TIMESTAMP, PROTOCOL, "tdport", "udport"]);
    }

    #[test]
    fn test_filter_keeps_existing_protocol_position() {
        let filter = vec!["ip.proto".to_string(), "ip.src".to_string()];
        let fields = resolve_filter(&filter).unwrap();
        assert_eq!(names(&fields), vec![TIMESTAMP, PROTOCOL, "ipsrc"]);
    }

    #[test]
    fn test_filter_rejects_unknown_field() {
        let filter = vec!["ip.bogus".to_string()];
        assert_eq!(
            resolve_filter(&filter),
            Err(CatalogError::UnknownField("ip.bogus".to_string()))
        );
    }

    #[test]
    fn test_filter_rejects_duplicates() {
        let filter = vec!["ip.src".to_string(), "ip.src".to_string()];
        assert_eq!(
            resolve_filter(&filter),
            Err(CatalogError::Duplicate("ip.src".to_string()))
        );
    }

    #[test]
    fn test_sentinels_differ_per_field() {
        assert_eq!(by_name("icmpcode").unwrap().sentinel, Some(255));
        assert_eq!(by_name("length").unwrap().sentinel, Some(-1));
        assert_eq!(by_name("iptos").unwrap().sentinel, Some(0));
        assert_eq!(by_name("ipsrc").unwrap().sentinel, None);
    }

    #[test]
    fn test_non_indexed_fields() {
        assert!(!is_indexed(TIMESTAMP));
        assert!(!is_indexed("packet_id"));
        assert!(is_indexed(PROTOCOL));
        assert!(is_indexed("dport"));
    }
}
