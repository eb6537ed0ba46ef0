//! Per-run parse strategy, selected once from the dissected field set.

use super::catalog::{FieldSpec, MISSING, PROTOCOL};
use super::{FieldValue, PacketRecord};

const TCP: i64 = 6;
const UDP: i64 = 17;

/// Which IP address fields are present in the field set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpSelection {
    None,
    Src,
    Dst,
    Both,
}

impl IpSelection {
    fn fields(self) -> &'static [&'static str] {
        match self {
            Self::None => &[],
            Self::Src => &["ipsrc"],
            Self::Dst => &["ipdst"],
            Self::Both => &["ipsrc", "ipdst"],
        }
    }
}

/// Which transport-specific candidates feed one port direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSource {
    None,
    Tcp,
    Udp,
    Either,
}

impl PortSource {
    fn from_presence(tcp: bool, udp: bool) -> Self {
        match (tcp, udp) {
            (false, false) => Self::None,
            (true, false) => Self::Tcp,
            (false, true) => Self::Udp,
            (true, true) => Self::Either,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Either => "either",
        }
    }
}

/// Source and destination port resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSelection {
    pub src: PortSource,
    pub dst: PortSource,
}

/// Whether the protocol field is coerced to an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolHandling {
    Parsed,
    Unparsed,
}

/// The closed set of record fix-ups applied after tokens are zipped onto
/// field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseStrategy {
    pub ips: IpSelection,
    pub ports: PortSelection,
    pub protocol: ProtocolHandling,
}

impl ParseStrategy {
    /// Selects the strategy matching an ordered field list.
    pub fn for_fields(fields: &[&FieldSpec]) -> Self {
        let has = |name: &str| fields.iter().any(|f| f.name == name);

        let ips = match (has("ipsrc"), has("ipdst")) {
            (false, false) => IpSelection::None,
            (true, false) => IpSelection::Src,
            (false, true) => IpSelection::Dst,
            (true, true) => IpSelection::Both,
        };

        let ports = PortSelection {
            src: PortSource::from_presence(has("tsport"), has("usport")),
            dst: PortSource::from_presence(has("tdport"), has("udport")),
        };

        let protocol = if has(PROTOCOL) {
            ProtocolHandling::Parsed
        } else {
            ProtocolHandling::Unparsed
        };

        Self {
            ips,
            ports,
            protocol,
        }
    }

    /// Short stable label, stored as a non-critical run parameter.
    pub fn label(&self) -> String {
        let ips = match self.ips {
            IpSelection::None => "none",
            IpSelection::Src => "src",
            IpSelection::Dst => "dst",
            IpSelection::Both => "both",
        };
        let protocol = match self.protocol {
            ProtocolHandling::Parsed => "parsed",
            ProtocolHandling::Unparsed => "unparsed",
        };
        format!(
            "ip={ips},sport={},dport={},protocol={protocol}",
            self.ports.src.as_str(),
            self.ports.dst.as_str()
        )
    }

    /// Record field names produced for `fields` once ports are merged.
    pub fn record_fields(&self, fields: &[&FieldSpec]) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = Vec::with_capacity(fields.len());
        for spec in fields {
            let name = match spec.name {
                "tsport" | "usport" => "sport",
                "tdport" | "udport" => "dport",
                other => other,
            };
            if !out.contains(&name) {
                out.push(name);
            }
        }
        out
    }

    /// Applies protocol, port and address fix-ups to a record in place.
    pub fn apply(&self, record: &mut PacketRecord) {
        if self.protocol == ProtocolHandling::Parsed {
            let protocol = record
                .get(PROTOCOL)
                .and_then(FieldValue::as_int)
                .unwrap_or(MISSING);
            record.insert(PROTOCOL, protocol);
        }

        let protocol = record.get(PROTOCOL).and_then(FieldValue::as_int);
        resolve_port(record, "sport", "tsport", "usport", self.ports.src, protocol);
        resolve_port(record, "dport", "tdport", "udport", self.ports.dst, protocol);

        for ip in self.ips.fields() {
            let absent = match record.get(ip) {
                None => true,
                Some(value) => value.is_empty() || *value == FieldValue::from("-"),
            };
            if absent {
                record.insert(*ip, MISSING);
            }
        }
    }
}

fn resolve_port(
    record: &mut PacketRecord,
    target: &str,
    tcp_field: &str,
    udp_field: &str,
    source: PortSource,
    protocol: Option<i64>,
) {
    if source == PortSource::None {
        return;
    }

    let tcp = take_port(record, tcp_field);
    let udp = take_port(record, udp_field);

    let port = match source {
        PortSource::None => return,
        PortSource::Tcp => tcp,
        PortSource::Udp => udp,
        PortSource::Either => match protocol {
            Some(UDP) => udp.or(tcp),
            Some(TCP) => tcp.or(udp),
            _ => tcp.or(udp),
        },
    };

    record.insert(target, port.unwrap_or(MISSING));
}

fn take_port(record: &mut PacketRecord, field: &str) -> Option<i64> {
    record.remove(field).and_then(|v| match v {
        FieldValue::Int(p) => Some(p),
        FieldValue::Text(s) if s.is_empty() => None,
        FieldValue::Text(s) => s.parse().ok(),
    })
}
