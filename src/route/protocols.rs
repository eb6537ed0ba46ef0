use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

/// Built-in protocol numbers, named as in `/etc/protocols`.
const BUILTIN: &[(i64, &str)] = &[
    (0, "hopopt"),
    (1, "icmp"),
    (2, "igmp"),
    (3, "ggp"),
    (4, "ipv4"),
    (6, "tcp"),
    (8, "egp"),
    (9, "igp"),
    (12, "pup"),
    (17, "udp"),
    (20, "hmp"),
    (22, "xns-idp"),
    (27, "rdp"),
    (29, "iso-tp4"),
    (33, "dccp"),
    (36, "xtp"),
    (37, "ddp"),
    (41, "ipv6"),
    (43, "ipv6-route"),
    (44, "ipv6-frag"),
    (46, "rsvp"),
    (47, "gre"),
    (50, "esp"),
    (51, "ah"),
    (58, "ipv6-icmp"),
    (59, "ipv6-nonxt"),
    (60, "ipv6-opts"),
    (73, "rspf"),
    (81, "vmtp"),
    (88, "eigrp"),
    (89, "ospf"),
    (94, "ipip"),
    (97, "etherip"),
    (98, "encap"),
    (103, "pim"),
    (108, "ipcomp"),
    (112, "vrrp"),
    (115, "l2tp"),
    (124, "isis"),
    (132, "sctp"),
    (133, "fc"),
    (135, "mobility-header"),
    (136, "udplite"),
    (137, "mpls-in-ip"),
    (139, "hip"),
    (140, "shim6"),
    (141, "wesp"),
    (142, "rohc"),
];

/// Protocol number to name table used by combined keys.
#[derive(Debug, Clone)]
pub struct ProtocolTable {
    names: HashMap<i64, String>,
}

impl Default for ProtocolTable {
    fn default() -> Self {
        Self {
            names: BUILTIN
                .iter()
                .map(|(n, name)| (*n, (*name).to_string()))
                .collect(),
        }
    }
}

impl ProtocolTable {
    /// Loads a `name<TAB>number` table. Lines starting with `#` and blank
    /// lines are skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading protocol table {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing protocol table {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut names = HashMap::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut cols = line.split('\t');
            let (Some(name), Some(number)) = (cols.next(), cols.next()) else {
                anyhow::bail!("line {}: expected name and number", idx + 1);
            };
            let number: i64 = number
                .trim()
                .parse()
                .with_context(|| format!("line {}: invalid protocol number", idx + 1))?;
            names.insert(number, name.trim().to_string());
        }
        Ok(Self { names })
    }

    pub fn name(&self, number: i64) -> Option<&str> {
        self.names.get(&number).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        let table = ProtocolTable::default();
        assert_eq!(table.name(6), Some("tcp"));
        assert_eq!(table.name(17), Some("udp"));
        assert_eq!(table.name(1), Some("icmp"));
        assert_eq!(table.name(-1), None);
        assert_eq!(table.name(250), None);
    }

    #[test]
    fn test_parse_table() {
        let table = ProtocolTable::parse("# comment\nTCP\t6\nUDP\t17\n\n").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.name(6), Some("TCP"));
    }

    #[test]
    fn test_parse_rejects_bad_number() {
        assert!(ProtocolTable::parse("tcp\tsix\n").is_err());
        assert!(ProtocolTable::parse("tcp 6\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protocols");
        std::fs::write(&path, "gre\t47\n").unwrap();
        let table = ProtocolTable::load(&path).unwrap();
        assert_eq!(table.name(47), Some("gre"));
    }
}
