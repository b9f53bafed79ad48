use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Maximum length of a single DNS label in octets.
pub const MAX_DNS_LABEL_LEN: usize = 63;

/// Provenance category of a candidate name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    Api,
    Alt,
    Archive,
    Axfr,
    Brute,
    Cert,
    #[default]
    Dns,
    Scrape,
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tag::Api => "api",
            Tag::Alt => "alt",
            Tag::Archive => "archive",
            Tag::Axfr => "axfr",
            Tag::Brute => "brute",
            Tag::Cert => "cert",
            Tag::Dns => "dns",
            Tag::Scrape => "scrape",
        };
        f.write_str(s)
    }
}

/// A single normalized DNS answer: trailing dot stripped from `name`,
/// `data` trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsAnswer {
    pub name: String,
    pub rr_type: u16,
    pub ttl: u32,
    pub data: String,
}

impl DnsAnswer {
    pub fn new(name: &str, rr_type: u16, ttl: u32, data: &str) -> Self {
        Self {
            name: name.trim_end_matches('.').to_lowercase(),
            rr_type,
            ttl,
            data: data.trim().trim_end_matches('.').to_string(),
        }
    }
}

/// The unit of work that traverses the event bus.
///
/// A request is created by a producer, annotated by the DNS service with
/// records and an address, and never mutated in place once published;
/// downstream services clone it to add their own annotations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    pub name: String,
    /// Root domain the name belongs to; inferred by the name service when
    /// the producer leaves it empty.
    pub domain: String,
    pub records: Vec<DnsAnswer>,
    pub address: Option<IpAddr>,
    pub netblock: Option<String>,
    pub asn: Option<u32>,
    pub isp: Option<String>,
    pub tag: Tag,
    pub source: String,
}

impl Request {
    /// A bare candidate name as emitted by a data source.
    pub fn candidate(name: &str, domain: &str, tag: Tag, source: &str) -> Self {
        Self {
            name: name.to_string(),
            domain: domain.to_string(),
            tag,
            source: source.to_string(),
            ..Self::default()
        }
    }

    /// A reverse-lookup request carrying only an address.
    pub fn reverse(addr: IpAddr, domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            address: Some(addr),
            tag: Tag::Dns,
            source: "DNS".to_string(),
            ..Self::default()
        }
    }

    /// Unique resolved addresses across all A/AAAA records plus the primary.
    pub fn addresses(&self) -> Vec<IpAddr> {
        let mut out: Vec<IpAddr> = Vec::new();
        if let Some(a) = self.address {
            out.push(a);
        }
        for rec in &self.records {
            if rec.rr_type == 1 || rec.rr_type == 28 {
                if let Ok(ip) = rec.data.parse::<IpAddr>() {
                    if !out.contains(&ip) {
                        out.push(ip);
                    }
                }
            }
        }
        out
    }

    /// True if any record carries one of the given RR types.
    pub fn has_record_type(&self, types: &[u16]) -> bool {
        self.records.iter().any(|r| types.contains(&r.rr_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_normalization() {
        let a = DnsAnswer::new("WWW.Example.COM.", 1, 300, " 93.184.216.34 ");
        assert_eq!(a.name, "www.example.com");
        assert_eq!(a.data, "93.184.216.34");
    }

    #[test]
    fn request_addresses_dedup() {
        let mut req = Request::candidate("www.example.com", "example.com", Tag::Dns, "DNS");
        req.address = Some("93.184.216.34".parse().unwrap());
        req.records.push(DnsAnswer::new("www.example.com", 1, 60, "93.184.216.34"));
        req.records.push(DnsAnswer::new("www.example.com", 28, 60, "2606:2800:220:1:248:1893:25c8:1946"));
        assert_eq!(req.addresses().len(), 2);
    }

    #[test]
    fn tag_display_matches_serde() {
        assert_eq!(Tag::Axfr.to_string(), "axfr");
        assert_eq!(serde_json::to_string(&Tag::Cert).unwrap(), "\"cert\"");
    }
}
