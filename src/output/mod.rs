//! Finding serialization for the CLI.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{Request, Tag};

/// One emitted discovery, flattened for line-oriented output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub name: String,
    pub domain: String,
    pub addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netblock: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,
    pub tag: Tag,
    pub source: String,
}

impl From<&Request> for Finding {
    fn from(req: &Request) -> Self {
        Self {
            name: req.name.clone(),
            domain: req.domain.clone(),
            addresses: req.addresses().iter().map(|a| a.to_string()).collect(),
            netblock: req.netblock.clone(),
            asn: req.asn,
            tag: req.tag,
            source: req.source.clone(),
        }
    }
}

pub fn write_jsonl(path: &Path, findings: &[Finding]) -> anyhow::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for finding in findings {
        serde_json::to_writer(&mut file, finding)?;
        file.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn findings_round_trip_as_jsonl_rows() {
        let mut req = Request::candidate("www.example.com", "example.com", Tag::Cert, "crt.sh");
        req.address = Some("93.184.216.34".parse().unwrap());
        let finding = Finding::from(&req);
        let row = serde_json::to_string(&finding).unwrap();
        let back: Finding = serde_json::from_str(&row).unwrap();
        assert_eq!(back.name, "www.example.com");
        assert_eq!(back.tag, Tag::Cert);
        assert_eq!(back.addresses, vec!["93.184.216.34"]);
    }
}
