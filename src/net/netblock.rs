//! IP → ASN/netblock context via whois-over-DNS (Team Cymru style), with a
//! CIDR-keyed cache. An address belongs to at most one cached netblock, and
//! a second lookup of a covered address never touches the wire.

use std::net::IpAddr;
use std::sync::Arc;

use ahash::AHashMap;
use hickory_resolver::proto::rr::RecordType;
use ipnetwork::IpNetwork;
use parking_lot::Mutex;

use crate::dns::pool::NameResolver;

const ORIGIN_V4_SUFFIX: &str = "origin.asn.cymru.com";
const ORIGIN_V6_SUFFIX: &str = "origin6.asn.cymru.com";
const ASN_SUFFIX: &str = "asn.cymru.com";
/// Cap for expanding very large v6 networks into host lists.
const V6_HOST_CAP: usize = 256;

#[derive(Debug, Clone)]
pub struct Netblock {
    pub cidr: IpNetwork,
    pub asn: u32,
    pub description: String,
}

pub struct NetblockCache {
    resolver: Arc<dyn NameResolver>,
    cache: Mutex<AHashMap<String, Arc<Netblock>>>,
}

impl NetblockCache {
    pub fn new(resolver: Arc<dyn NameResolver>) -> Self {
        Self {
            resolver,
            cache: Mutex::new(AHashMap::new()),
        }
    }

    /// Netblock covering `addr`, plus whether it came from the cache.
    pub async fn get(&self, addr: IpAddr) -> (Arc<Netblock>, bool) {
        if let Some(block) = self.lookup_cached(addr) {
            return (block, true);
        }
        let block = match self.whois(addr).await {
            Some(block) => block,
            None => default_block(addr),
        };
        let block = Arc::new(block);
        self.cache
            .lock()
            .insert(block.cidr.to_string(), block.clone());
        (block, false)
    }

    fn lookup_cached(&self, addr: IpAddr) -> Option<Arc<Netblock>> {
        self.cache
            .lock()
            .values()
            .find(|b| b.cidr.contains(addr))
            .cloned()
    }

    async fn whois(&self, addr: IpAddr) -> Option<Netblock> {
        let origin = origin_query_name(addr);
        let answers = self.resolver.query(&origin, RecordType::TXT).await.ok()?;
        let txt = answers.first()?;
        let (asn, cidr) = parse_origin_txt(&txt.data)?;
        let description = self.asn_description(asn).await.unwrap_or_default();
        Some(Netblock {
            cidr,
            asn,
            description,
        })
    }

    async fn asn_description(&self, asn: u32) -> Option<String> {
        let name = format!("AS{asn}.{ASN_SUFFIX}");
        let answers = self.resolver.query(&name, RecordType::TXT).await.ok()?;
        let txt = answers.first()?;
        txt.data
            .rsplit('|')
            .next()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
    }
}

/// Query name for the origin-AS TXT lookup of an address.
pub fn origin_query_name(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{d}.{c}.{b}.{a}.{ORIGIN_V4_SUFFIX}")
        }
        IpAddr::V6(v6) => {
            let mut nibbles: Vec<String> = Vec::with_capacity(32);
            for octet in v6.octets() {
                nibbles.push(format!("{:x}", octet >> 4));
                nibbles.push(format!("{:x}", octet & 0x0f));
            }
            nibbles.reverse();
            format!("{}.{ORIGIN_V6_SUFFIX}", nibbles.join("."))
        }
    }
}

/// Parse `"15133 | 93.184.216.0/24 | US | ripencc | 2008-06-02"`.
fn parse_origin_txt(data: &str) -> Option<(u32, IpNetwork)> {
    let mut fields = data.split('|').map(str::trim);
    // The AS field may list several origins; the first wins.
    let asn = fields.next()?.split_whitespace().next()?.parse().ok()?;
    let cidr = fields.next()?.parse().ok()?;
    Some((asn, cidr))
}

/// Assumed surrounding when whois yields nothing: a /24 or /64.
fn default_block(addr: IpAddr) -> Netblock {
    let cidr = match addr {
        IpAddr::V4(_) => IpNetwork::new(addr, 24),
        IpAddr::V6(_) => IpNetwork::new(addr, 64),
    }
    // Prefixes are in range, so this only normalizes the host bits away.
    .and_then(|net| IpNetwork::new(net.network(), net.prefix()))
    .unwrap_or_else(|_| IpNetwork::new(addr, 32).expect("host prefix is always valid"));
    Netblock {
        cidr,
        asn: 0,
        description: "Unknown".to_string(),
    }
}

/// All usable host addresses of a network, network and broadcast excluded.
pub fn net_hosts(net: &IpNetwork) -> Vec<String> {
    match net {
        IpNetwork::V4(v4) => {
            let hosts: Vec<String> = v4.iter().map(|ip| ip.to_string()).collect();
            if v4.prefix() >= 31 {
                hosts
            } else {
                hosts[1..hosts.len() - 1].to_vec()
            }
        }
        IpNetwork::V6(v6) => v6.iter().take(V6_HOST_CAP).map(|ip| ip.to_string()).collect(),
    }
}

/// Inclusive address range as strings; empty when the families differ or
/// the range is inverted.
pub fn range_hosts(start: IpAddr, end: IpAddr) -> Vec<String> {
    match (start, end) {
        (IpAddr::V4(s), IpAddr::V4(e)) => {
            let (s, e) = (u32::from(s), u32::from(e));
            if s > e {
                return Vec::new();
            }
            (s..=e)
                .map(|ip| std::net::Ipv4Addr::from(ip).to_string())
                .collect()
        }
        (IpAddr::V6(s), IpAddr::V6(e)) => {
            let (s, e) = (u128::from(s), u128::from(e));
            if s > e || e - s > V6_HOST_CAP as u128 {
                return Vec::new();
            }
            (s..=e)
                .map(|ip| std::net::Ipv6Addr::from(ip).to_string())
                .collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::testing::MockResolver;

    #[test]
    fn slash24_has_254_hosts() {
        let net: IpNetwork = "72.237.4.0/24".parse().unwrap();
        let hosts = net_hosts(&net);
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts.first().map(String::as_str), Some("72.237.4.1"));
        assert_eq!(hosts.last().map(String::as_str), Some("72.237.4.254"));
    }

    #[test]
    fn range_is_inclusive() {
        let hosts = range_hosts("72.237.4.1".parse().unwrap(), "72.237.4.50".parse().unwrap());
        assert_eq!(hosts.len(), 50);
        assert!(range_hosts("72.237.4.50".parse().unwrap(), "72.237.4.1".parse().unwrap())
            .is_empty());
    }

    #[test]
    fn origin_names_reverse_the_octets() {
        assert_eq!(
            origin_query_name("93.184.216.34".parse().unwrap()),
            "34.216.184.93.origin.asn.cymru.com"
        );
        let v6 = origin_query_name("2001:db8::1".parse().unwrap());
        assert!(v6.ends_with(".origin6.asn.cymru.com"));
        assert!(v6.starts_with("1.0.0.0."));
    }

    #[test]
    fn origin_txt_parses() {
        let (asn, cidr) =
            parse_origin_txt("15133 | 93.184.216.0/24 | US | ripencc | 2008-06-02").unwrap();
        assert_eq!(asn, 15133);
        assert_eq!(cidr.to_string(), "93.184.216.0/24");
        assert!(parse_origin_txt("garbage").is_none());
    }

    #[tokio::test]
    async fn second_covered_lookup_hits_the_cache() {
        let resolver = MockResolver::new();
        resolver.answer(
            "10.4.237.72.origin.asn.cymru.com",
            RecordType::TXT,
            "33363 | 72.237.4.0/24 | US | arin | 2007-01-10",
        );
        resolver.answer(
            "AS33363.asn.cymru.com",
            RecordType::TXT,
            "33363 | US | arin | 2005-02-18 | BHN-33363, US",
        );
        let cache = NetblockCache::new(resolver.clone());

        let (block, cached) = cache.get("72.237.4.10".parse().unwrap()).await;
        assert!(!cached);
        assert_eq!(block.asn, 33363);
        assert_eq!(block.cidr.to_string(), "72.237.4.0/24");
        assert_eq!(block.description, "BHN-33363, US");

        let (again, cached) = cache.get("72.237.4.99".parse().unwrap()).await;
        assert!(cached);
        assert_eq!(again.cidr, block.cidr);

        // A fresh address outside every cached block misses.
        let (other, cached) = cache.get("8.8.8.8".parse().unwrap()).await;
        assert!(!cached);
        assert_eq!(other.asn, 0, "whois miss falls back to an assumed /24");
        assert_eq!(other.cidr.to_string(), "8.8.8.0/24");
    }
}
