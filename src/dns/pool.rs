//! Round-robin pool of recursive DNS servers.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::rr::{RData, Record, RecordType};
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;

use crate::types::DnsAnswer;

/// Fallback recursive servers used when the configuration names none.
pub const PUBLIC_RESOLVERS: &[&str] = &[
    "8.8.8.8",
    "8.8.4.4",
    "1.1.1.1",
    "1.0.0.1",
    "9.9.9.9",
    "149.112.112.112",
    "64.6.64.6",
    "64.6.65.6",
    "77.88.8.8",
    "74.82.42.42",
];

/// Transient resolution failures; an empty answer set is not a failure.
#[derive(Debug, Error)]
pub enum ResolveFailure {
    #[error("query timed out")]
    Timeout,
    #[error("{0}")]
    Protocol(String),
}

/// The seam between the engine and the wire. Production uses
/// [`ResolverPool`]; tests plug in `dns::testing::MockResolver`.
#[async_trait]
pub trait NameResolver: Send + Sync + 'static {
    /// Resolve `name` for one record type. `Ok(vec![])` means the name does
    /// not exist or holds no records of that type.
    async fn query(&self, name: &str, rtype: RecordType)
        -> Result<Vec<DnsAnswer>, ResolveFailure>;

    /// PTR lookup for an address.
    async fn reverse(&self, addr: IpAddr) -> Result<Vec<DnsAnswer>, ResolveFailure>;
}

/// Consecutive failures before a server is skipped in the rotation.
const DEGRADE_THRESHOLD: usize = 25;

pub struct ResolverPool {
    resolvers: Vec<TokioAsyncResolver>,
    failures: Vec<AtomicUsize>,
    next: AtomicUsize,
}

impl ResolverPool {
    /// Build one resolver handle per configured server, each with a
    /// per-query timeout and EDNS0 enabled. UDP with automatic TCP fallback
    /// on truncation is the hickory default.
    pub fn new(servers: &[String], timeout: Duration) -> anyhow::Result<Self> {
        let mut resolvers = Vec::new();
        for server in servers {
            let ip: IpAddr = server
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid resolver address: {server}"))?;
            let group = NameServerConfigGroup::from_ips_clear(&[ip], 53, true);
            let config = ResolverConfig::from_parts(None, vec![], group);
            let mut opts = ResolverOpts::default();
            opts.timeout = timeout;
            opts.attempts = 1;
            opts.edns0 = true;
            opts.use_hosts_file = false;
            resolvers.push(TokioAsyncResolver::tokio(config, opts));
        }
        if resolvers.is_empty() {
            anyhow::bail!("resolver pool needs at least one server");
        }
        let failures = resolvers.iter().map(|_| AtomicUsize::new(0)).collect();
        Ok(Self {
            resolvers,
            failures,
            next: AtomicUsize::new(0),
        })
    }

    /// Round-robin, skipping servers that have been failing persistently.
    /// With every server degraded the plain rotation continues; a broken
    /// pool is still better than no pool.
    fn next_resolver(&self) -> (usize, &TokioAsyncResolver) {
        for _ in 0..self.resolvers.len() {
            let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.resolvers.len();
            if self.failures[idx].load(Ordering::Relaxed) < DEGRADE_THRESHOLD {
                return (idx, &self.resolvers[idx]);
            }
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.resolvers.len();
        (idx, &self.resolvers[idx])
    }

    fn record_outcome(&self, idx: usize, ok: bool) {
        if ok {
            self.failures[idx].store(0, Ordering::Relaxed);
        } else {
            let failed = self.failures[idx].fetch_add(1, Ordering::Relaxed) + 1;
            if failed == DEGRADE_THRESHOLD {
                tracing::warn!(resolver = idx, "resolver degraded after repeated failures");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

#[async_trait]
impl NameResolver for ResolverPool {
    async fn query(
        &self,
        name: &str,
        rtype: RecordType,
    ) -> Result<Vec<DnsAnswer>, ResolveFailure> {
        let (idx, resolver) = self.next_resolver();
        let result = match resolver.lookup(name, rtype).await {
            Ok(lookup) => Ok(lookup.record_iter().filter_map(answer_from_record).collect()),
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                ResolveErrorKind::Timeout => Err(ResolveFailure::Timeout),
                _ => Err(ResolveFailure::Protocol(err.to_string())),
            },
        };
        self.record_outcome(idx, result.is_ok());
        result
    }

    async fn reverse(&self, addr: IpAddr) -> Result<Vec<DnsAnswer>, ResolveFailure> {
        let (idx, resolver) = self.next_resolver();
        let result = match resolver.reverse_lookup(addr).await {
            Ok(lookup) => Ok(lookup
                .as_lookup()
                .record_iter()
                .filter_map(answer_from_record)
                .collect()),
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                ResolveErrorKind::Timeout => Err(ResolveFailure::Timeout),
                _ => Err(ResolveFailure::Protocol(err.to_string())),
            },
        };
        self.record_outcome(idx, result.is_ok());
        result
    }
}

/// Flatten a resource record into the engine's answer form. Record types
/// the engine never consumes map to `None`.
pub fn answer_from_record(record: &Record) -> Option<DnsAnswer> {
    let name = record.name().to_utf8();
    let ttl = record.ttl();
    let rr_type = u16::from(record.record_type());
    let data = match record.data()? {
        RData::A(a) => a.0.to_string(),
        RData::AAAA(a) => a.0.to_string(),
        RData::CNAME(c) => c.0.to_utf8(),
        RData::NS(ns) => ns.0.to_utf8(),
        RData::PTR(p) => p.0.to_utf8(),
        RData::MX(mx) => mx.exchange().to_utf8(),
        RData::SOA(soa) => soa.mname().to_utf8(),
        RData::SRV(srv) => srv.target().to_utf8(),
        RData::TXT(txt) => txt
            .iter()
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(""),
        _ => return None,
    };
    Some(DnsAnswer::new(&name, rr_type, ttl, &data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_requires_servers() {
        assert!(ResolverPool::new(&[], Duration::from_secs(1)).is_err());
    }

    #[test]
    fn pool_rejects_garbage_addresses() {
        let servers = vec!["not-an-ip".to_string()];
        assert!(ResolverPool::new(&servers, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn pool_round_robins() {
        let servers: Vec<String> = PUBLIC_RESOLVERS[..3].iter().map(|s| s.to_string()).collect();
        let pool = ResolverPool::new(&servers, Duration::from_secs(1)).unwrap();
        assert_eq!(pool.len(), 3);
        let (first, _) = pool.next_resolver();
        let (second, _) = pool.next_resolver();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn degraded_servers_leave_the_rotation() {
        let servers: Vec<String> = PUBLIC_RESOLVERS[..2].iter().map(|s| s.to_string()).collect();
        let pool = ResolverPool::new(&servers, Duration::from_secs(1)).unwrap();
        for _ in 0..DEGRADE_THRESHOLD {
            pool.record_outcome(0, false);
        }
        for _ in 0..4 {
            let (idx, _) = pool.next_resolver();
            assert_eq!(idx, 1);
        }
        // Recovery clears the strike count.
        pool.record_outcome(0, true);
        let picked: Vec<usize> = (0..4).map(|_| pool.next_resolver().0).collect();
        assert!(picked.contains(&0));
    }
}
