//! In-memory resolver for engine tests and data-source development.
//!
//! Scripted answers keyed by `(name, record type)`, optional wildcard zones
//! answering every label with a fixed address, an all-failures mode for
//! unreachable-network scenarios, and a query log for asserting on exactly
//! what reached the wire.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use hickory_resolver::proto::rr::RecordType;
use parking_lot::Mutex;

use crate::dns::pool::{NameResolver, ResolveFailure};
use crate::types::DnsAnswer;
use crate::utils;

#[derive(Default)]
pub struct MockResolver {
    answers: Mutex<AHashMap<(String, u16), Vec<DnsAnswer>>>,
    wildcard_zones: Mutex<Vec<(String, String)>>,
    fail_all: AtomicBool,
    queries: Mutex<Vec<(String, u16)>>,
}

impl MockResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(&self, name: &str, rtype: RecordType, data: &str) {
        let name = utils::normalize_name(name);
        let rr_type = u16::from(rtype);
        let answer = DnsAnswer::new(&name, rr_type, 60, data);
        self.answers
            .lock()
            .entry((name, rr_type))
            .or_default()
            .push(answer);
    }

    /// Convenience for the common A-record case.
    pub fn a(&self, name: &str, ip: &str) {
        self.answer(name, RecordType::A, ip);
    }

    /// Map `addr` back to `target` for reverse lookups.
    pub fn ptr(&self, addr: &str, target: &str) {
        let answer = DnsAnswer::new(addr, u16::from(RecordType::PTR), 60, target);
        self.answers
            .lock()
            .entry((addr.to_string(), u16::from(RecordType::PTR)))
            .or_default()
            .push(answer);
    }

    /// Answer every label under `zone` with one fixed A record.
    pub fn wildcard_zone(&self, zone: &str, ip: &str) {
        self.wildcard_zones
            .lock()
            .push((utils::normalize_name(zone), ip.to_string()));
    }

    /// Simulate a fully unreachable resolver set.
    pub fn fail_all(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    pub fn queries(&self) -> Vec<(String, u16)> {
        self.queries.lock().clone()
    }

    /// Distinct names that reached the resolver, in first-seen order.
    pub fn queried_names(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for (name, _) in self.queries.lock().iter() {
            if !seen.contains(name) {
                seen.push(name.clone());
            }
        }
        seen
    }
}

#[async_trait]
impl NameResolver for MockResolver {
    async fn query(
        &self,
        name: &str,
        rtype: RecordType,
    ) -> Result<Vec<DnsAnswer>, ResolveFailure> {
        let name = utils::normalize_name(name);
        let rr_type = u16::from(rtype);
        self.queries.lock().push((name.clone(), rr_type));
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(ResolveFailure::Timeout);
        }
        if let Some(found) = self.answers.lock().get(&(name.clone(), rr_type)) {
            return Ok(found.clone());
        }
        if rtype == RecordType::A {
            for (zone, ip) in self.wildcard_zones.lock().iter() {
                if name.ends_with(&format!(".{zone}")) {
                    return Ok(vec![DnsAnswer::new(&name, rr_type, 60, ip)]);
                }
            }
        }
        Ok(Vec::new())
    }

    async fn reverse(&self, addr: IpAddr) -> Result<Vec<DnsAnswer>, ResolveFailure> {
        let key = (addr.to_string(), u16::from(RecordType::PTR));
        self.queries.lock().push(key.clone());
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(ResolveFailure::Timeout);
        }
        Ok(self.answers.lock().get(&key).cloned().unwrap_or_default())
    }
}
