//! DNS wildcard detection.
//!
//! Zones that answer arbitrary labels with a fixed record set would flood
//! the enumeration with junk. Before a resolved name is accepted, every
//! suffix between it and its root is probed once with random unlikely
//! labels; answers matching a wildcard's trained set are rejected. Entries
//! are memoised for the life of the process; the cache never evicts because
//! an enumeration is short-lived.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use hickory_resolver::proto::rr::RecordType;
use rand::Rng;

use crate::dns::pool::NameResolver;
use crate::types::DnsAnswer;
use crate::utils;

const NUM_PROBES: usize = 3;
const PROBE_LABEL_LEN: usize = 15;

pub struct WildcardEntry {
    pub has_wildcard: bool,
    pub answers: AHashSet<String>,
}

pub struct WildcardDetector {
    resolver: Arc<dyn NameResolver>,
    // tokio mutex: held across probe queries so concurrent requests for the
    // same subdomain resolve it exactly once.
    cache: tokio::sync::Mutex<AHashMap<String, Arc<WildcardEntry>>>,
}

impl WildcardDetector {
    pub fn new(resolver: Arc<dyn NameResolver>) -> Self {
        Self {
            resolver,
            cache: tokio::sync::Mutex::new(AHashMap::new()),
        }
    }

    /// True when any of the request's answers matches a wildcard trained at
    /// any suffix of `name` above `root`.
    pub async fn matches(&self, name: &str, root: &str, answers: &[DnsAnswer]) -> bool {
        for suffix in wildcard_suffixes(name, root) {
            let entry = self.entry_for(&suffix).await;
            if entry.has_wildcard && answers.iter().any(|a| entry.answers.contains(&a.data)) {
                return true;
            }
        }
        false
    }

    async fn entry_for(&self, subdomain: &str) -> Arc<WildcardEntry> {
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.get(subdomain) {
            return entry.clone();
        }
        let entry = Arc::new(self.probe(subdomain).await);
        if entry.has_wildcard {
            tracing::info!(subdomain = %subdomain, "wildcard detected");
        }
        cache.insert(subdomain.to_string(), entry.clone());
        entry
    }

    /// Resolve a handful of labels no real zone would define; any answer
    /// marks the subdomain as wildcarded and trains the match set.
    async fn probe(&self, subdomain: &str) -> WildcardEntry {
        let mut answers = AHashSet::new();
        for _ in 0..NUM_PROBES {
            let name = format!("{}.{}", unlikely_label(), subdomain);
            for rtype in [RecordType::A, RecordType::AAAA, RecordType::CNAME] {
                if let Ok(found) = self.resolver.query(&name, rtype).await {
                    for ans in found {
                        answers.insert(ans.data);
                    }
                }
            }
        }
        WildcardEntry {
            has_wildcard: !answers.is_empty(),
            answers,
        }
    }
}

/// Every suffix of `name` that is longer than or equal to `root`, excluding
/// `name` itself: for `a.b.example.com` under `example.com`, yields
/// `b.example.com` then `example.com`.
pub fn wildcard_suffixes(name: &str, root: &str) -> Vec<String> {
    let name_labels = utils::labels(name);
    let root_len = utils::labels(root).len();
    let mut out = Vec::new();
    if name_labels.len() <= root_len {
        return out;
    }
    for i in 1..=(name_labels.len() - root_len) {
        out.push(name_labels[i..].join("."));
    }
    out
}

fn unlikely_label() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let mut label = String::with_capacity(PROBE_LABEL_LEN);
    // Leading character stays alphabetic.
    label.push(char::from(b'a' + rng.gen_range(0..26)));
    for _ in 1..PROBE_LABEL_LEN {
        label.push(char::from(CHARSET[rng.gen_range(0..CHARSET.len())]));
    }
    label
}
