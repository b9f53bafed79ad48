use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::RwLock;
use regex::Regex;

use crate::utils;

/// Timing profile controlling system-wide pacing, nmap style (-T0..-T5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timing {
    Paranoid,
    Sneaky,
    Polite,
    Normal,
    Aggressive,
    Insane,
}

impl Timing {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Timing::Paranoid,
            1 => Timing::Sneaky,
            2 => Timing::Polite,
            4 => Timing::Aggressive,
            5 => Timing::Insane,
            _ => Timing::Normal,
        }
    }

    /// Maximum in-flight candidate emissions (MaxFlow tokens).
    pub fn max_flow(&self) -> usize {
        match self {
            Timing::Paranoid => 5,
            Timing::Sneaky => 10,
            Timing::Polite => 25,
            Timing::Normal => 100,
            Timing::Aggressive => 500,
            Timing::Insane => 1000,
        }
    }

    /// Tokens released back into the flow semaphore per second.
    pub fn release_per_sec(&self) -> f64 {
        self.max_flow() as f64
    }

    /// Inter-attempt delay for DNS retries and SRV probe pacing.
    pub fn frequency(&self) -> Duration {
        match self {
            Timing::Paranoid => Duration::from_millis(500),
            Timing::Sneaky => Duration::from_millis(250),
            Timing::Polite => Duration::from_millis(100),
            Timing::Normal => Duration::from_millis(50),
            Timing::Aggressive => Duration::from_millis(20),
            Timing::Insane => Duration::from_millis(10),
        }
    }

    /// Bound for every service's inbound request queue.
    pub fn queue_len(&self) -> usize {
        self.max_flow() * 100
    }
}

/// Engine configuration. Immutable once the enumeration starts; the only
/// post-start mutation is root-domain addition via the certificate service
/// when `additional_domains` is set.
pub struct Config {
    domains: RwLock<Vec<String>>,
    regexes: RwLock<AHashMap<String, Regex>>,
    started: AtomicBool,

    pub blacklist: HashSet<String>,
    pub wordlist: Vec<String>,
    pub resolvers: Vec<String>,
    pub ports: Vec<u16>,
    pub brute_forcing: bool,
    pub recursive: bool,
    pub min_for_recursive: usize,
    pub alterations: bool,
    pub active: bool,
    pub passive: bool,
    pub additional_domains: bool,
    pub timing: Timing,
    /// Hard fail-safe: the enumeration stops after this much output idleness.
    pub watchdog: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domains: RwLock::new(Vec::new()),
            regexes: RwLock::new(AHashMap::new()),
            started: AtomicBool::new(false),
            blacklist: HashSet::new(),
            wordlist: Vec::new(),
            resolvers: Vec::new(),
            ports: vec![443],
            brute_forcing: false,
            recursive: true,
            min_for_recursive: 1,
            alterations: false,
            active: false,
            passive: false,
            additional_domains: false,
            timing: Timing::Normal,
            watchdog: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Register a root domain. Insertion-ordered and deduplicated; rejected
    /// after start unless `additional_domains` allows runtime growth.
    pub fn add_domain(&self, domain: &str) -> bool {
        let domain = utils::normalize_name(domain);
        if domain.is_empty() {
            return false;
        }
        if self.started.load(Ordering::SeqCst) && !self.additional_domains {
            tracing::debug!(domain = %domain, "domain addition rejected after start");
            return false;
        }
        let regex = match subdomain_regex(&domain) {
            Some(r) => r,
            None => return false,
        };
        let mut domains = self.domains.write();
        if domains.iter().any(|d| d == &domain) {
            return false;
        }
        domains.push(domain.clone());
        self.regexes.write().insert(domain, regex);
        true
    }

    pub fn domains(&self) -> Vec<String> {
        self.domains.read().clone()
    }

    pub fn is_domain(&self, name: &str) -> bool {
        let name = utils::normalize_name(name);
        self.domains.read().iter().any(|d| d == &name)
    }

    /// Longest configured root that `name` falls under.
    pub fn root_of(&self, name: &str) -> Option<String> {
        utils::sub_to_domain(name, &self.domains.read())
    }

    /// True when `name` matches the subdomain pattern of its root.
    pub fn in_scope(&self, name: &str) -> bool {
        let name = utils::normalize_name(name);
        let Some(root) = self.root_of(&name) else {
            return false;
        };
        self.regexes
            .read()
            .get(&root)
            .map(|r| r.is_match(&name))
            .unwrap_or(false)
    }

    pub fn blacklisted(&self, name: &str) -> bool {
        let name = utils::normalize_name(name);
        self.blacklist
            .iter()
            .any(|b| name == *b || name.ends_with(&format!(".{}", b)))
    }

    /// Startup validation; resource problems are fatal before enumeration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.domains.read().is_empty() {
            anyhow::bail!("no root domains configured");
        }
        if !self.passive && self.resolvers.is_empty() {
            anyhow::bail!("no DNS resolvers configured");
        }
        if self.brute_forcing && self.wordlist.is_empty() {
            anyhow::bail!("brute forcing enabled with an empty wordlist");
        }
        if self.min_for_recursive < 1 {
            anyhow::bail!("min_for_recursive must be at least 1");
        }
        Ok(())
    }
}

/// Anchored pattern matching the root itself and any subdomain of it.
fn subdomain_regex(domain: &str) -> Option<Regex> {
    let pattern = format!(
        r"^(?i)(([a-z0-9_]([a-z0-9_-]{{0,61}}[a-z0-9_])?)\.)*{}$",
        regex::escape(domain)
    );
    Regex::new(&pattern).ok()
}
