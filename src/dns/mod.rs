//! DNS resolution service: forward and reverse resolution, wildcard
//! filtering, subdomain discovery with basic/SRV queries, and optional zone
//! transfers in active mode.

pub mod axfr;
pub mod pool;
pub mod testing;
pub mod wildcard;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::proto::rr::RecordType;
use tokio::sync::Semaphore;

use crate::bus::{Event, EventBus, Topic};
use crate::config::Config;
use crate::service::flow::FlowLimiter;
use crate::service::{drain_queue, wait_while_paused, Service, ServiceBase};
use crate::types::{DnsAnswer, Request, Tag};
use crate::utils;

use pool::{NameResolver, ResolveFailure};
use wildcard::WildcardDetector;

/// SRV names worth probing on every newly-observed subdomain.
const POPULAR_SRV_NAMES: &[&str] = &[
    "_autodiscover._tcp",
    "_caldav._tcp",
    "_caldavs._tcp",
    "_carddav._tcp",
    "_carddavs._tcp",
    "_ftp._tcp",
    "_imap._tcp",
    "_imaps._tcp",
    "_jabber._tcp",
    "_kerberos._tcp",
    "_kerberos._udp",
    "_ldap._tcp",
    "_matrix._tcp",
    "_minecraft._tcp",
    "_mysql._tcp",
    "_ntp._udp",
    "_pop3._tcp",
    "_pop3s._tcp",
    "_sip._tcp",
    "_sip._udp",
    "_sips._tcp",
    "_smtp._tcp",
    "_stun._tcp",
    "_stun._udp",
    "_submission._tcp",
    "_turn._tcp",
    "_vnc._tcp",
    "_xmpp-client._tcp",
    "_xmpp-server._tcp",
];

pub struct DnsService {
    base: ServiceBase,
    config: Arc<Config>,
    bus: Arc<EventBus>,
    resolver: Arc<dyn NameResolver>,
    wildcards: WildcardDetector,
    sub_counts: DashMap<String, usize>,
    flow: Arc<FlowLimiter>,
    inflight: Arc<Semaphore>,
}

impl DnsService {
    pub fn new(
        config: Arc<Config>,
        bus: Arc<EventBus>,
        resolver: Arc<dyn NameResolver>,
        flow: Arc<FlowLimiter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: ServiceBase::new("DNS Service", config.timing.queue_len()),
            wildcards: WildcardDetector::new(resolver.clone()),
            sub_counts: DashMap::new(),
            inflight: Arc::new(Semaphore::new(config.timing.max_flow())),
            config,
            bus,
            resolver,
            flow,
        })
    }

    /// Per-tag retry policy: scraped and archived names have earned more
    /// patience than generated guesses.
    fn retry_attempts(tag: Tag) -> usize {
        match tag {
            Tag::Scrape | Tag::Archive | Tag::Dns => 3,
            _ => 1,
        }
    }

    async fn query_with_retry(
        &self,
        name: &str,
        rtype: RecordType,
        attempts: usize,
    ) -> Result<Vec<DnsAnswer>, ResolveFailure> {
        let mut last = ResolveFailure::Timeout;
        for attempt in 0..attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.config.timing.frequency()).await;
            }
            match self.resolver.query(name, rtype).await {
                Ok(found) => return Ok(found),
                Err(err) => {
                    tracing::trace!(name = %name, ?rtype, attempt, %err, "query attempt failed");
                    last = err;
                }
            }
            if self.base.quit().is_cancelled() {
                break;
            }
        }
        Err(last)
    }

    /// Push a freshly-discovered candidate into the pipeline, respecting
    /// the global flow cap.
    async fn emit_candidate(&self, req: Request) {
        if req.name.is_empty() {
            return;
        }
        if !self.flow.acquire().await {
            return;
        }
        self.bus.publish(Topic::NewName, Event::Name(Arc::new(req)));
    }

    async fn process(self: &Arc<Self>, req: Request) {
        if req.name.is_empty() {
            if req.address.is_some() {
                self.process_reverse(req).await;
            }
            return;
        }
        // Sweeps may hand us bare address literals.
        if let Ok(addr) = req.name.parse::<IpAddr>() {
            let mut req = req;
            req.address = Some(addr);
            req.name.clear();
            self.process_reverse(req).await;
            return;
        }
        self.process_forward(req).await;
    }

    async fn process_forward(self: &Arc<Self>, req: Request) {
        let name = utils::normalize_name(&req.name);
        if name.is_empty() || self.config.blacklisted(&name) {
            return;
        }
        let root = if req.domain.is_empty() {
            match self.config.root_of(&name) {
                Some(r) => r,
                None => return,
            }
        } else {
            utils::normalize_name(&req.domain)
        };
        if !self.config.in_scope(&name) {
            return;
        }

        let attempts = Self::retry_attempts(req.tag);
        let mut answers: Vec<DnsAnswer> = Vec::new();

        if let Ok(found) = self.query_with_retry(&name, RecordType::CNAME, attempts).await {
            for ans in &found {
                // CNAME targets are how related names surface.
                self.emit_candidate(Request::candidate(&ans.data, "", Tag::Dns, "DNS"))
                    .await;
            }
            answers.extend(found);
        }
        for rtype in [RecordType::A, RecordType::AAAA] {
            if let Ok(found) = self.query_with_retry(&name, rtype, attempts).await {
                answers.extend(found);
            }
        }
        if answers.is_empty() {
            tracing::trace!(name = %name, "no answers");
            return;
        }
        if self.wildcards.matches(&name, &root, &answers).await {
            tracing::debug!(name = %name, "dropped wildcard match");
            return;
        }

        let address: Option<IpAddr> = answers
            .iter()
            .find(|a| a.rr_type == 1 || a.rr_type == 28)
            .and_then(|a| a.data.parse().ok());
        let resolved = Arc::new(Request {
            name: name.clone(),
            domain: root.clone(),
            records: answers,
            address,
            netblock: None,
            asn: None,
            isp: None,
            tag: req.tag,
            source: req.source.clone(),
        });

        self.bus
            .publish(Topic::NameResolved, Event::Name(resolved.clone()));
        for ip in resolved.addresses() {
            let mut addr_req = (*resolved).clone();
            addr_req.address = Some(ip);
            self.bus
                .publish(Topic::NewAddress, Event::Name(Arc::new(addr_req)));
        }
        self.check_subdomain(&resolved, &root);
    }

    async fn process_reverse(&self, req: Request) {
        let Some(addr) = req.address else { return };
        let mut result = Err(ResolveFailure::Timeout);
        for attempt in 0..Self::retry_attempts(Tag::Dns) {
            if attempt > 0 {
                tokio::time::sleep(self.config.timing.frequency()).await;
            }
            result = self.resolver.reverse(addr).await;
            if result.is_ok() || self.base.quit().is_cancelled() {
                break;
            }
        }
        let Ok(found) = result else { return };
        for ans in found {
            let target = utils::normalize_name(&ans.data);
            if target.is_empty() {
                continue;
            }
            let mut candidate = Request::candidate(&target, "", Tag::Dns, "Reverse DNS");
            candidate.address = Some(addr);
            self.emit_candidate(candidate).await;
        }
    }

    /// Count sightings of the name's immediate subdomain and, on first
    /// sight, explore it with basic queries, the SRV sweep and (in active
    /// mode) a zone transfer attempt.
    fn check_subdomain(self: &Arc<Self>, resolved: &Arc<Request>, root: &str) {
        let name_labels = utils::labels(&resolved.name);
        let root_len = utils::labels(root).len();
        if name_labels.len() <= root_len {
            return;
        }
        let sub = name_labels[1..].join(".");
        if sub != root && !sub.ends_with(&format!(".{root}")) {
            return;
        }
        let times = {
            let mut entry = self.sub_counts.entry(sub.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let sub_req = Arc::new(Request::candidate(&sub, root, Tag::Dns, "DNS"));
        self.bus
            .publish(Topic::NewSubdomain, Event::Subdomain(sub_req, times));
        if times == 1 {
            let svc = self.clone();
            let root = root.to_string();
            tokio::spawn(async move {
                svc.explore_subdomain(sub, root).await;
            });
        }
    }

    async fn explore_subdomain(self: Arc<Self>, sub: String, root: String) {
        let quit = self.base.quit();
        let frequency = self.config.timing.frequency();
        let mut ns_targets: Vec<String> = Vec::new();

        for rtype in [
            RecordType::NS,
            RecordType::MX,
            RecordType::TXT,
            RecordType::SOA,
        ] {
            if quit.is_cancelled() {
                return;
            }
            self.base.set_active();
            if let Ok(found) = self.resolver.query(&sub, rtype).await {
                for ans in found {
                    if rtype == RecordType::NS {
                        ns_targets.push(ans.data.clone());
                    }
                    if matches!(rtype, RecordType::NS | RecordType::MX) {
                        self.emit_candidate(Request::candidate(&ans.data, "", Tag::Dns, "DNS"))
                            .await;
                    }
                }
            }
            tokio::time::sleep(frequency).await;
        }

        for srv in POPULAR_SRV_NAMES {
            if quit.is_cancelled() {
                return;
            }
            self.base.set_active();
            let srv_name = format!("{srv}.{sub}");
            if let Ok(found) = self.resolver.query(&srv_name, RecordType::SRV).await {
                for ans in found {
                    self.emit_candidate(Request::candidate(&ans.name, &root, Tag::Dns, "DNS"))
                        .await;
                    self.emit_candidate(Request::candidate(&ans.data, "", Tag::Dns, "DNS"))
                        .await;
                }
            }
            tokio::time::sleep(frequency).await;
        }

        if self.config.active && !ns_targets.is_empty() {
            self.zone_transfers(&sub, &ns_targets).await;
        }
    }

    async fn zone_transfers(&self, sub: &str, ns_targets: &[String]) {
        for ns in ns_targets {
            let Ok(addrs) = self.resolver.query(ns, RecordType::A).await else {
                continue;
            };
            for ans in addrs {
                let Ok(ip) = ans.data.parse::<IpAddr>() else { continue };
                let server = SocketAddr::new(ip, 53);
                match axfr::zone_transfer(sub, server, axfr::AXFR_TIMEOUT).await {
                    Ok(records) => {
                        tracing::info!(zone = %sub, server = %server, records = records.len(),
                            "zone transfer succeeded");
                        for rr in records {
                            let mut req =
                                Request::candidate(&rr.name.clone(), "", Tag::Axfr, "DNS Zone XFER");
                            req.records = vec![rr];
                            self.emit_candidate(req).await;
                        }
                        return;
                    }
                    Err(err) => {
                        tracing::debug!(zone = %sub, server = %server, %err, "zone transfer failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Service for DnsService {
    fn base(&self) -> &ServiceBase {
        &self.base
    }

    async fn run(self: Arc<Self>) {
        let Some(mut rx) = self.base.take_queue() else {
            return;
        };
        let quit = self.base.quit();
        let mut pause_rx = self.base.pause_rx();
        loop {
            if !wait_while_paused(&self.base, &mut pause_rx).await {
                break;
            }
            tokio::select! {
                _ = quit.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(req) => {
                        self.base.set_active();
                        let svc = self.clone();
                        tokio::spawn(async move {
                            if let Ok(_permit) = svc.inflight.clone().acquire_owned().await {
                                svc.process(req).await;
                            }
                            svc.base.mark_processed();
                        });
                    }
                    None => break,
                }
            }
        }
        drain_queue(&self.base, &mut rx);
    }
}
