//! Active TLS certificate pulls.
//!
//! Off by default. Each in-scope address is dialed on the configured ports
//! with certificate verification disabled; the leaf's common name and DNS
//! SANs come back as `cert`-tagged candidates, IP SANs feed the sweep
//! pipeline, and newly-seen registered domains can grow the configuration
//! when `additional_domains` allows it.

use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use hickory_resolver::proto::rr::RecordType;
use openssl::nid::Nid;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};

use crate::bus::{Delivery, Event, EventBus, Topic};
use crate::config::Config;
use crate::dns::pool::NameResolver;
use crate::service::flow::FlowLimiter;
use crate::service::{drain_queue, wait_while_paused, Service, ServiceBase};
use crate::types::{Request, Tag};
use crate::utils;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const IO_DEADLINE: Duration = Duration::from_secs(2);

/// Names and addresses extracted from one leaf certificate.
#[derive(Debug, Default)]
pub struct CertInfo {
    pub names: Vec<String>,
    pub addresses: Vec<IpAddr>,
}

pub struct CertService {
    base: ServiceBase,
    config: Arc<Config>,
    bus: Arc<EventBus>,
    flow: Arc<FlowLimiter>,
    resolver: Arc<dyn NameResolver>,
    probed: DashSet<String>,
    ns_checked: DashMap<String, bool>,
}

impl CertService {
    pub fn new(
        config: Arc<Config>,
        bus: Arc<EventBus>,
        flow: Arc<FlowLimiter>,
        resolver: Arc<dyn NameResolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: ServiceBase::new("Active Certificates", config.timing.queue_len()),
            config,
            bus,
            flow,
            resolver,
            probed: DashSet::new(),
            ns_checked: DashMap::new(),
        })
    }

    pub fn subscribe(self: &Arc<Self>) -> Vec<(Topic, u64)> {
        let svc = self.clone();
        let id = self.bus.subscribe(Topic::NewAddress, Delivery::Async, move |ev| {
            if let Event::Name(req) = ev {
                if req.address.is_some() {
                    svc.base.send_request((*req).clone());
                }
            }
        });
        vec![(Topic::NewAddress, id)]
    }

    async fn process(&self, req: Request) {
        let Some(addr) = req.address else { return };
        // One probe per address, however many names resolve onto it.
        if !self.probed.insert(addr.to_string()) {
            return;
        }
        for port in self.config.ports.clone() {
            if self.base.quit().is_cancelled() {
                return;
            }
            self.base.set_active();
            let sockaddr = SocketAddr::new(addr, port);
            let pulled =
                tokio::task::spawn_blocking(move || pull_cert(sockaddr)).await;
            let Ok(Ok(info)) = pulled else { continue };
            tracing::debug!(%sockaddr, names = info.names.len(), "pulled certificate");
            for name in info.names {
                self.handle_cert_name(&name).await;
            }
            for ip in info.addresses {
                let mut san = Request::candidate("", &req.domain, Tag::Cert, "Active Cert");
                san.address = Some(ip);
                self.bus.publish(Topic::NewAddress, Event::Name(Arc::new(san)));
            }
        }
    }

    async fn handle_cert_name(&self, raw: &str) {
        let name = clean_cert_name(raw);
        if name.is_empty() {
            return;
        }
        let root = match self.config.root_of(&name) {
            Some(root) => root,
            None if self.config.additional_domains => {
                let Some(root) = self.candidate_root(&name).await else {
                    return;
                };
                if !self.config.add_domain(&root) && !self.config.is_domain(&root) {
                    return;
                }
                tracing::info!(domain = %root, "certificate revealed a new root domain");
                root
            }
            None => return,
        };
        if !self.flow.acquire().await {
            return;
        }
        self.bus.publish(
            Topic::NewName,
            Event::Name(Arc::new(Request::candidate(&name, &root, Tag::Cert, "Active Cert"))),
        );
    }

    /// Registered-domain guess for an out-of-scope SAN, confirmed by the
    /// zone actually having name servers.
    async fn candidate_root(&self, name: &str) -> Option<String> {
        let name_labels = utils::labels(name);
        if name_labels.len() < 2 {
            return None;
        }
        let root = name_labels[name_labels.len() - 2..].join(".");
        if let Some(known) = self.ns_checked.get(&root) {
            return (*known).then(|| root.clone());
        }
        let has_ns = matches!(
            self.resolver.query(&root, RecordType::NS).await,
            Ok(answers) if !answers.is_empty()
        );
        self.ns_checked.insert(root.clone(), has_ns);
        has_ns.then_some(root)
    }
}

/// Strip wildcard markers and normalize a certificate subject name.
pub fn clean_cert_name(raw: &str) -> String {
    let mut name = utils::normalize_name(raw);
    while let Some(rest) = name.strip_prefix("*.") {
        name = rest.to_string();
    }
    name.trim_start_matches('.').to_string()
}

/// Blocking TLS dial and leaf-certificate extraction; runs on the blocking
/// pool. Verification is disabled on purpose: self-signed and expired
/// certificates still carry names.
fn pull_cert(addr: SocketAddr) -> anyhow::Result<CertInfo> {
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(IO_DEADLINE))?;
    stream.set_write_timeout(Some(IO_DEADLINE))?;

    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_verify(SslVerifyMode::NONE);
    let connector = builder.build();
    let mut ssl = connector.configure()?;
    ssl.set_verify_hostname(false);
    ssl.set_use_server_name_indication(false);
    let stream = ssl
        .connect("", stream)
        .map_err(|e| anyhow::anyhow!("TLS handshake with {addr} failed: {e}"))?;

    let cert = stream
        .ssl()
        .peer_certificate()
        .ok_or_else(|| anyhow::anyhow!("no peer certificate from {addr}"))?;

    let mut info = CertInfo::default();
    for entry in cert.subject_name().entries_by_nid(Nid::COMMONNAME) {
        if let Ok(cn) = entry.data().as_utf8() {
            info.names.push(cn.to_string());
        }
    }
    if let Some(sans) = cert.subject_alt_names() {
        for san in sans.iter() {
            if let Some(dns) = san.dnsname() {
                info.names.push(dns.to_string());
            }
            if let Some(bytes) = san.ipaddress() {
                match bytes.len() {
                    4 => {
                        let octets: [u8; 4] = bytes.try_into().unwrap_or_default();
                        info.addresses.push(IpAddr::from(octets));
                    }
                    16 => {
                        let octets: [u8; 16] = bytes.try_into().unwrap_or_default();
                        info.addresses.push(IpAddr::from(octets));
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(info)
}

#[async_trait]
impl Service for CertService {
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
                        self.process(req).await;
                        self.base.mark_processed();
                    }
                    None => break,
                }
            }
        }
        drain_queue(&self.base, &mut rx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    use crate::config::Timing;
    use crate::dns::testing::MockResolver;

    #[test]
    fn wildcard_markers_are_stripped() {
        assert_eq!(clean_cert_name("*.bar.example.com"), "bar.example.com");
        assert_eq!(clean_cert_name("*.*.deep.example.com"), "deep.example.com");
        assert_eq!(clean_cert_name("FOO.Example.COM."), "foo.example.com");
        assert_eq!(clean_cert_name("*."), "");
    }

    fn harness(additional: bool) -> (Arc<CertService>, Arc<EventBus>, Arc<MockResolver>) {
        let mut cfg = Config::new();
        cfg.timing = Timing::Insane;
        cfg.active = true;
        cfg.additional_domains = additional;
        cfg.add_domain("example.com");
        let bus = EventBus::new();
        let resolver = MockResolver::new();
        let flow = FlowLimiter::new(1000, 1000.0, CancellationToken::new());
        let svc = CertService::new(Arc::new(cfg), bus.clone(), flow, resolver.clone());
        (svc, bus, resolver)
    }

    #[tokio::test]
    async fn in_scope_san_names_become_candidates() {
        let (svc, bus, _) = harness(false);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(Topic::NewName, Delivery::Sync, move |ev| {
            if let Event::Name(req) = ev {
                let _ = tx.send(req.name.clone());
            }
        });

        svc.handle_cert_name("foo.example.com").await;
        svc.handle_cert_name("*.bar.example.com").await;
        svc.handle_cert_name("other.org").await;

        assert_eq!(rx.recv().await.as_deref(), Some("foo.example.com"));
        assert_eq!(rx.recv().await.as_deref(), Some("bar.example.com"));
        assert!(rx.try_recv().is_err(), "out-of-scope SAN must not pass");
    }

    #[tokio::test]
    async fn additional_domains_require_name_servers() {
        let (svc, bus, resolver) = harness(true);
        resolver.answer("delegated.org", RecordType::NS, "ns1.delegated.org");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(Topic::NewName, Delivery::Sync, move |ev| {
            if let Event::Name(req) = ev {
                let _ = tx.send(req.name.clone());
            }
        });

        svc.handle_cert_name("api.delegated.org").await;
        assert_eq!(rx.recv().await.as_deref(), Some("api.delegated.org"));
        assert!(svc.config.is_domain("delegated.org"));

        svc.handle_cert_name("www.undelegated.net").await;
        assert!(rx.try_recv().is_err(), "no NS records, no new root");
    }
}
