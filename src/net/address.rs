//! Address handling: netblock/ASN annotation and reverse sweeps.
//!
//! Every resolved address flows in on `NewAddress`. The owning netblock is
//! looked up (or pulled from the cache), a fresh ASN is announced on the
//! bus, and the surrounding sweep window is handed straight to the DNS
//! service as reverse-lookup requests. Sweep duplicates are suppressed
//! across windows by a dedicated string filter.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{Delivery, Event, EventBus, Topic};
use crate::config::Config;
use crate::dns::pool::NameResolver;
use crate::dns::DnsService;
use crate::filter::StringFilter;
use crate::net::netblock::NetblockCache;
use crate::net::sweep;
use crate::service::{drain_queue, wait_while_paused, Service, ServiceBase};
use crate::types::Request;

const SWEEP_FILTER_CAPACITY: usize = 1 << 18;

pub struct AddrService {
    base: ServiceBase,
    bus: Arc<EventBus>,
    netblocks: NetblockCache,
    sweep_filter: StringFilter,
    dns: Arc<DnsService>,
}

impl AddrService {
    pub fn new(
        config: Arc<Config>,
        bus: Arc<EventBus>,
        resolver: Arc<dyn NameResolver>,
        dns: Arc<DnsService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: ServiceBase::new("Address Service", config.timing.queue_len()),
            netblocks: NetblockCache::new(resolver),
            sweep_filter: StringFilter::spawn(SWEEP_FILTER_CAPACITY),
            bus,
            dns,
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
        let (block, cached) = self.netblocks.get(addr).await;
        if !cached && block.asn != 0 {
            self.bus.publish(
                Topic::NewAsn,
                Event::Asn(block.asn, block.description.clone()),
            );
        }

        // Annotated context rides along on every reverse request the sweep
        // produces.
        let mut swept = req;
        swept.netblock = Some(block.cidr.to_string());
        swept.asn = Some(block.asn);
        swept.isp = Some(block.description.clone());

        let quit = self.base.quit();
        for ip in sweep::sweep_addresses(addr, &block.cidr) {
            if quit.is_cancelled() {
                return;
            }
            if self.sweep_filter.duplicate(&ip.to_string()).await {
                continue;
            }
            let mut reverse = Request::reverse(ip, &swept.domain);
            reverse.netblock = swept.netblock.clone();
            reverse.asn = swept.asn;
            reverse.isp = swept.isp.clone();
            self.dns.base().send_request(reverse);
        }
    }
}

#[async_trait]
impl Service for AddrService {
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
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use crate::config::Timing;
    use crate::dns::testing::MockResolver;
    use crate::service;
    use crate::service::flow::FlowLimiter;
    use crate::types::Tag;

    fn harness() -> (Arc<AddrService>, Arc<DnsService>, Arc<EventBus>, Arc<MockResolver>) {
        let mut cfg = Config::new();
        cfg.timing = Timing::Insane;
        cfg.add_domain("example.com");
        let cfg = Arc::new(cfg);
        let bus = EventBus::new();
        let resolver = MockResolver::new();
        let flow = FlowLimiter::new(1000, 1000.0, CancellationToken::new());
        let dns = DnsService::new(cfg.clone(), bus.clone(), resolver.clone(), flow);
        let addr = AddrService::new(cfg, bus.clone(), resolver.clone(), dns.clone());
        (addr, dns, bus, resolver)
    }

    #[tokio::test]
    async fn sweep_feeds_reverse_requests_to_dns() {
        let (addr_svc, dns, bus, resolver) = harness();
        resolver.answer(
            "100.0.0.10.origin.asn.cymru.com",
            hickory_resolver::proto::rr::RecordType::TXT,
            "64512 | 10.0.0.0/24 | US | arin | 2020-01-01",
        );
        let (asn_tx, mut asn_rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(Topic::NewAsn, Delivery::Sync, move |ev| {
            if let Event::Asn(asn, desc) = ev {
                let _ = asn_tx.send((asn, desc));
            }
        });
        let dyn_svc: Arc<dyn Service> = addr_svc.clone();
        service::start(&dyn_svc).unwrap();

        let mut req = Request::candidate("www.example.com", "example.com", Tag::Dns, "DNS");
        req.address = Some("10.0.0.100".parse().unwrap());
        addr_svc.base().send_request(req.clone());

        // DNS service is not started, so its queue holds the sweep window.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(dns.base().pending(), 200);

        let (asn, _) = tokio::time::timeout(Duration::from_secs(1), asn_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(asn, 64512);

        // A second address in the same block: cached netblock, no second
        // ASN announcement, duplicate windows suppressed.
        let mut req2 = req;
        req2.address = Some("10.0.0.101".parse().unwrap());
        addr_svc.base().send_request(req2);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(dns.base().pending(), 201, "only the new edge address is swept");
        assert!(asn_rx.try_recv().is_err());
    }
}
