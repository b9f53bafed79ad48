//! Central dedup and scope gate.
//!
//! Every candidate name from every producer passes through here exactly
//! once; this is the only component permitted to emit into `ResolveName`,
//! which is what breaks the otherwise cyclic name → DNS → name feedback.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{Delivery, Event, EventBus, Topic};
use crate::config::Config;
use crate::filter::StringFilter;
use crate::service::flow::FlowLimiter;
use crate::service::{drain_queue, wait_while_paused, Service, ServiceBase};
use crate::types::Request;
use crate::utils;

const FILTER_CAPACITY: usize = 1 << 20;

/// URL-encoding residue that scraped names regularly drag in.
const GARBAGE_PREFIXES: &[&str] = &["252f", "2f", "3d"];

pub struct NameService {
    base: ServiceBase,
    config: Arc<Config>,
    bus: Arc<EventBus>,
    filter: StringFilter,
    flow: Arc<FlowLimiter>,
}

impl NameService {
    pub fn new(config: Arc<Config>, bus: Arc<EventBus>, flow: Arc<FlowLimiter>) -> Arc<Self> {
        Arc::new(Self {
            base: ServiceBase::new("Name Service", config.timing.queue_len()),
            filter: StringFilter::spawn(FILTER_CAPACITY),
            config,
            bus,
            flow,
        })
    }

    pub fn subscribe(self: &Arc<Self>) -> Vec<(Topic, u64)> {
        let svc = self.clone();
        let id = self.bus.subscribe(Topic::NewName, Delivery::Async, move |ev| {
            if let Event::Name(req) = ev {
                svc.base.send_request((*req).clone());
            }
        });
        vec![(Topic::NewName, id)]
    }

    async fn process(&self, req: Request) {
        let name = clean_name(&req.name);
        if name.is_empty() || self.config.blacklisted(&name) {
            return;
        }
        // Root inference doubles as the scope gate: no configured root, no
        // entry into the pipeline.
        let Some(root) = self.config.root_of(&name) else {
            return;
        };
        if !self.config.in_scope(&name) {
            return;
        }
        if self.filter.duplicate(&name).await {
            return;
        }

        // Tag and source stick from the first sighting.
        let mut checked = req;
        checked.name = name;
        checked.domain = root;
        let checked = Arc::new(checked);
        self.bus
            .publish(Topic::Checked, Event::Name(checked.clone()));

        if self.config.passive {
            return;
        }
        if !self.flow.acquire().await {
            return;
        }
        self.bus
            .publish(Topic::ResolveName, Event::Name(checked));
    }
}

/// Lowercase, strip the trailing dot and peel off hex-encoding garbage
/// scraped out of URLs.
pub fn clean_name(raw: &str) -> String {
    let mut name = utils::normalize_name(raw);
    loop {
        let mut stripped = false;
        for prefix in GARBAGE_PREFIXES {
            if let Some(rest) = name.strip_prefix(prefix) {
                name = rest.to_string();
                stripped = true;
            }
        }
        if !stripped {
            break;
        }
    }
    name.trim_start_matches('.').to_string()
}

#[async_trait]
impl Service for NameService {
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
    use crate::service;
    use crate::types::Tag;

    #[test]
    fn cleaning_strips_encoding_garbage() {
        assert_eq!(clean_name("2Fwww.Example.com."), "www.example.com");
        assert_eq!(clean_name("252fadmin.example.com"), "admin.example.com");
        assert_eq!(clean_name("3dmail.example.com"), "mail.example.com");
        assert_eq!(clean_name(".example.com"), "example.com");
        assert_eq!(clean_name("plain.example.com"), "plain.example.com");
    }

    fn harness(passive: bool) -> (Arc<NameService>, Arc<EventBus>) {
        let mut cfg = Config::new();
        cfg.timing = Timing::Insane;
        cfg.passive = passive;
        cfg.add_domain("example.com");
        let bus = EventBus::new();
        let flow = FlowLimiter::new(1000, 1000.0, CancellationToken::new());
        let svc = NameService::new(Arc::new(cfg), bus.clone(), flow);
        (svc, bus)
    }

    fn collect(bus: &EventBus, topic: Topic) -> tokio::sync::mpsc::UnboundedReceiver<Arc<Request>> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(topic, Delivery::Sync, move |ev| {
            if let Event::Name(req) = ev {
                let _ = tx.send(req);
            }
        });
        rx
    }

    #[tokio::test]
    async fn first_sight_flows_to_resolution() {
        let (svc, bus) = harness(false);
        let mut resolve = collect(&bus, Topic::ResolveName);
        let dyn_svc: Arc<dyn Service> = svc.clone();
        service::start(&dyn_svc).unwrap();

        svc.base()
            .send_request(Request::candidate("WWW.example.com.", "", Tag::Scrape, "test"));
        let req = tokio::time::timeout(Duration::from_secs(2), resolve.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.name, "www.example.com");
        assert_eq!(req.domain, "example.com");
        assert_eq!(req.tag, Tag::Scrape);
    }

    #[tokio::test]
    async fn duplicates_and_out_of_scope_are_dropped() {
        let (svc, bus) = harness(false);
        let mut resolve = collect(&bus, Topic::ResolveName);
        let dyn_svc: Arc<dyn Service> = svc.clone();
        service::start(&dyn_svc).unwrap();

        for _ in 0..3 {
            svc.base()
                .send_request(Request::candidate("www.example.com", "", Tag::Dns, "test"));
        }
        svc.base()
            .send_request(Request::candidate("www.evil.org", "", Tag::Dns, "test"));

        let first = tokio::time::timeout(Duration::from_secs(2), resolve.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.name, "www.example.com");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(resolve.try_recv().is_err());
    }

    #[tokio::test]
    async fn passive_mode_stops_at_checked() {
        let (svc, bus) = harness(true);
        let mut checked = collect(&bus, Topic::Checked);
        let mut resolve = collect(&bus, Topic::ResolveName);
        let dyn_svc: Arc<dyn Service> = svc.clone();
        service::start(&dyn_svc).unwrap();

        svc.base()
            .send_request(Request::candidate("api.example.com", "", Tag::Cert, "test"));
        let req = tokio::time::timeout(Duration::from_secs(2), checked.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.name, "api.example.com");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(resolve.try_recv().is_err());
    }
}
