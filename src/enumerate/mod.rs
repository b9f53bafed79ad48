//! The enumeration coordinator: owns every service, paces emission through
//! the flow semaphore, watches for quiescence and terminates.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashSet;
use parking_lot::Mutex;

use crate::bus::{Delivery, Event, EventBus, Topic};
use crate::config::Config;
use crate::discover::alterations::AlterationsService;
use crate::discover::brute::BruteService;
use crate::discover::markov::MarkovService;
use crate::discover::names::NameService;
use crate::dns::pool::{NameResolver, ResolverPool, PUBLIC_RESOLVERS};
use crate::dns::DnsService;
use crate::net::address::AddrService;
use crate::net::cert::CertService;
use crate::service::flow::FlowLimiter;
use crate::service::{self, Service};
use crate::sources::crtsh::CrtshService;
use crate::sources::wayback::WaybackService;
use crate::types::{Request, Tag};
use tokio_util::sync::CancellationToken;

const DNS_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Enumeration {
    config: Arc<Config>,
    bus: Arc<EventBus>,
    quit: CancellationToken,
    resolver: Mutex<Option<Arc<dyn NameResolver>>>,
    data_sources: AtomicBool,
    output_seen: Mutex<AHashSet<String>>,
    output_count: AtomicUsize,
    last_output: Mutex<Instant>,
}

impl Enumeration {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            bus: EventBus::new(),
            quit: CancellationToken::new(),
            resolver: Mutex::new(None),
            data_sources: AtomicBool::new(true),
            output_seen: Mutex::new(AHashSet::new()),
            output_count: AtomicUsize::new(0),
            last_output: Mutex::new(Instant::now()),
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Swap the wire-backed resolver pool for another implementation;
    /// scenario tests script one instead of touching the network.
    pub fn set_resolver(&self, resolver: Arc<dyn NameResolver>) {
        *self.resolver.lock() = Some(resolver);
    }

    /// Skip the remote scrapers; brute force, alterations and anything fed
    /// through the bus still run.
    pub fn disable_data_sources(&self) {
        self.data_sources.store(false, Ordering::SeqCst);
    }

    /// Findings stream. Subscribe before calling [`run`]; the channel ends
    /// when the bus closes at shutdown.
    pub fn output_channel(&self) -> tokio::sync::mpsc::UnboundedReceiver<Arc<Request>> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.bus.subscribe(Topic::Output, Delivery::Sync, move |ev| {
            if let Event::Name(req) = ev {
                let _ = tx.send(req);
            }
        });
        rx
    }

    fn build_resolver(&self) -> anyhow::Result<Arc<dyn NameResolver>> {
        if let Some(resolver) = self.resolver.lock().clone() {
            return Ok(resolver);
        }
        let servers: Vec<String> = if self.config.resolvers.is_empty() {
            PUBLIC_RESOLVERS.iter().map(|s| s.to_string()).collect()
        } else {
            self.config.resolvers.clone()
        };
        Ok(Arc::new(ResolverPool::new(&servers, DNS_QUERY_TIMEOUT)?))
    }

    /// The final uniqueness and scope gate in front of `Output`. The cuckoo
    /// filter upstream is approximate; this set is exact.
    fn gate_output(&self, req: &Arc<Request>) {
        if !self.config.in_scope(&req.name) {
            return;
        }
        if !self.output_seen.lock().insert(req.name.clone()) {
            return;
        }
        self.output_count.fetch_add(1, Ordering::SeqCst);
        *self.last_output.lock() = Instant::now();
        self.bus.publish(Topic::Output, Event::Name(req.clone()));
    }

    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        let result = self.launch().await;
        if result.is_err() {
            // Close the bus so output consumers are not left waiting on a
            // stream that will never end.
            self.quit.cancel();
            self.bus.close();
        }
        result
    }

    async fn launch(self: &Arc<Self>) -> anyhow::Result<()> {
        self.config.validate()?;
        let passive = self.config.passive;
        let resolver = if passive { None } else { Some(self.build_resolver()?) };
        self.config.mark_started();
        *self.last_output.lock() = Instant::now();

        let timing = self.config.timing;
        let flow = FlowLimiter::new(
            timing.max_flow(),
            timing.release_per_sec(),
            self.quit.clone(),
        );

        // Services, leaves first; stopped in reverse order.
        let mut services: Vec<Arc<dyn Service>> = Vec::new();
        let mut subscriptions: Vec<(Topic, u64)> = Vec::new();

        let names = NameService::new(self.config.clone(), self.bus.clone(), flow.clone());
        subscriptions.extend(names.subscribe());
        services.push(names);

        let mut dns: Option<Arc<DnsService>> = None;
        let mut markov: Option<Arc<MarkovService>> = None;

        if let Some(resolver) = resolver.clone() {
            let dns_svc = DnsService::new(
                self.config.clone(),
                self.bus.clone(),
                resolver.clone(),
                flow.clone(),
            );
            let svc = dns_svc.clone();
            subscriptions.push((
                Topic::ResolveName,
                self.bus.subscribe(Topic::ResolveName, Delivery::Async, move |ev| {
                    if let Event::Name(req) = ev {
                        svc.base().send_request((*req).clone());
                    }
                }),
            ));
            services.push(dns_svc.clone());

            let addr = AddrService::new(
                self.config.clone(),
                self.bus.clone(),
                resolver.clone(),
                dns_svc.clone(),
            );
            subscriptions.extend(addr.subscribe());
            services.push(addr);

            if self.config.active {
                let cert = CertService::new(
                    self.config.clone(),
                    self.bus.clone(),
                    flow.clone(),
                    resolver.clone(),
                );
                subscriptions.extend(cert.subscribe());
                services.push(cert);
            }

            if self.config.brute_forcing {
                let brute = BruteService::new(self.config.clone(), self.bus.clone(), flow.clone());
                subscriptions.extend(brute.subscribe());
                services.push(brute);
            }

            if self.config.alterations {
                let alts =
                    AlterationsService::new(self.config.clone(), self.bus.clone(), flow.clone());
                subscriptions.extend(alts.subscribe());
                services.push(alts);

                let markov_svc =
                    MarkovService::new(self.config.clone(), self.bus.clone(), flow.clone());
                subscriptions.extend(markov_svc.subscribe());
                services.push(markov_svc.clone());
                markov = Some(markov_svc);
            }
            dns = Some(dns_svc);
        }

        if self.data_sources.load(Ordering::SeqCst) {
            services.push(CrtshService::new(
                self.config.clone(),
                self.bus.clone(),
                flow.clone(),
            ));
            services.push(WaybackService::new(
                self.config.clone(),
                self.bus.clone(),
                flow.clone(),
            ));
        }

        // Output gate: resolved names in active mode, gated candidates in
        // passive mode.
        let gate_topic = if passive { Topic::Checked } else { Topic::NameResolved };
        let gate = self.clone();
        subscriptions.push((
            gate_topic,
            self.bus.subscribe(gate_topic, Delivery::Sync, move |ev| {
                if let Event::Name(req) = ev {
                    gate.gate_output(&req);
                }
            }),
        ));

        for svc in &services {
            service::start(svc)?;
        }
        tracing::info!(
            domains = ?self.config.domains(),
            services = services.len(),
            passive,
            "enumeration started"
        );

        // Seed the pipeline with the roots themselves.
        for root in self.config.domains() {
            self.bus.publish(
                Topic::NewName,
                Event::Name(Arc::new(Request::candidate(&root, &root, Tag::Dns, "DNS"))),
            );
        }

        self.supervise(&services, dns.as_ref(), markov.as_ref()).await;

        // Shutdown: reverse dependency order, then a terminal tick, then
        // the bus itself.
        self.quit.cancel();
        for (topic, id) in subscriptions {
            self.bus.unsubscribe(topic, id);
        }
        for svc in services.iter().rev() {
            if let Err(err) = service::stop(svc) {
                tracing::debug!(%err, "stop");
            }
        }
        self.bus.publish(Topic::Output, Event::Tick);
        self.bus.close();
        tracing::info!(
            found = self.output_count.load(Ordering::SeqCst),
            "enumeration finished"
        );
        Ok(())
    }

    /// Wake periodically; terminate on quiescence or on the hard watchdog.
    async fn supervise(
        &self,
        services: &[Arc<dyn Service>],
        dns: Option<&Arc<DnsService>>,
        markov: Option<&Arc<MarkovService>>,
    ) {
        let watchdog = self.config.watchdog;
        let tick = (watchdog / 4).clamp(Duration::from_millis(50), Duration::from_secs(5));
        let mut last_count = 0usize;
        loop {
            tokio::select! {
                _ = self.quit.cancelled() => return,
                _ = tokio::time::sleep(tick) => {}
            }

            let count = self.output_count.load(Ordering::SeqCst);
            let markov_generating = markov.map_or(false, |m| m.is_generating());
            if count == last_count && !markov_generating {
                // Name-starved: let the Markov model take a swing.
                if let Some(markov) = markov {
                    markov.signal_low_names();
                }
            }
            last_count = count;

            let dns_drained = dns.map_or(true, |d| d.base().pending() == 0);
            let all_idle = services.iter().all(|s| !s.base().is_active());
            if all_idle && !markov_generating && dns_drained {
                tracing::debug!("all services quiescent");
                return;
            }
            if self.last_output.lock().elapsed() >= watchdog {
                tracing::debug!("idle watchdog fired");
                return;
            }
        }
    }
}
