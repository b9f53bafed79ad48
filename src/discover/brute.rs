//! Dictionary brute forcing.
//!
//! Runs against every root at start and, when recursion is enabled,
//! against each subdomain once its sighting count reaches the configured
//! threshold. Emission is paced by the global flow semaphore, with a
//! one-second activity tick so a long wordlist doesn't read as quiescence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;

use crate::bus::{Delivery, Event, EventBus, Topic};
use crate::config::Config;
use crate::service::flow::FlowLimiter;
use crate::service::{drain_queue, wait_while_paused, Service, ServiceBase};
use crate::types::{Request, Tag};

/// Compact built-in list used when no wordlist file is supplied.
pub static DEFAULT_WORDLIST: Lazy<Vec<String>> = Lazy::new(|| {
    [
        // API-related
        "api", "api-dev", "api-staging", "api-test", "api1", "api2", "rest", "graphql",
        "gateway", "apigw",
        // Development/Testing
        "dev", "develop", "development", "test", "testing", "qa", "staging", "stage", "uat",
        "preprod", "sandbox", "demo",
        // Admin/Internal
        "admin", "administrator", "internal", "intranet", "private", "secure", "mgmt",
        "management", "portal", "console", "dashboard",
        // Mobile
        "mobile", "m", "app", "ios", "android",
        // Services
        "www", "web", "blog", "shop", "store", "cdn", "static", "assets", "media", "mail",
        "smtp", "imap", "pop3", "webmail", "email", "mx", "ns", "ns1", "ns2", "dns", "vpn",
        "proxy", "gw", "firewall", "remote", "ssh", "ftp", "sftp",
        // Cloud/Infrastructure
        "cloud", "s3", "storage", "backup", "upload", "download", "jenkins", "gitlab",
        "github", "git", "ci", "build", "registry", "docker", "k8s", "kube",
        // Monitoring/Logging
        "monitor", "monitoring", "metrics", "logs", "logging", "grafana", "kibana", "status",
        // Documentation
        "docs", "documentation", "wiki", "help", "support",
        // Versions
        "v1", "v2", "v3",
        // Old/Legacy
        "old", "legacy", "deprecated", "archive",
        // Others
        "beta", "alpha", "rc", "canary", "preview", "db", "database", "sql", "redis",
        "cache", "queue", "search", "auth", "login", "sso", "id", "accounts", "crm", "erp",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
});

pub struct BruteService {
    base: ServiceBase,
    config: Arc<Config>,
    bus: Arc<EventBus>,
    flow: Arc<FlowLimiter>,
}

impl BruteService {
    pub fn new(config: Arc<Config>, bus: Arc<EventBus>, flow: Arc<FlowLimiter>) -> Arc<Self> {
        Arc::new(Self {
            base: ServiceBase::new("Brute Forcing", config.timing.queue_len()),
            config,
            bus,
            flow,
        })
    }

    /// Recursion trigger: exactly when a subdomain's sighting count reaches
    /// the threshold, never before and never again after.
    pub fn subscribe(self: &Arc<Self>) -> Vec<(Topic, u64)> {
        let svc = self.clone();
        let id = self.bus.subscribe(Topic::NewSubdomain, Delivery::Sync, move |ev| {
            let Event::Subdomain(req, times) = ev else {
                return;
            };
            if !svc.config.recursive || times != svc.config.min_for_recursive {
                return;
            }
            // Roots were already covered at start.
            if svc.config.is_domain(&req.name) {
                return;
            }
            svc.base.send_request((*req).clone());
        });
        vec![(Topic::NewSubdomain, id)]
    }

    fn words(&self) -> &[String] {
        if self.config.wordlist.is_empty() {
            &DEFAULT_WORDLIST
        } else {
            &self.config.wordlist
        }
    }

    async fn brute(&self, subdomain: &str) {
        tracing::info!(subdomain = %subdomain, words = self.words().len(), "brute forcing");
        let quit = self.base.quit();
        let mut last_tick = Instant::now();
        self.base.set_active();
        for word in self.words() {
            if quit.is_cancelled() {
                return;
            }
            let word = word.trim().to_lowercase();
            if word.is_empty() || word.starts_with('-') || word.ends_with('-') {
                continue;
            }
            if last_tick.elapsed() >= Duration::from_secs(1) {
                self.base.set_active();
                last_tick = Instant::now();
            }
            if !self.flow.acquire().await {
                return;
            }
            let name = format!("{word}.{subdomain}");
            let root = self.config.root_of(&name).unwrap_or_default();
            self.bus.publish(
                Topic::NewName,
                Event::Name(Arc::new(Request::candidate(&name, &root, Tag::Brute, "Brute Forcing"))),
            );
        }
    }
}

#[async_trait]
impl Service for BruteService {
    fn base(&self) -> &ServiceBase {
        &self.base
    }

    async fn run(self: Arc<Self>) {
        if self.config.brute_forcing && !self.config.passive {
            for root in self.config.domains() {
                if self.base.quit().is_cancelled() {
                    break;
                }
                self.brute(&root).await;
            }
        }

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
                        self.brute(&req.name).await;
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

    fn harness(wordlist: &[&str], min_for_recursive: usize) -> (Arc<BruteService>, Arc<EventBus>) {
        let mut cfg = Config::new();
        cfg.timing = Timing::Insane;
        cfg.brute_forcing = true;
        cfg.recursive = true;
        cfg.min_for_recursive = min_for_recursive;
        cfg.wordlist = wordlist.iter().map(|s| s.to_string()).collect();
        cfg.add_domain("example.com");
        let bus = EventBus::new();
        let flow = FlowLimiter::new(1000, 1000.0, CancellationToken::new());
        let svc = BruteService::new(Arc::new(cfg), bus.clone(), flow);
        (svc, bus)
    }

    fn collect_names(bus: &EventBus) -> tokio::sync::mpsc::UnboundedReceiver<String> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(Topic::NewName, Delivery::Sync, move |ev| {
            if let Event::Name(req) = ev {
                let _ = tx.send(req.name.clone());
            }
        });
        rx
    }

    #[tokio::test]
    async fn roots_are_bruted_on_start() {
        let (svc, bus) = harness(&["a", "b"], 1);
        let mut names = collect_names(&bus);
        let dyn_svc: Arc<dyn Service> = svc.clone();
        service::start(&dyn_svc).unwrap();

        let mut got = Vec::new();
        for _ in 0..2 {
            got.push(
                tokio::time::timeout(Duration::from_secs(2), names.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        got.sort();
        assert_eq!(got, vec!["a.example.com", "b.example.com"]);
    }

    #[tokio::test]
    async fn hyphen_edge_words_are_skipped() {
        let (svc, bus) = harness(&["-bad", "good", "worse-"], 1);
        let mut names = collect_names(&bus);
        let dyn_svc: Arc<dyn Service> = svc.clone();
        service::start(&dyn_svc).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), names.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "good.example.com");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(names.try_recv().is_err());
    }

    #[tokio::test]
    async fn recursion_fires_exactly_at_threshold() {
        let (svc, bus) = harness(&["x"], 2);
        let mut names = collect_names(&bus);
        svc.subscribe();
        let dyn_svc: Arc<dyn Service> = svc.clone();
        service::start(&dyn_svc).unwrap();
        // Drain the start-of-run brute of the root.
        let _ = tokio::time::timeout(Duration::from_secs(2), names.recv()).await;

        let sub = Arc::new(Request::candidate("sub.example.com", "example.com", Tag::Dns, "DNS"));
        bus.publish(Topic::NewSubdomain, Event::Subdomain(sub.clone(), 1));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(names.try_recv().is_err(), "below threshold must not brute");

        bus.publish(Topic::NewSubdomain, Event::Subdomain(sub.clone(), 2));
        let got = tokio::time::timeout(Duration::from_secs(2), names.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "x.sub.example.com");

        bus.publish(Topic::NewSubdomain, Event::Subdomain(sub, 3));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(names.try_recv().is_err(), "past threshold must not re-brute");
    }
}
