//! Web-archive scraping via the Wayback CDX API.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{Event, EventBus, Topic};
use crate::config::Config;
use crate::service::flow::FlowLimiter;
use crate::service::{Service, ServiceBase};
use crate::types::{Request, Tag};

const SOURCE: &str = "Wayback";

pub struct WaybackService {
    base: ServiceBase,
    config: Arc<Config>,
    bus: Arc<EventBus>,
    flow: Arc<FlowLimiter>,
    client: reqwest::Client,
}

impl WaybackService {
    pub fn new(config: Arc<Config>, bus: Arc<EventBus>, flow: Arc<FlowLimiter>) -> Arc<Self> {
        Arc::new(Self {
            base: ServiceBase::new(SOURCE, config.timing.queue_len()),
            config,
            bus,
            flow,
            client: super::http_client(),
        })
    }

    async fn query(&self, domain: &str) -> anyhow::Result<Vec<String>> {
        let url = format!(
            "https://web.archive.org/cdx/search/cdx?url=*.{domain}/*&output=json&fl=original&collapse=urlkey"
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("wayback returned status {}", resp.status());
        }
        let rows: serde_json::Value = resp.json().await?;
        let mut out = Vec::new();
        if let Some(arr) = rows.as_array() {
            // First row is the CDX header.
            for row in arr.iter().skip(1) {
                let original = match row {
                    serde_json::Value::Array(fields) => fields.first().and_then(|f| f.as_str()),
                    serde_json::Value::String(s) => Some(s.as_str()),
                    _ => None,
                };
                if let Some(host) = original.and_then(super::host_of) {
                    out.push(host);
                }
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }
}

#[async_trait]
impl Service for WaybackService {
    fn base(&self) -> &ServiceBase {
        &self.base
    }

    async fn run(self: Arc<Self>) {
        let quit = self.base.quit();
        for domain in self.config.domains() {
            if quit.is_cancelled() {
                return;
            }
            self.base.set_active();
            match self.query(&domain).await {
                Ok(hosts) => {
                    tracing::info!(source = SOURCE, domain = %domain, found = hosts.len(),
                        "archive results");
                    for host in hosts {
                        if quit.is_cancelled() {
                            return;
                        }
                        if !self.flow.acquire().await {
                            return;
                        }
                        self.bus.publish(
                            Topic::NewName,
                            Event::Name(Arc::new(Request::candidate(
                                &host, &domain, Tag::Archive, SOURCE,
                            ))),
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(source = SOURCE, domain = %domain, %err, "query failed");
                }
            }
        }
        quit.cancelled().await;
    }
}
