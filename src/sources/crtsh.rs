//! Certificate transparency via crt.sh.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{Event, EventBus, Topic};
use crate::config::Config;
use crate::service::flow::FlowLimiter;
use crate::service::{Service, ServiceBase};
use crate::types::{Request, Tag};

const SOURCE: &str = "crt.sh";

pub struct CrtshService {
    base: ServiceBase,
    config: Arc<Config>,
    bus: Arc<EventBus>,
    flow: Arc<FlowLimiter>,
    client: reqwest::Client,
}

impl CrtshService {
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
        let q = format!("%.{domain}");
        let url = format!("https://crt.sh/?q={}&output=json", urlencoding::encode(&q));
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("crt.sh returned status {}", resp.status());
        }
        // crt.sh sometimes returns non-JSON on failure; attempt parse.
        let entries: Vec<serde_json::Value> = resp.json().await?;
        let mut out = Vec::new();
        for entry in entries {
            if let Some(name) = entry.get("name_value").and_then(|n| n.as_str()) {
                // name_value can contain multiple names separated by newlines.
                for line in name.split('\n') {
                    let name = line.trim().trim_start_matches("*.").to_lowercase();
                    if !name.is_empty() {
                        out.push(name);
                    }
                }
            }
            if let Some(cn) = entry.get("common_name").and_then(|n| n.as_str()) {
                let cn = cn.trim().trim_start_matches("*.").to_lowercase();
                if !cn.is_empty() {
                    out.push(cn);
                }
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }
}

#[async_trait]
impl Service for CrtshService {
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
                Ok(names) => {
                    tracing::info!(source = SOURCE, domain = %domain, found = names.len(),
                        "certificate transparency results");
                    for name in names {
                        if quit.is_cancelled() {
                            return;
                        }
                        if !self.flow.acquire().await {
                            return;
                        }
                        self.bus.publish(
                            Topic::NewName,
                            Event::Name(Arc::new(Request::candidate(
                                &name, &domain, Tag::Cert, SOURCE,
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
