//! Markov-chain label guessing.
//!
//! An order-3 character model trained on the leftmost labels of resolved
//! names. When the coordinator reports the pipeline name-starved, the model
//! samples fresh labels and pairs them with every known subdomain. Labels
//! train and generate over `[a-z0-9_-]` with space sentinels on the left
//! and `.` as the terminal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;

use crate::bus::{Delivery, Event, EventBus, Topic};
use crate::config::Config;
use crate::service::flow::FlowLimiter;
use crate::service::{drain_queue, wait_while_paused, Service, ServiceBase};
use crate::types::{Request, Tag, MAX_DNS_LABEL_LEN};
use crate::utils;

const NGRAM_LEN: usize = 3;
const SENTINEL: char = ' ';
const TERMINAL: char = '.';
/// Labels to train on before the model is trusted to generate.
const MIN_TRAINED: usize = 100;
/// Upper bound on emissions per generation pass, regardless of how few
/// subdomains are known.
const GENERATION_BUDGET: usize = 50_000;
/// Never trained on, never emitted.
const LABEL_BLACKLIST: &[&str] = &["www"];

#[derive(Default)]
struct CharScore {
    count: usize,
    freq: f64,
}

pub struct MarkovModel {
    // Contexts of every length up to NGRAM_LEN-1, so generation can back
    // off to shorter ngrams on a miss.
    ngrams: AHashMap<String, AHashMap<char, CharScore>>,
    trained: usize,
    updated: bool,
}

impl MarkovModel {
    pub fn new() -> Self {
        Self {
            ngrams: AHashMap::new(),
            trained: 0,
            updated: false,
        }
    }

    pub fn trained(&self) -> usize {
        self.trained
    }

    fn valid_label(label: &str) -> bool {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    }

    /// Feed one label through the model.
    pub fn train(&mut self, label: &str) {
        let label = label.to_lowercase();
        if !Self::valid_label(&label) || LABEL_BLACKLIST.contains(&label.as_str()) {
            return;
        }
        let mut chars: Vec<char> = vec![SENTINEL; NGRAM_LEN - 1];
        chars.extend(label.chars());
        chars.push(TERMINAL);
        for i in (NGRAM_LEN - 1)..chars.len() {
            let next = chars[i];
            for ctx_len in 0..NGRAM_LEN {
                let ctx: String = chars[i - ctx_len..i].iter().collect();
                self.ngrams
                    .entry(ctx)
                    .or_default()
                    .entry(next)
                    .or_default()
                    .count += 1;
            }
        }
        self.trained += 1;
        self.updated = true;
    }

    /// Recompute conditional frequencies; called once per generation batch.
    pub fn recalc(&mut self) {
        for dist in self.ngrams.values_mut() {
            let total: usize = dist.values().map(|s| s.count).sum();
            if total == 0 {
                continue;
            }
            for score in dist.values_mut() {
                score.freq = score.count as f64 / total as f64;
            }
        }
        self.updated = false;
    }

    pub fn needs_recalc(&self) -> bool {
        self.updated
    }

    fn sample(&self, ctx: &[char]) -> Option<char> {
        // Back off to shorter contexts until one is known.
        for start in 0..=ctx.len() {
            let key: String = ctx[start..].iter().collect();
            let Some(dist) = self.ngrams.get(&key) else {
                continue;
            };
            let total: f64 = dist.values().map(|s| s.freq).sum();
            if total <= 0.0 {
                continue;
            }
            let mut roll = rand::thread_rng().gen::<f64>() * total;
            for (ch, score) in dist {
                roll -= score.freq;
                if roll <= 0.0 {
                    return Some(*ch);
                }
            }
        }
        None
    }

    /// Sample one label character-by-character. `None` when the walk dies
    /// or runs past the label length limit.
    pub fn generate(&self) -> Option<String> {
        let mut ctx: Vec<char> = vec![SENTINEL; NGRAM_LEN - 1];
        let mut label = String::new();
        loop {
            let next = self.sample(&ctx)?;
            if next == TERMINAL {
                break;
            }
            label.push(next);
            if label.len() > MAX_DNS_LABEL_LEN {
                return None;
            }
            ctx.remove(0);
            ctx.push(next);
        }
        if label.is_empty() || label.contains('.') || LABEL_BLACKLIST.contains(&label.as_str()) {
            return None;
        }
        Some(label)
    }
}

impl Default for MarkovModel {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MarkovService {
    base: ServiceBase,
    config: Arc<Config>,
    bus: Arc<EventBus>,
    flow: Arc<FlowLimiter>,
    model: Mutex<MarkovModel>,
    subdomains: Mutex<Vec<String>>,
    generating: AtomicBool,
    starved: Notify,
}

impl MarkovService {
    pub fn new(config: Arc<Config>, bus: Arc<EventBus>, flow: Arc<FlowLimiter>) -> Arc<Self> {
        Arc::new(Self {
            base: ServiceBase::new("Markov Model", config.timing.queue_len()),
            config,
            bus,
            flow,
            model: Mutex::new(MarkovModel::new()),
            subdomains: Mutex::new(Vec::new()),
            generating: AtomicBool::new(false),
            starved: Notify::new(),
        })
    }

    pub fn subscribe(self: &Arc<Self>) -> Vec<(Topic, u64)> {
        let svc = self.clone();
        let resolved = self.bus.subscribe(Topic::NameResolved, Delivery::Sync, move |ev| {
            if let Event::Name(req) = ev {
                svc.base.send_request((*req).clone());
            }
        });
        let svc = self.clone();
        let subs = self.bus.subscribe(Topic::NewSubdomain, Delivery::Sync, move |ev| {
            if let Event::Subdomain(req, _) = ev {
                let mut known = svc.subdomains.lock();
                if !known.contains(&req.name) {
                    known.push(req.name.clone());
                }
            }
        });
        vec![(Topic::NameResolved, resolved), (Topic::NewSubdomain, subs)]
    }

    /// Coordinator signal: the pipeline is running out of names.
    pub fn signal_low_names(&self) {
        self.starved.notify_one();
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    fn train_from(&self, req: &Request) {
        if utils::labels(&req.name).len() <= utils::labels(&req.domain).len() {
            return;
        }
        if let Some((label, _)) = req.name.split_once('.') {
            self.model.lock().train(label);
        }
    }

    async fn generate_batch(&self) {
        if self.generating.swap(true, Ordering::SeqCst) {
            return;
        }
        let ready = {
            let mut model = self.model.lock();
            let ready = model.trained() >= MIN_TRAINED && model.needs_recalc();
            if ready {
                model.recalc();
            }
            ready
        };
        let subdomains = self.subdomains.lock().clone();
        if !ready || subdomains.is_empty() {
            self.generating.store(false, Ordering::SeqCst);
            return;
        }

        let per_sub = (GENERATION_BUDGET / subdomains.len()).max(1);
        let mut budget = GENERATION_BUDGET;
        let quit = self.base.quit();
        tracing::debug!(subdomains = subdomains.len(), per_sub, "markov generation pass");
        'outer: for sub in &subdomains {
            for _ in 0..per_sub {
                if budget == 0 || quit.is_cancelled() {
                    break 'outer;
                }
                budget -= 1;
                self.base.set_active();
                let Some(label) = self.model.lock().generate() else {
                    continue;
                };
                if !self.flow.acquire().await {
                    break 'outer;
                }
                let name = format!("{label}.{sub}");
                let root = self.config.root_of(&name).unwrap_or_default();
                self.bus.publish(
                    Topic::NewName,
                    Event::Name(Arc::new(Request::candidate(&name, &root, Tag::Alt, "Markov Model"))),
                );
            }
        }
        self.generating.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Service for MarkovService {
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
                _ = self.starved.notified() => {
                    self.generate_batch().await;
                }
                maybe = rx.recv() => match maybe {
                    Some(req) => {
                        self.base.set_active();
                        self.train_from(&req);
                        self.base.mark_processed();
                    }
                    None => break,
                }
            }
        }
        drain_queue(&self.base, &mut rx);
    }
}
