//! Name alterations: permute resolved names into nearby guesses.
//!
//! Works on the leftmost label only. Digit flips replace each digit with
//! every alternative (recursing one level for multi-digit labels) and emit
//! a variant with the digit removed; appended digits come in plain and
//! hyphen-separated forms. Everything funnels back through the name
//! service, so scope checks and dedup happen downstream.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{Delivery, Event, EventBus, Topic};
use crate::config::Config;
use crate::service::flow::FlowLimiter;
use crate::service::{drain_queue, wait_while_paused, Service, ServiceBase};
use crate::types::{Request, Tag, MAX_DNS_LABEL_LEN};
use crate::utils;

/// Record types whose presence marks a name as worth permuting.
const ALTERABLE_TYPES: &[u16] = &[1, 28, 5, 16];

fn split_first_label(name: &str) -> Option<(&str, &str)> {
    let (label, rest) = name.split_once('.')?;
    if label.is_empty() || rest.is_empty() {
        return None;
    }
    Some((label, rest))
}

fn flip_label_digits(label: &str, out: &mut BTreeSet<String>, recurse: bool) {
    let chars: Vec<char> = label.chars().collect();
    for (idx, ch) in chars.iter().enumerate() {
        if !ch.is_ascii_digit() {
            continue;
        }
        for digit in '0'..='9' {
            let mut variant = chars.clone();
            variant[idx] = digit;
            let variant: String = variant.into_iter().collect();
            if recurse {
                flip_label_digits(&variant, out, false);
            }
            out.insert(variant);
        }
        // Variant with the digit dropped entirely.
        let mut removed = chars.clone();
        removed.remove(idx);
        let removed: String = removed.into_iter().collect();
        if !removed.is_empty() {
            out.insert(removed);
        }
    }
}

/// Digit-flip family of variants for a full name.
pub fn flip_numbers(name: &str) -> Vec<String> {
    let Some((label, rest)) = split_first_label(name) else {
        return Vec::new();
    };
    let mut labels = BTreeSet::new();
    flip_label_digits(label, &mut labels, true);
    labels
        .into_iter()
        .filter(|l| l.len() <= MAX_DNS_LABEL_LEN)
        .map(|l| format!("{l}.{rest}"))
        .collect()
}

/// Append digits 0-9 to the first label, plain and hyphen-separated.
pub fn append_numbers(name: &str) -> Vec<String> {
    let Some((label, rest)) = split_first_label(name) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for digit in 0..10u8 {
        for candidate in [format!("{label}{digit}"), format!("{label}-{digit}")] {
            if candidate.len() <= MAX_DNS_LABEL_LEN {
                out.push(format!("{candidate}.{rest}"));
            }
        }
    }
    out
}

/// The full distinct alteration set for one name, the input excluded from
/// nothing: a flip that reproduces the original is still a valid guess and
/// gets dropped by the dedup gate downstream.
pub fn alterations(name: &str) -> Vec<String> {
    let mut set: BTreeSet<String> = BTreeSet::new();
    set.extend(flip_numbers(name));
    set.extend(append_numbers(name));
    set.into_iter().collect()
}

pub struct AlterationsService {
    base: ServiceBase,
    config: Arc<Config>,
    bus: Arc<EventBus>,
    flow: Arc<FlowLimiter>,
}

impl AlterationsService {
    pub fn new(config: Arc<Config>, bus: Arc<EventBus>, flow: Arc<FlowLimiter>) -> Arc<Self> {
        Arc::new(Self {
            base: ServiceBase::new("Alterations", config.timing.queue_len()),
            config,
            bus,
            flow,
        })
    }

    pub fn subscribe(self: &Arc<Self>) -> Vec<(Topic, u64)> {
        let svc = self.clone();
        let id = self.bus.subscribe(Topic::NameResolved, Delivery::Sync, move |ev| {
            let Event::Name(req) = ev else { return };
            if !req.has_record_type(ALTERABLE_TYPES) {
                return;
            }
            svc.base.send_request((*req).clone());
        });
        vec![(Topic::NameResolved, id)]
    }

    async fn process(&self, req: Request) {
        if !self.config.alterations {
            return;
        }
        // Altering the bare root would mangle the registered domain itself.
        if utils::labels(&req.name).len() <= utils::labels(&req.domain).len() {
            return;
        }
        for name in alterations(&req.name) {
            if self.base.quit().is_cancelled() {
                return;
            }
            if !self.flow.acquire().await {
                return;
            }
            self.bus.publish(
                Topic::NewName,
                Event::Name(Arc::new(Request::candidate(
                    &name,
                    &req.domain,
                    Tag::Alt,
                    "Alterations",
                ))),
            );
        }
    }
}

#[async_trait]
impl Service for AlterationsService {
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

    #[test]
    fn test1_produces_the_expected_31_names() {
        let got = alterations("test1.owasp.org");
        assert_eq!(got.len(), 31, "got: {got:?}");

        let mut expected: Vec<String> = vec!["test.owasp.org".to_string()];
        for d in 0..10 {
            expected.push(format!("test{d}.owasp.org"));
            expected.push(format!("test1{d}.owasp.org"));
            expected.push(format!("test1-{d}.owasp.org"));
        }
        for name in expected {
            assert!(got.contains(&name), "missing {name}");
        }
    }

    #[test]
    fn digitless_labels_only_append() {
        let got = alterations("www.example.com");
        assert_eq!(got.len(), 20);
        assert!(got.contains(&"www0.example.com".to_string()));
        assert!(got.contains(&"www-9.example.com".to_string()));
        assert!(flip_numbers("www.example.com").is_empty());
    }

    #[test]
    fn multi_digit_labels_flip_one_level_deep() {
        let got = flip_numbers("a1b2.example.com");
        // Pairwise flips of both digits reachable via the single recursion.
        assert!(got.contains(&"a0b0.example.com".to_string()));
        assert!(got.contains(&"a9b9.example.com".to_string()));
        // Single-digit removals.
        assert!(got.contains(&"ab2.example.com".to_string()));
        assert!(got.contains(&"a1b.example.com".to_string()));
    }

    #[test]
    fn label_length_is_bounded() {
        let long = "a".repeat(MAX_DNS_LABEL_LEN);
        let got = append_numbers(&format!("{long}.example.com"));
        assert!(got.is_empty());
    }

    #[test]
    fn bare_domains_are_left_alone() {
        assert!(split_first_label("com").is_none());
        assert!(alterations("com").is_empty());
    }
}
