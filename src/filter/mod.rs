//! Approximate-membership string deduplication.
//!
//! A single task owns the cuckoo filter and answers membership queries over
//! one request/response channel, so no lock ever guards the filter itself.
//! A rare false positive drops a real name; that trade bounds memory at
//! enumeration scale.

use std::collections::hash_map::DefaultHasher;

use cuckoofilter::CuckooFilter;
use tokio::sync::{mpsc, oneshot};

struct FilterQuery {
    value: String,
    resp: oneshot::Sender<bool>,
}

#[derive(Clone)]
pub struct StringFilter {
    tx: mpsc::Sender<FilterQuery>,
}

impl StringFilter {
    /// Spawn the owning task. `capacity` bounds filter memory.
    pub fn spawn(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<FilterQuery>(1024);
        tokio::spawn(async move {
            let mut filter: CuckooFilter<DefaultHasher> = CuckooFilter::with_capacity(capacity);
            while let Some(query) = rx.recv().await {
                let duplicate = match filter.test_and_add(&query.value) {
                    Ok(added) => !added,
                    Err(err) => {
                        // Filter at capacity: let the name through rather
                        // than silently eating everything from here on.
                        tracing::warn!(%err, "string filter insert failed");
                        false
                    }
                };
                let _ = query.resp.send(duplicate);
            }
        });
        Self { tx }
    }

    /// True if `value` was seen before; records it either way.
    pub async fn duplicate(&self, value: &str) -> bool {
        let (resp, rx) = oneshot::channel();
        let query = FilterQuery {
            value: value.to_string(),
            resp,
        };
        if self.tx.send(query).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_sight_is_not_a_duplicate() {
        let filter = StringFilter::spawn(1000);
        assert!(!filter.duplicate("www.example.com").await);
        assert!(filter.duplicate("www.example.com").await);
        assert!(!filter.duplicate("mail.example.com").await);
    }

    #[tokio::test]
    async fn many_distinct_values_pass() {
        let filter = StringFilter::spawn(10_000);
        for i in 0..1000 {
            assert!(!filter.duplicate(&format!("host{i}.example.com")).await);
        }
        for i in 0..1000 {
            assert!(filter.duplicate(&format!("host{i}.example.com")).await);
        }
    }
}
