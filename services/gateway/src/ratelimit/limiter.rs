use super::{RateClassConfig, RateDecision, TokenBucket};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// (principal, rate class). Subjects and IPs live in separate namespaces so
/// a subject id can never collide with an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    principal: String,
    rate_class: String,
}

impl BucketKey {
    pub fn for_subject(subject_id: &str, rate_class: &str) -> Self {
        Self {
            principal: format!("sub:{}", subject_id),
            rate_class: rate_class.to_string(),
        }
    }

    pub fn for_ip(ip: IpAddr, rate_class: &str) -> Self {
        Self {
            principal: format!("ip:{}", ip),
            rate_class: rate_class.to_string(),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.principal, self.rate_class)
    }
}

struct BucketSlot {
    bucket: Mutex<TokenBucket>,
    last_access: AtomicU64,
}

/// Bucket store shared by every request.
///
/// The map is sharded and each bucket has its own mutex, so refill and
/// decrement for one key never wait on another key's bucket. Once `max_keys`
/// buckets exist the least recently used tenth is evicted in one pass.
pub struct RateLimiter {
    classes: HashMap<String, RateClassConfig>,
    buckets: DashMap<BucketKey, Arc<BucketSlot>>,
    max_keys: usize,
    access_clock: AtomicU64,
}

impl RateLimiter {
    pub fn new(classes: &BTreeMap<String, RateClassConfig>, max_keys: usize) -> Self {
        Self {
            classes: classes
                .iter()
                .map(|(name, class)| (name.clone(), *class))
                .collect(),
            buckets: DashMap::new(),
            max_keys: max_keys.max(1),
            access_clock: AtomicU64::new(0),
        }
    }

    pub fn acquire(&self, key: &BucketKey) -> RateDecision {
        self.acquire_at(key, Instant::now())
    }

    pub fn acquire_at(&self, key: &BucketKey, now: Instant) -> RateDecision {
        let Some(class) = self.classes.get(&key.rate_class) else {
            // Startup validation rejects routes naming unknown classes.
            warn!(rate_class = %key.rate_class, "Unknown rate class, admitting request");
            return RateDecision::Allowed;
        };

        let tick = self.access_clock.fetch_add(1, Ordering::Relaxed);
        let existing = self.buckets.get(key).map(|slot| Arc::clone(slot.value()));
        let slot = match existing {
            Some(slot) => slot,
            None => self.insert_slot(key, class, now),
        };
        slot.last_access.store(tick, Ordering::Relaxed);

        let decision = slot.bucket.lock().try_acquire(now);
        if !decision.is_allowed() {
            debug!(key = %key, decision = ?decision, "Rate limit bucket empty");
        }
        decision
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn contains(&self, key: &BucketKey) -> bool {
        self.buckets.contains_key(key)
    }

    fn insert_slot(&self, key: &BucketKey, class: &RateClassConfig, now: Instant) -> Arc<BucketSlot> {
        if self.buckets.len() >= self.max_keys {
            self.evict_least_recently_used();
        }

        let slot = self.buckets.entry(key.clone()).or_insert_with(|| {
            Arc::new(BucketSlot {
                bucket: Mutex::new(TokenBucket::new(class, now)),
                last_access: AtomicU64::new(0),
            })
        });
        Arc::clone(slot.value())
    }

    fn evict_least_recently_used(&self) {
        let batch = (self.max_keys / 10).max(1);

        let mut by_age: Vec<(u64, BucketKey)> = self
            .buckets
            .iter()
            .map(|entry| {
                (
                    entry.value().last_access.load(Ordering::Relaxed),
                    entry.key().clone(),
                )
            })
            .collect();

        if by_age.len() > batch {
            by_age.select_nth_unstable_by_key(batch - 1, |(tick, _)| *tick);
            by_age.truncate(batch);
        }

        for (_, key) in &by_age {
            self.buckets.remove(key);
        }

        debug!(
            evicted = by_age.len(),
            max_keys = self.max_keys,
            "Evicted least recently used rate limit buckets"
        );
    }
}
