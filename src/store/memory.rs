use crate::core::cache::{CacheCounters, CacheHealth};
use crate::core::price::Quote;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(7);
const DEFAULT_SHARDS: usize = 8;

struct CacheValue {
    quote: Quote,
    inserted_at: Instant,
    last_used: u64,
}

#[derive(Default)]
struct Shard {
    live: HashMap<String, CacheValue>,
    // Quotes removed on expiry, kept for the staleness side channel.
    expired: HashMap<String, (Quote, Instant)>,
}

/// Quote returned by the staleness side channel.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleQuote {
    pub quote: Quote,
    pub age: Duration,
    pub fresh: bool,
}

/// In-memory LRU quote cache with a freshness window.
///
/// Keys are spread across shards, each behind its own mutex, so concurrent
/// `get`/`put` on one asset never interleave. Capacity and recency are global:
/// every touch takes a tick from a shared clock and eviction removes the entry
/// with the oldest tick across all shards.
#[derive(Clone)]
pub struct QuoteCache {
    shards: Arc<Vec<Mutex<Shard>>>,
    recency: Arc<Mutex<BTreeMap<u64, String>>>,
    evict_lock: Arc<Mutex<()>>,
    tick: Arc<AtomicU64>,
    size: Arc<AtomicUsize>,
    counters: Arc<CacheCounters>,
    capacity: usize,
    freshness: Duration,
}

impl QuoteCache {
    pub fn new(capacity: usize, freshness: Duration) -> Self {
        Self::with_shards(capacity, freshness, DEFAULT_SHARDS)
    }

    pub fn with_shards(capacity: usize, freshness: Duration, shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(Shard::default()))
            .collect();
        Self {
            shards: Arc::new(shards),
            recency: Arc::new(Mutex::new(BTreeMap::new())),
            evict_lock: Arc::new(Mutex::new(())),
            tick: Arc::new(AtomicU64::new(0)),
            size: Arc::new(AtomicUsize::new(0)),
            counters: Arc::new(CacheCounters::new()),
            capacity: capacity.max(1),
            freshness,
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::SeqCst)
    }

    /// Returns the quote if it is still inside the freshness window. An expired
    /// entry is removed here and counted as a miss.
    pub async fn get(&self, asset: &str) -> Option<Quote> {
        let mut shard = self.shard_for(asset).lock().await;
        let Some(entry) = shard.live.get_mut(asset) else {
            self.counters.miss();
            debug!("Cache MISS for {}", asset);
            return None;
        };

        if entry.inserted_at.elapsed() >= self.freshness {
            let last_used = entry.last_used;
            if let Some(expired) = shard.live.remove(asset) {
                if shard.expired.len() >= self.capacity {
                    let oldest = shard
                        .expired
                        .iter()
                        .min_by_key(|(_, (_, inserted_at))| *inserted_at)
                        .map(|(key, _)| key.clone());
                    if let Some(oldest) = oldest {
                        shard.expired.remove(&oldest);
                    }
                }
                shard
                    .expired
                    .insert(asset.to_string(), (expired.quote, expired.inserted_at));
            }
            self.size.fetch_sub(1, Ordering::SeqCst);
            self.recency.lock().await.remove(&last_used);
            self.counters.miss();
            debug!("Cache entry expired for {}", asset);
            return None;
        }

        let previous = entry.last_used;
        let tick = self.next_tick();
        entry.last_used = tick;
        let quote = entry.quote.clone();
        {
            let mut recency = self.recency.lock().await;
            recency.remove(&previous);
            recency.insert(tick, asset.to_string());
        }
        self.counters.hit();
        debug!("Cache HIT for {}", asset);
        Some(quote)
    }

    pub async fn put(&self, asset: &str, quote: Quote) {
        let tick = self.next_tick();
        {
            let mut shard = self.shard_for(asset).lock().await;
            shard.expired.remove(asset);
            let value = CacheValue {
                quote,
                inserted_at: Instant::now(),
                last_used: tick,
            };
            let mut recency = self.recency.lock().await;
            match shard.live.insert(asset.to_string(), value) {
                Some(previous) => {
                    recency.remove(&previous.last_used);
                }
                None => {
                    self.size.fetch_add(1, Ordering::SeqCst);
                }
            }
            recency.insert(tick, asset.to_string());
        }
        debug!("Cache PUT for {}", asset);
        self.evict_over_capacity(asset).await;
    }

    async fn evict_over_capacity(&self, just_inserted: &str) {
        let _guard = self.evict_lock.lock().await;
        while self.size.load(Ordering::SeqCst) > self.capacity {
            let victim = {
                let recency = self.recency.lock().await;
                recency
                    .iter()
                    .find(|(_, key)| key.as_str() != just_inserted)
                    .map(|(tick, key)| (*tick, key.clone()))
            };
            let Some((tick, key)) = victim else {
                break;
            };

            let mut shard = self.shard_for(&key).lock().await;
            let mut recency = self.recency.lock().await;
            // The entry may have been touched after we picked it.
            if recency.get(&tick) != Some(&key) {
                continue;
            }
            recency.remove(&tick);
            if shard.live.remove(&key).is_some() {
                self.size.fetch_sub(1, Ordering::SeqCst);
                self.counters.evict();
                debug!("Cache EVICT for {}", key);
            }
        }
    }

    /// Most recent quote stored for the asset, fresh or not, with its age.
    /// Does not touch recency or counters.
    pub async fn last_known(&self, asset: &str) -> Option<StaleQuote> {
        let shard = self.shard_for(asset).lock().await;
        if let Some(entry) = shard.live.get(asset) {
            let age = entry.inserted_at.elapsed();
            return Some(StaleQuote {
                quote: entry.quote.clone(),
                age,
                fresh: age < self.freshness,
            });
        }
        shard.expired.get(asset).map(|(quote, inserted_at)| StaleQuote {
            quote: quote.clone(),
            age: inserted_at.elapsed(),
            fresh: false,
        })
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn health(&self) -> CacheHealth {
        CacheHealth {
            hits: self.counters.hits(),
            misses: self.counters.misses(),
            evictions: self.counters.evictions(),
            size: self.len(),
            capacity: self.capacity,
            freshness_window: self.freshness,
        }
    }
}

impl Default for QuoteCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_FRESHNESS)
    }
}
