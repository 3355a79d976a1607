//! Vendor-name lookup for a MAC's OUI prefix, cached with a TTL and an LRU
//! cap, and gated to one outbound request per second (§4.8).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{instrument, warn};

const UNKNOWN_VENDOR: &str = "Unknown Vendor";
const LOOKUP_BASE_URL: &str = "https://api.macvendors.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorLookupError {
    RateLimited,
    Internal(String),
}

impl std::fmt::Display for VendorLookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VendorLookupError::RateLimited => write!(f, "mac vendor lookup rate limited"),
            VendorLookupError::Internal(msg) => write!(f, "mac vendor lookup failed: {msg}"),
        }
    }
}

struct CacheEntry {
    vendor: String,
    expires_at: Instant,
}

struct Lru {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Lru {
    fn new(capacity: usize) -> Self {
        Self { entries: HashMap::new(), order: VecDeque::new(), capacity }
    }

    fn get(&mut self, key: &str, now: Instant) -> Option<String> {
        let fresh = self.entries.get(key).map(|e| e.expires_at > now)?;
        if !fresh {
            self.entries.remove(key);
            self.order.retain(|k| k != key);
            return None;
        }
        self.touch(key);
        self.entries.get(key).map(|e| e.vendor.clone())
    }

    fn insert(&mut self, key: String, vendor: String, expires_at: Instant) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key.clone(), CacheEntry { vendor, expires_at });
        self.touch(&key);
    }

    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }
}

/// TTL + LRU cache over a single external lookup endpoint, serialized so the
/// upstream never sees more than one request per second (§4.8: "a shared
/// external collaborator with no burst tolerance").
pub struct MacVendorCache {
    cache: Mutex<Lru>,
    ttl: Duration,
    last_call: AsyncMutex<Option<Instant>>,
    client: reqwest::Client,
    base_url: String,
}

impl MacVendorCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            cache: Mutex::new(Lru::new(capacity)),
            ttl,
            last_call: AsyncMutex::new(None),
            client: reqwest::Client::new(),
            base_url: LOOKUP_BASE_URL.to_string(),
        }
    }

    #[instrument(skip(self))]
    pub async fn lookup(&self, mac: &str) -> Result<String, VendorLookupError> {
        let key = cnc_models::mac::vendor_cache_key(mac)
            .ok_or_else(|| VendorLookupError::Internal(format!("invalid mac '{mac}'")))?;

        let now = Instant::now();
        if let Some(vendor) = self.cache.lock().unwrap().get(&key, now) {
            return Ok(vendor);
        }

        self.wait_for_rate_gate().await;
        let vendor = self.fetch(&key).await?;

        self.cache.lock().unwrap().insert(key, vendor.clone(), Instant::now() + self.ttl);
        Ok(vendor)
    }

    async fn wait_for_rate_gate(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < Duration::from_secs(1) {
                tokio::time::sleep(Duration::from_secs(1) - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }

    async fn fetch(&self, cache_key: &str) -> Result<String, VendorLookupError> {
        let url = format!("{}/{}", self.base_url, cache_key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VendorLookupError::Internal(e.to_string()))?;

        match response.status() {
            status if status.is_success() => response.text().await.map_err(|e| VendorLookupError::Internal(e.to_string())),
            status if status.as_u16() == 404 => Ok(UNKNOWN_VENDOR.to_string()),
            status if status.as_u16() == 429 => Err(VendorLookupError::RateLimited),
            status => {
                warn!(%status, "mac vendor lookup upstream error");
                Err(VendorLookupError::Internal(format!("upstream returned {status}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_evicts_oldest_entry_past_capacity() {
        let mut lru = Lru::new(2);
        let now = Instant::now();
        let later = now + Duration::from_secs(10);
        lru.insert("a".into(), "Vendor A".into(), later);
        lru.insert("b".into(), "Vendor B".into(), later);
        lru.insert("c".into(), "Vendor C".into(), later);
        assert!(lru.get("a", now).is_none());
        assert_eq!(lru.get("b", now).as_deref(), Some("Vendor B"));
        assert_eq!(lru.get("c", now).as_deref(), Some("Vendor C"));
    }

    #[test]
    fn lru_expires_entries_past_ttl() {
        let mut lru = Lru::new(2);
        let now = Instant::now();
        lru.insert("a".into(), "Vendor A".into(), now);
        assert!(lru.get("a", now + Duration::from_millis(1)).is_none());
    }
}
