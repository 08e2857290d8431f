use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::Expiry;

#[derive(Clone)]
struct HotEntry {
    value_json: String,
    lifetime: Duration,
}

struct HotExpiry;

impl Expiry<String, HotEntry> for HotExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &HotEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.lifetime)
    }
}

/// Hot cache in front of the shared SQLite table.
///
/// An entry lives for the hot TTL or until its shared row expires, whichever
/// comes first, so a snapshot is never assembled from a row the pipelines
/// have already retired.
pub struct MemoryCache {
    inner: Cache<String, HotEntry>,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(HotExpiry)
                .build(),
            ttl,
        }
    }

    /// How long a row expiring at `row_expires_at` may stay hot. `None` once it has expired.
    pub fn lifetime(
        &self,
        row_expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let lifetime = match row_expires_at {
            Some(at) => (at - now).to_std().ok()?.min(self.ttl),
            None => self.ttl,
        };
        (!lifetime.is_zero()).then_some(lifetime)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).await.map(|entry| entry.value_json)
    }

    /// Returns false when the row is already past its expiry and was not cached.
    pub async fn insert(
        &self,
        key: String,
        value_json: String,
        row_expires_at: Option<DateTime<Utc>>,
    ) -> bool {
        let Some(lifetime) = self.lifetime(row_expires_at, Utc::now()) else {
            return false;
        };
        self.inner
            .insert(key, HotEntry { value_json, lifetime })
            .await;
        true
    }
}
