//! Tenant admission control: sliding-window counters.
//!
//! The window is split into sub-buckets (default 12 over 60 s) so a
//! burst at a fixed-window boundary cannot double the admitted rate,
//! without paying the O(requests) cost of a per-request log. The
//! check-and-increment runs under one lock, which is the serialization
//! point for the quota-safety invariant: no more than `limit` admissions
//! within any rolling window.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    pub admitted: bool,
    pub current_usage: u32,
    pub limit: u32,
    /// Seconds until the oldest contributing bucket rotates out; the
    /// recovery hint for 429 responses.
    pub retry_after_seconds: u64,
}

pub struct QuotaManager {
    tenants: Mutex<HashMap<String, TenantWindow>>,
    window_seconds: u64,
    bucket_count: u64,
    default_limit: u32,
}

struct TenantWindow {
    limit: u32,
    /// bucket index -> admitted count. Buckets older than the window are
    /// pruned on every touch and never contribute.
    buckets: HashMap<i64, u32>,
}

impl QuotaManager {
    pub fn new(window_seconds: u64, bucket_count: u32, default_limit: u32) -> Self {
        Self {
            tenants: Mutex::new(HashMap::new()),
            window_seconds: window_seconds.max(1),
            bucket_count: u64::from(bucket_count.max(1)),
            default_limit,
        }
    }

    fn bucket_width(&self) -> u64 {
        (self.window_seconds / self.bucket_count).max(1)
    }

    fn current_bucket(&self) -> i64 {
        Utc::now().timestamp() / self.bucket_width() as i64
    }

    /// Atomically sum the live window and admit or reject. Rejections do
    /// not increment.
    pub fn check_and_increment(&self, tenant: &str) -> QuotaDecision {
        let bucket = self.current_bucket();
        let oldest_live = bucket - (self.bucket_count as i64 - 1);
        let mut tenants = self.lock();
        let window = tenants
            .entry(tenant.to_string())
            .or_insert_with(|| TenantWindow {
                limit: self.default_limit,
                buckets: HashMap::new(),
            });

        window.buckets.retain(|idx, _| *idx >= oldest_live);
        let usage: u32 = window.buckets.values().sum();

        if usage + 1 > window.limit {
            return QuotaDecision {
                admitted: false,
                current_usage: usage,
                limit: window.limit,
                retry_after_seconds: self.bucket_width(),
            };
        }

        *window.buckets.entry(bucket).or_insert(0) += 1;
        QuotaDecision {
            admitted: true,
            current_usage: usage + 1,
            limit: window.limit,
            retry_after_seconds: 0,
        }
    }

    pub fn get_usage(&self, tenant: &str) -> u32 {
        let bucket = self.current_bucket();
        let oldest_live = bucket - (self.bucket_count as i64 - 1);
        let mut tenants = self.lock();
        match tenants.get_mut(tenant) {
            Some(window) => {
                window.buckets.retain(|idx, _| *idx >= oldest_live);
                window.buckets.values().sum()
            }
            None => 0,
        }
    }

    pub fn get_limit(&self, tenant: &str) -> u32 {
        self.lock()
            .get(tenant)
            .map(|w| w.limit)
            .unwrap_or(self.default_limit)
    }

    pub fn set_limit(&self, tenant: &str, limit: u32) {
        let mut tenants = self.lock();
        tenants
            .entry(tenant.to_string())
            .or_insert_with(|| TenantWindow {
                limit,
                buckets: HashMap::new(),
            })
            .limit = limit;
    }

    /// Whether this tenant already has an in-memory window (and thus a
    /// resolved limit).
    pub fn known(&self, tenant: &str) -> bool {
        self.lock().contains_key(tenant)
    }

    /// Seed the limit from persisted state without clobbering an
    /// operator override already in memory.
    pub fn ensure_limit(&self, tenant: &str, limit: u32) {
        let mut tenants = self.lock();
        tenants
            .entry(tenant.to_string())
            .or_insert_with(|| TenantWindow {
                limit,
                buckets: HashMap::new(),
            });
    }

    pub fn reset(&self, tenant: &str) {
        if let Some(window) = self.lock().get_mut(tenant) {
            window.buckets.clear();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TenantWindow>> {
        self.tenants.lock().unwrap_or_else(|e| e.into_inner())
    }
}
