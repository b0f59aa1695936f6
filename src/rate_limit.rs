//! Per-tenant event quotas.
//!
//! Two tiers: the default tier caps events at 10,000 per rolling 24-hour
//! window; premium tenants have no daily cap. Registration caps exist on
//! both tiers but the ingress only observes registrations, it never creates
//! them. State is one small table behind a single mutex.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

pub const DEFAULT_DAILY_LIMIT: u32 = 10_000;
pub const DEFAULT_REGISTRATION_LIMIT: u32 = 20;
pub const PREMIUM_REGISTRATION_LIMIT: u32 = 50;

#[derive(Debug, Clone)]
struct TenantQuota {
    daily_count: u32,
    window_start: DateTime<Utc>,
    registration_count: u32,
    premium: bool,
}

pub struct QuotaLimiter {
    tenants: Mutex<HashMap<String, TenantQuota>>,
    daily_limit: u32,
    registration_limit: u32,
}

impl QuotaLimiter {
    pub fn new() -> Self {
        Self::with_daily_limit(DEFAULT_DAILY_LIMIT)
    }

    pub fn with_daily_limit(daily_limit: u32) -> Self {
        Self {
            tenants: Mutex::new(HashMap::new()),
            daily_limit,
            registration_limit: DEFAULT_REGISTRATION_LIMIT,
        }
    }

    /// Charge one event against the tenant's quota.
    ///
    /// Creates the counter lazily and rolls the window once 24 hours have
    /// elapsed since its anchor. Returns `false` when the tenant is over
    /// its registration cap or, on the default tier, its daily cap.
    pub fn allow(&self, tenant_id: &str) -> bool {
        self.allow_at(tenant_id, Utc::now())
    }

    fn allow_at(&self, tenant_id: &str, now: DateTime<Utc>) -> bool {
        let mut tenants = self.tenants.lock().expect("rate limiter mutex poisoned");

        let quota = tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantQuota {
                daily_count: 0,
                window_start: now,
                registration_count: 0,
                premium: false,
            });

        if now - quota.window_start >= Duration::hours(24) {
            quota.daily_count = 0;
            quota.window_start = now;
        }

        let registration_cap = if quota.premium {
            PREMIUM_REGISTRATION_LIMIT
        } else {
            self.registration_limit
        };
        if quota.registration_count >= registration_cap {
            return false;
        }

        if quota.premium {
            quota.daily_count += 1;
            return true;
        }

        if quota.daily_count >= self.daily_limit {
            return false;
        }

        quota.daily_count += 1;
        true
    }

    /// Flip a tenant to the premium tier (no daily cap).
    pub fn set_premium(&self, tenant_id: &str, premium: bool) {
        let mut tenants = self.tenants.lock().expect("rate limiter mutex poisoned");
        tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantQuota {
                daily_count: 0,
                window_start: Utc::now(),
                registration_count: 0,
                premium: false,
            })
            .premium = premium;
    }

    /// Record the tenant's known webhook-registration count.
    pub fn set_registrations(&self, tenant_id: &str, count: u32) {
        let mut tenants = self.tenants.lock().expect("rate limiter mutex poisoned");
        tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantQuota {
                daily_count: 0,
                window_start: Utc::now(),
                registration_count: 0,
                premium: false,
            })
            .registration_count = count;
    }
}

impl Default for QuotaLimiter {
    fn default() -> Self {
        Self::new()
    }
}
