//! Per-host back-off requested by VCS hosts.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Hosts that asked us to slow down, and until when.
#[derive(Default)]
pub struct HostRateLimits {
    until: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl HostRateLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks dispatch to `host` until `until`. An earlier limit never
    /// shortens a later one.
    pub async fn limit(&self, host: &str, until: DateTime<Utc>) {
        let mut limits = self.until.lock().await;
        let entry = limits.entry(host.to_string()).or_insert(until);
        *entry = (*entry).max(until);
    }

    /// Returns the hosts still limited at `now`, dropping expired entries.
    pub async fn limited(&self, now: DateTime<Utc>) -> HashSet<String> {
        let mut limits = self.until.lock().await;
        limits.retain(|_, until| *until > now);
        limits.keys().cloned().collect()
    }
}
