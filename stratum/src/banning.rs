use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use orepool_core::Clock;
use serde::{Deserialize, Serialize};

/// Cluster-wide banning policy, straight from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BanningPolicy {
    pub ban_on_junk_receive: bool,
    pub ban_on_invalid_shares: bool,
    /// Invalid shares tolerated inside the observation window before a ban.
    pub invalid_share_threshold: u32,
    pub invalid_share_window_secs: u64,
    pub ban_duration_secs: u64,
}

impl Default for BanningPolicy {
    fn default() -> Self {
        Self {
            ban_on_junk_receive: true,
            ban_on_invalid_shares: true,
            invalid_share_threshold: 30,
            invalid_share_window_secs: 60,
            ban_duration_secs: 30 * 60,
        }
    }
}

impl BanningPolicy {
    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }
}

#[derive(Debug, Clone, Copy)]
struct InvalidShareWindow {
    count: u32,
    window_start_ms: u64,
}

/// Timed IP ban list. Lookups are O(1); expired entries are purged on access
/// rather than by a sweeper task.
pub struct BanManager {
    clock: Arc<dyn Clock>,
    policy: BanningPolicy,
    bans: DashMap<IpAddr, u64>,
    invalid_shares: DashMap<IpAddr, InvalidShareWindow>,
}

impl BanManager {
    pub fn new(clock: Arc<dyn Clock>, policy: BanningPolicy) -> Self {
        Self { clock, policy, bans: DashMap::new(), invalid_shares: DashMap::new() }
    }

    pub fn policy(&self) -> &BanningPolicy {
        &self.policy
    }

    pub fn is_banned(&self, addr: IpAddr) -> bool {
        let now = self.clock.now_unix_millis();
        let active = match self.bans.get(&addr) {
            Some(expiry) => *expiry > now,
            None => return false,
        };
        if !active {
            self.bans.remove(&addr);
        }
        active
    }

    pub fn ban(&self, addr: IpAddr, duration: Duration) {
        let expiry = self.clock.now_unix_millis() + duration.as_millis() as u64;
        self.bans.insert(addr, expiry);
        tracing::info!("banned {} for {:?}", addr, duration);
    }

    /// Called by the session when a peer sends unparseable data. Returns
    /// whether the peer was banned.
    pub fn report_junk_receive(&self, addr: IpAddr) -> bool {
        if !self.policy.ban_on_junk_receive {
            return false;
        }
        self.ban(addr, self.policy.ban_duration());
        true
    }

    /// Called by the validator on each rejected share. Bans once the count
    /// inside the rolling window crosses the configured threshold.
    pub fn report_invalid_share(&self, addr: IpAddr) -> bool {
        if !self.policy.ban_on_invalid_shares {
            return false;
        }
        let now = self.clock.now_unix_millis();
        let window_ms = self.policy.invalid_share_window_secs * 1000;
        let mut entry = self.invalid_shares.entry(addr).or_insert(InvalidShareWindow { count: 0, window_start_ms: now });
        if now.saturating_sub(entry.window_start_ms) > window_ms {
            entry.count = 0;
            entry.window_start_ms = now;
        }
        entry.count += 1;
        let exceeded = entry.count >= self.policy.invalid_share_threshold;
        drop(entry);
        if exceeded {
            self.invalid_shares.remove(&addr);
            self.ban(addr, self.policy.ban_duration());
        }
        exceeded
    }
}
