//! Client configuration and reconnect policy.
//!
//! Defaults mirror the product's shipped network settings: dev endpoint
//! `ws://localhost:3000`, 5 reconnect attempts starting at 1 s with ×2
//! backoff capped at 30 s, 20 Hz sync rate. Presence thresholds derive from
//! the heartbeat interval unless overridden. Validation happens once at
//! session construction; violations are fatal configuration errors, never
//! silently corrected.

use std::time::Duration;

use crate::error::SyncError;

/// Exponential backoff parameters for the reconnection coordinator.
///
/// The effective delay for attempt `n` is
/// `min(base_delay_ms * multiplier^n, max_delay_ms)` widened by
/// `± jitter_ratio` and clamped back under the ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failures tolerated before the session settles in the
    /// terminal disconnected state.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomized in both directions, `0.0..1.0`.
    pub jitter_ratio: f64,
    /// Delay ceiling in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            jitter_ratio: 0.3,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.base_delay_ms == 0 {
            return Err(SyncError::FatalConfig(
                "reconnect base delay must be positive".into(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(SyncError::FatalConfig(format!(
                "reconnect delay ceiling {} ms is below base delay {} ms",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(SyncError::FatalConfig(format!(
                "reconnect multiplier {} must be >= 1.0",
                self.multiplier
            )));
        }
        if !self.jitter_ratio.is_finite() || !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(SyncError::FatalConfig(format!(
                "jitter ratio {} must be in [0.0, 1.0)",
                self.jitter_ratio
            )));
        }
        Ok(())
    }
}

/// Read-only inputs to the synchronization engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `ws://` for development, `wss://` in production. Anything else is
    /// rejected by [`SyncConfig::validate`].
    pub server_url: String,
    /// When false, any transport failure goes straight to the terminal
    /// disconnected state instead of entering the retry loop.
    pub auto_reconnect: bool,
    pub reconnect: ReconnectPolicy,
    /// Outbound flush frequency; the scheduler ticks every `1000 / rate` ms.
    pub sync_rate_hz: u32,
    /// Gates voice membership only; no media transport exists here.
    pub voip_enabled: bool,
    /// Cadence of outbound heartbeats and of the presence sweep.
    pub heartbeat_interval: Duration,
    /// Presence threshold overrides. When `None`, derived from the
    /// heartbeat interval as 2×, 3× and 10× respectively.
    pub stale_after: Option<Duration>,
    pub offline_after: Option<Duration>,
    pub evict_after: Option<Duration>,
    pub connect_timeout: Duration,
    /// A resync not answered within this window counts as a transport
    /// failure and re-enters the reconnect path.
    pub resync_timeout: Duration,
    /// Upper bound on mutations per outbound message.
    pub max_batch: usize,
    /// Upper bound on pending (unacknowledged) mutations.
    pub max_queue: usize,
    /// Consecutive non-empty flush ticks before the degraded-sync signal.
    pub degraded_after_ticks: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:3000".into(),
            auto_reconnect: true,
            reconnect: ReconnectPolicy::default(),
            sync_rate_hz: 20,
            voip_enabled: false,
            heartbeat_interval: Duration::from_secs(5),
            stale_after: None,
            offline_after: None,
            evict_after: None,
            connect_timeout: Duration::from_secs(10),
            resync_timeout: Duration::from_secs(10),
            max_batch: 128,
            max_queue: 10_000,
            degraded_after_ticks: 40,
        }
    }
}

impl SyncConfig {
    /// Flush tick period: `1000 / sync_rate_hz` ms (50 ms at 20 Hz).
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(1_000 / u64::from(self.sync_rate_hz.max(1)))
    }

    /// Idle window after which a collaborator reads as `away`.
    pub fn stale_after(&self) -> Duration {
        self.stale_after.unwrap_or(self.heartbeat_interval * 2)
    }

    /// Idle window after which a collaborator reads as `offline`.
    pub fn offline_after(&self) -> Duration {
        self.offline_after.unwrap_or(self.heartbeat_interval * 3)
    }

    /// Idle window after which a collaborator is evicted from the roster.
    pub fn evict_after(&self) -> Duration {
        self.evict_after.unwrap_or(self.heartbeat_interval * 10)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            return Err(SyncError::FatalConfig(format!(
                "server URL \"{}\" must use the ws:// or wss:// scheme",
                self.server_url
            )));
        }
        if self.sync_rate_hz == 0 || self.sync_rate_hz > 1_000 {
            return Err(SyncError::FatalConfig(format!(
                "sync rate {} Hz out of range (1..=1000)",
                self.sync_rate_hz
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(SyncError::FatalConfig(
                "heartbeat interval must be positive".into(),
            ));
        }
        if self.max_batch == 0 {
            return Err(SyncError::FatalConfig("max batch size must be positive".into()));
        }
        if self.max_queue < self.max_batch {
            return Err(SyncError::FatalConfig(format!(
                "queue bound {} is below batch bound {}",
                self.max_queue, self.max_batch
            )));
        }
        if self.degraded_after_ticks == 0 {
            return Err(SyncError::FatalConfig(
                "degraded-tick threshold must be positive".into(),
            ));
        }
        let stale = self.stale_after();
        let offline = self.offline_after();
        let evict = self.evict_after();
        if stale >= offline || offline >= evict {
            return Err(SyncError::FatalConfig(format!(
                "presence thresholds must increase: stale {:?} < offline {:?} < evict {:?}",
                stale, offline, evict
            )));
        }
        self.reconnect.validate()
    }

    /// Overlay `ARXIS_*` environment variables onto the defaults. Malformed
    /// values keep the default rather than failing startup.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("ARXIS_SYNC_URL") {
            config.server_url = v;
        }
        if let Ok(v) = std::env::var("ARXIS_AUTO_RECONNECT") {
            config.auto_reconnect = v.parse().unwrap_or(config.auto_reconnect);
        }
        if let Ok(v) = std::env::var("ARXIS_MAX_RECONNECT_ATTEMPTS") {
            config.reconnect.max_attempts = v.parse().unwrap_or(config.reconnect.max_attempts);
        }
        if let Ok(v) = std::env::var("ARXIS_RECONNECT_BASE_MS") {
            config.reconnect.base_delay_ms = v.parse().unwrap_or(config.reconnect.base_delay_ms);
        }
        if let Ok(v) = std::env::var("ARXIS_RECONNECT_MAX_MS") {
            config.reconnect.max_delay_ms = v.parse().unwrap_or(config.reconnect.max_delay_ms);
        }
        if let Ok(v) = std::env::var("ARXIS_SYNC_RATE_HZ") {
            config.sync_rate_hz = v.parse().unwrap_or(config.sync_rate_hz);
        }
        if let Ok(v) = std::env::var("ARXIS_VOIP_ENABLED") {
            config.voip_enabled = v.parse().unwrap_or(config.voip_enabled);
        }
        if let Ok(v) = std::env::var("ARXIS_HEARTBEAT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                config.heartbeat_interval = Duration::from_millis(ms);
            }
        }

        config
    }
}
