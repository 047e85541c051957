use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::PairLinkError;

/// Environment variable naming a JSON config file.
pub const CONFIG_PATH_ENV: &str = "PAIRLINK_CONFIG";
/// Environment override for the discovery port.
pub const DISCOVERY_PORT_ENV: &str = "PAIRLINK_DISCOVERY_PORT";

/// Full runtime configuration. Every field has a default, so an empty JSON
/// object (or no file at all) yields a working setup.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub discovery: DiscoveryConfig,
    pub signaling: SignalingConfig,
    pub recovery: RecoveryConfig,
    pub quality: QualityConfig,
    pub negotiation: NegotiationConfig,
}

impl SessionConfig {
    /// Load from `PAIRLINK_CONFIG` (if set) and apply environment overrides.
    pub fn from_env() -> Result<Self, PairLinkError> {
        let mut cfg = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Ok(raw) = std::env::var(DISCOVERY_PORT_ENV) {
            cfg.discovery.port = raw.parse().map_err(|_| PairLinkError::ConfigurationInvalid {
                reason: format!("{DISCOVERY_PORT_ENV}={raw} is not a port number"),
            })?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Read a JSON config file.
    pub fn load(path: &Path) -> Result<Self, PairLinkError> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw).map_err(|e| PairLinkError::ConfigurationInvalid {
            reason: format!("{}: {e}", path.display()),
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), PairLinkError> {
        let checks: [(&str, u64); 11] = [
            ("discovery.receiveTimeoutMs", self.discovery.receive_timeout_ms),
            ("signaling.maxTransportAttempts", self.signaling.max_transport_attempts as u64),
            ("signaling.pingIntervalMs", self.signaling.ping_interval_ms),
            ("signaling.readTimeoutMs", self.signaling.read_timeout_ms),
            ("signaling.precheckTimeoutMs", self.signaling.precheck_timeout_ms),
            ("signaling.connectTimeoutMs", self.signaling.connect_timeout_ms),
            ("signaling.writeTimeoutMs", self.signaling.write_timeout_ms),
            ("recovery.maxRestartAttempts", self.recovery.max_restart_attempts as u64),
            ("quality.tickMs", self.quality.tick_ms),
            ("quality.goodStreak", self.quality.good_streak as u64),
            ("discovery.port", self.discovery.port as u64),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(PairLinkError::ConfigurationInvalid {
                    reason: format!("{name} must be greater than zero"),
                });
            }
        }
        if self.quality.stall_threshold > self.quality.good_threshold {
            return Err(PairLinkError::ConfigurationInvalid {
                reason: "quality.stallThreshold must not exceed quality.goodThreshold".into(),
            });
        }
        Ok(())
    }
}

// MARK: - Discovery

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub port: u16,
    #[serde(alias = "announceTag")]
    pub announce_tag: String,
    #[serde(alias = "receiveTimeoutMs")]
    pub receive_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: 8888,
            announce_tag: "PAIRLINK_ANNOUNCE".into(),
            receive_timeout_ms: 1_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

// MARK: - Signaling

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    #[serde(alias = "statusPath")]
    pub status_path: String,
    #[serde(alias = "signalingPath")]
    pub signaling_path: String,
    #[serde(alias = "maxTransportAttempts")]
    pub max_transport_attempts: u32,
    #[serde(alias = "backoffStepMs")]
    pub backoff_step_ms: u64,
    #[serde(alias = "precheckTimeoutMs")]
    pub precheck_timeout_ms: u64,
    #[serde(alias = "connectTimeoutMs")]
    pub connect_timeout_ms: u64,
    #[serde(alias = "pingIntervalMs")]
    pub ping_interval_ms: u64,
    #[serde(alias = "readTimeoutMs")]
    pub read_timeout_ms: u64,
    #[serde(alias = "writeTimeoutMs")]
    pub write_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            status_path: "/status".into(),
            signaling_path: "/signaling".into(),
            max_transport_attempts: 5,
            backoff_step_ms: 2_000,
            precheck_timeout_ms: 3_000,
            connect_timeout_ms: 5_000,
            ping_interval_ms: 5_000,
            read_timeout_ms: 15_000,
            write_timeout_ms: 5_000,
        }
    }
}

impl SignalingConfig {
    /// Delay before transport attempt `attempt + 1`, growing linearly.
    pub fn transport_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_step_ms.saturating_mul(attempt as u64))
    }

    pub fn precheck_timeout(&self) -> Duration {
        Duration::from_millis(self.precheck_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

// MARK: - Recovery

/// Session-level restart policy, applied after the signaling layer has
/// exhausted its own transport attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    #[serde(alias = "maxRestartAttempts")]
    pub max_restart_attempts: u32,
    #[serde(alias = "backoffStepMs")]
    pub backoff_step_ms: u64,
    #[serde(alias = "maxBackoffMs")]
    pub max_backoff_ms: u64,
    /// Pause between a channel closing and discovery restarting.
    #[serde(alias = "restartDelayMs")]
    pub restart_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: 5,
            backoff_step_ms: 2_000,
            max_backoff_ms: 10_000,
            restart_delay_ms: 2_000,
        }
    }
}

impl RecoveryConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = self.backoff_step_ms.saturating_mul(attempt as u64).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

// MARK: - Quality

/// Adaptive quality thresholds. The defaults were tuned against one
/// decoder/display pairing; keep them unless the hardware changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    #[serde(alias = "tickMs")]
    pub tick_ms: u64,
    /// Decoded-frame delta below which a tick counts as a stall.
    #[serde(alias = "stallThreshold")]
    pub stall_threshold: u64,
    /// Decoded-frame delta at or above which a tick counts as good.
    #[serde(alias = "goodThreshold")]
    pub good_threshold: u64,
    #[serde(alias = "goodStreak")]
    pub good_streak: u32,
    #[serde(alias = "decreaseCooldownMs")]
    pub decrease_cooldown_ms: u64,
    #[serde(alias = "increaseCooldownMs")]
    pub increase_cooldown_ms: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            stall_threshold: 5,
            good_threshold: 16,
            good_streak: 8,
            decrease_cooldown_ms: 15_000,
            increase_cooldown_ms: 30_000,
        }
    }
}

impl QualityConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn decrease_cooldown(&self) -> Duration {
        Duration::from_millis(self.decrease_cooldown_ms)
    }

    pub fn increase_cooldown(&self) -> Duration {
        Duration::from_millis(self.increase_cooldown_ms)
    }
}

// MARK: - Negotiation

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Codec names (as they appear in `a=rtpmap`) stripped from remote offers.
    #[serde(alias = "filteredCodecs")]
    pub filtered_codecs: Vec<String>,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self { filtered_codecs: vec!["H265".into(), "AV1".into()] }
    }
}
