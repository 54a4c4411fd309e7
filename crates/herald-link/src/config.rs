//! # Link Configuration
//!
//! Configuration management for the push channel.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     HERALD_BROKER_URL=wss://push.example.com/ws                        │
//! │     HERALD_RECONNECT_DELAY_MS=5000                                     │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/herald/link.toml (Linux)                                 │
//! │     ~/Library/Application Support/com.herald.herald/link.toml (macOS)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # link.toml
//! [server]
//! url = "wss://push.example.com/ws"
//! connect_timeout_secs = 10
//!
//! [heartbeat]
//! outgoing_ms = 10000
//! incoming_ms = 10000
//!
//! [reconnect]
//! delay_ms = 5000
//! max_delay_secs = 60
//! jitter = 0.2
//! max_attempts = 10
//! settle_ms = 1000
//!
//! [topics]
//! inbound = "/user/queue/notifications"
//! outbound = "/app/send"
//!
//! [auth]
//! error_threshold = 3
//! error_window_secs = 300
//!
//! [notifications]
//! platform_enabled = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{LinkError, LinkResult};

/// Placeholder replaced by the session identity in topic templates.
pub const IDENTITY_PLACEHOLDER: &str = "{identity}";

// =============================================================================
// Server Settings
// =============================================================================

/// Broker endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// WebSocket URL of the STOMP broker.
    #[serde(default)]
    pub url: Option<String>,

    /// Timeout for the WebSocket upgrade (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            url: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

// =============================================================================
// Heart-beat Settings
// =============================================================================

/// STOMP heart-beat intervals offered on CONNECT.
///
/// `0` disables that direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    /// How often we can send heart-beats (milliseconds).
    #[serde(default = "default_heartbeat_ms")]
    pub outgoing_ms: u64,

    /// How often we want to receive heart-beats (milliseconds).
    #[serde(default = "default_heartbeat_ms")]
    pub incoming_ms: u64,
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        HeartbeatSettings {
            outgoing_ms: default_heartbeat_ms(),
            incoming_ms: default_heartbeat_ms(),
        }
    }
}

// =============================================================================
// Reconnect Settings
// =============================================================================

/// Reconnect policy after an abnormal closure.
///
/// ## Backoff Strategy
/// ```text
/// Attempt 1: delay_ms              (5s by default)
/// Attempt 2: delay_ms * 2          (10s)
/// Attempt 3: delay_ms * 4          (20s)
/// ...
/// Max:       max_delay_secs        (60s)
/// Each delay is randomised by ± jitter (0 = exact).
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// First reconnect delay (milliseconds).
    #[serde(default = "default_reconnect_delay")]
    pub delay_ms: u64,

    /// Upper bound for the reconnect delay (seconds).
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Randomisation factor in `[0, 1]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Consecutive failed attempts before giving up.
    /// Set to 0 for infinite retries.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause between teardown and reconnect in `force_reconnect` (milliseconds).
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
}

fn default_reconnect_delay() -> u64 {
    5_000
}
fn default_max_delay() -> u64 {
    60
}
fn default_jitter() -> f64 {
    0.2
}
fn default_max_attempts() -> u32 {
    10
}
fn default_settle() -> u64 {
    1_000
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        ReconnectSettings {
            delay_ms: default_reconnect_delay(),
            max_delay_secs: default_max_delay(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
            settle_ms: default_settle(),
        }
    }
}

// =============================================================================
// Topic Settings
// =============================================================================

/// Default destinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSettings {
    /// Per-user notification queue. `{identity}` is replaced by the session identity.
    #[serde(default = "default_inbound_topic")]
    pub inbound: String,

    /// Default destination for `publish`.
    #[serde(default = "default_outbound_topic")]
    pub outbound: String,
}

fn default_inbound_topic() -> String {
    "/user/queue/notifications".to_string()
}

fn default_outbound_topic() -> String {
    "/app/send".to_string()
}

impl Default for TopicSettings {
    fn default() -> Self {
        TopicSettings {
            inbound: default_inbound_topic(),
            outbound: default_outbound_topic(),
        }
    }
}

// =============================================================================
// Auth Settings
// =============================================================================

/// Authentication-failure escalation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Authentication errors within the window that force a logout.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// Idle time after which the error counter resets (seconds).
    #[serde(default = "default_error_window")]
    pub error_window_secs: u64,
}

fn default_error_threshold() -> u32 {
    3
}

fn default_error_window() -> u64 {
    300
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            error_threshold: default_error_threshold(),
            error_window_secs: default_error_window(),
        }
    }
}

// =============================================================================
// Notification Settings
// =============================================================================

/// Platform notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// Forward new notifications to the platform notifier.
    #[serde(default = "default_true")]
    pub platform_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NotificationSettings {
    fn default() -> Self {
        NotificationSettings {
            platform_enabled: true,
        }
    }
}

// =============================================================================
// Main Link Configuration
// =============================================================================

/// Complete push channel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Broker endpoint.
    #[serde(default)]
    pub server: ServerSettings,

    /// Heart-beat offer.
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    /// Reconnect policy.
    #[serde(default)]
    pub reconnect: ReconnectSettings,

    /// Default destinations.
    #[serde(default)]
    pub topics: TopicSettings,

    /// Authentication-failure escalation.
    #[serde(default)]
    pub auth: AuthSettings,

    /// Platform notifications.
    #[serde(default)]
    pub notifications: NotificationSettings,
}

impl LinkConfig {
    /// Creates a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a default config pointing at `url`.
    pub fn with_url(url: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.server.url = Some(url.into());
        config
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (link.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> LinkResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading link config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = Self::from_toml(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load link config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Parses a TOML document.
    pub fn from_toml(contents: &str) -> LinkResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> LinkResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| LinkError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Link config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> LinkResult<()> {
        if let Some(ref raw) = self.server.url {
            if !raw.starts_with("ws://") && !raw.starts_with("wss://") {
                return Err(LinkError::InvalidUrl(format!(
                    "Broker URL must start with ws:// or wss://, got: {}",
                    raw
                )));
            }
            url::Url::parse(raw)?;
        }

        if self.reconnect.delay_ms == 0 {
            return Err(LinkError::InvalidConfig(
                "reconnect.delay_ms must be greater than 0".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(LinkError::InvalidConfig(format!(
                "reconnect.jitter must be within [0, 1], got {}",
                self.reconnect.jitter
            )));
        }

        if self.auth.error_threshold == 0 {
            return Err(LinkError::InvalidConfig(
                "auth.error_threshold must be at least 1".into(),
            ));
        }

        for (name, topic) in [
            ("topics.inbound", &self.topics.inbound),
            ("topics.outbound", &self.topics.outbound),
        ] {
            if !topic.starts_with('/') {
                return Err(LinkError::InvalidConfig(format!(
                    "{} must start with '/', got: '{}'",
                    name, topic
                )));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("HERALD_BROKER_URL") {
            debug!(url = %url, "Overriding broker URL from environment");
            self.server.url = Some(url);
        }

        if let Some(secs) = lookup("HERALD_CONNECT_TIMEOUT_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                self.server.connect_timeout_secs = s;
            }
        }

        if let Some(ms) = lookup("HERALD_RECONNECT_DELAY_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                debug!(delay_ms = ms, "Overriding reconnect delay from environment");
                self.reconnect.delay_ms = ms;
            }
        }

        if let Some(attempts) = lookup("HERALD_RECONNECT_MAX_ATTEMPTS") {
            if let Ok(a) = attempts.parse::<u32>() {
                self.reconnect.max_attempts = a;
            }
        }

        if let Some(topic) = lookup("HERALD_INBOUND_TOPIC") {
            self.topics.inbound = topic;
        }

        if let Some(topic) = lookup("HERALD_OUTBOUND_TOPIC") {
            self.topics.outbound = topic;
        }

        if let Some(enabled) = lookup("HERALD_PLATFORM_NOTIFICATIONS") {
            match enabled.to_lowercase().as_str() {
                "1" | "true" | "on" => self.notifications.platform_enabled = true,
                "0" | "false" | "off" => self.notifications.platform_enabled = false,
                _ => warn!(value = %enabled, "Unknown platform notification flag in environment"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "herald", "herald")
            .map(|dirs| dirs.config_dir().join("link.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the broker URL if configured.
    pub fn broker_url(&self) -> Option<&str> {
        self.server.url.as_deref()
    }

    /// Resolves the per-user inbound topic for `identity`.
    pub fn inbound_topic(&self, identity: &str) -> String {
        self.topics.inbound.replace(IDENTITY_PLACEHOLDER, identity)
    }

    /// Default outbound destination.
    pub fn outbound_topic(&self) -> &str {
        &self.topics.outbound
    }

    /// WebSocket upgrade timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.server.connect_timeout_secs)
    }

    /// First reconnect delay.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect.delay_ms)
    }

    /// Settle delay used by `force_reconnect`.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect.settle_ms)
    }

    /// Idle time after which authentication errors are forgotten.
    pub fn auth_error_window(&self) -> Duration {
        Duration::from_secs(self.auth.error_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = LinkConfig::default();
        assert!(config.broker_url().is_none());
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.settle_delay(), Duration::from_secs(1));
        assert_eq!(config.auth.error_threshold, 3);
        assert_eq!(config.auth_error_window(), Duration::from_secs(300));
        assert_eq!(config.outbound_topic(), "/app/send");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = LinkConfig::with_url("ws://localhost:8080/ws");
        assert!(config.validate().is_ok());

        config.server.url = Some("http://localhost:8080/ws".into());
        assert!(matches!(config.validate(), Err(LinkError::InvalidUrl(_))));

        config.server.url = Some("wss://push.example.com/ws".into());
        config.reconnect.jitter = 1.5;
        assert!(config.validate().is_err());

        config.reconnect.jitter = 0.0;
        config.auth.error_threshold = 0;
        assert!(config.validate().is_err());

        config.auth.error_threshold = 3;
        config.topics.outbound = "app/send".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_partial_document() {
        let config = LinkConfig::from_toml(
            r#"
            [server]
            url = "wss://push.example.com/ws"

            [reconnect]
            delay_ms = 2500
            "#,
        )
        .unwrap();

        assert_eq!(config.broker_url(), Some("wss://push.example.com/ws"));
        assert_eq!(config.reconnect.delay_ms, 2500);
        // Untouched fields keep their defaults.
        assert_eq!(config.reconnect.max_delay_secs, 60);
        assert_eq!(config.heartbeat.incoming_ms, 10_000);
    }

    #[test]
    fn test_toml_roundtrip_sections() {
        let toml_str = toml::to_string_pretty(&LinkConfig::default()).unwrap();
        assert!(toml_str.contains("[server]"));
        assert!(toml_str.contains("[reconnect]"));
        assert!(toml_str.contains("[topics]"));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("HERALD_BROKER_URL", "ws://10.0.0.2:9000/ws"),
            ("HERALD_RECONNECT_DELAY_MS", "750"),
            ("HERALD_PLATFORM_NOTIFICATIONS", "off"),
            ("HERALD_INBOUND_TOPIC", "/user/{identity}/queue/alerts"),
        ]
        .into_iter()
        .collect();

        let mut config = LinkConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.broker_url(), Some("ws://10.0.0.2:9000/ws"));
        assert_eq!(config.reconnect.delay_ms, 750);
        assert!(!config.notifications.platform_enabled);
        assert_eq!(config.inbound_topic("u-7"), "/user/u-7/queue/alerts");
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("herald-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("link.toml");

        let mut config = LinkConfig::with_url("ws://127.0.0.1:61613/ws");
        config.reconnect.max_attempts = 4;
        config.save(Some(path.clone())).unwrap();

        let loaded = LinkConfig::from_toml(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.broker_url(), Some("ws://127.0.0.1:61613/ws"));
        assert_eq!(loaded.reconnect.max_attempts, 4);

        let _ = std::fs::remove_dir_all(dir);
    }
}
