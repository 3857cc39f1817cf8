use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub webrtc: WebRTCConfig,
    pub session: SessionConfig,
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// WebRTC configuration for the peer connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRTCConfig {
    /// STUN server URLs for NAT traversal
    pub stun_servers: Vec<String>,
    /// Optional TURN relay
    pub turn: Option<TurnConfig>,
    /// Number of ICE candidates gathered ahead of the first offer
    pub ice_candidate_pool_size: u8,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            turn: None,
            ice_candidate_pool_size: 10,
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// TURN server URL (e.g. "turn:turn.example.com:3478")
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Peer session lifecycle tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Tear down negotiations that have not connected after this many
    /// seconds. 0 waits forever.
    pub negotiation_timeout_seconds: u64,
    /// How often stalled negotiations are swept when the timeout is enabled
    pub sweep_interval_seconds: u64,
    /// Remote ICE candidates buffered per remote before the oldest are dropped
    pub max_pending_candidates: usize,
    /// Remotes that may hold buffered candidates at once; the oldest buffer is dropped
    pub max_pending_remotes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_seconds: 0,
            sweep_interval_seconds: 5,
            max_pending_candidates: 64,
            max_pending_remotes: 32,
        }
    }
}

impl SessionConfig {
    /// Negotiation timeout, `None` when disabled
    #[must_use]
    pub const fn negotiation_timeout(&self) -> Option<Duration> {
        if self.negotiation_timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.negotiation_timeout_seconds))
        }
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

/// Local capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Acquire a microphone track
    pub audio: bool,
    /// Acquire a camera track
    pub video: bool,
    /// Join with the microphone muted
    pub start_muted: bool,
    /// Join with the camera turned off
    pub start_camera_off: bool,
    /// Whether the capture device grants permission (synthetic source only)
    pub allow_capture: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            start_muted: false,
            start_camera_off: false,
            allow_capture: true,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (MESHCALL_LOGGING__LEVEL, etc.)
        builder = builder.add_source(
            Environment::with_prefix("MESHCALL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for url in &self.webrtc.stun_servers {
            if url.is_empty() {
                errors.push("webrtc.stun_servers contains an empty URL".to_string());
            } else if !(url.starts_with("stun:") || url.starts_with("stuns:")) {
                errors.push(format!("webrtc.stun_servers: '{url}' is not a stun: URL"));
            }
        }

        if let Some(turn) = &self.webrtc.turn {
            if !(turn.url.starts_with("turn:") || turn.url.starts_with("turns:")) {
                errors.push(format!("webrtc.turn.url: '{}' is not a turn: URL", turn.url));
            }
            if turn.username.is_empty() || turn.credential.is_empty() {
                errors.push("webrtc.turn requires username and credential".to_string());
            }
        }

        if self.session.max_pending_candidates == 0 {
            errors.push("session.max_pending_candidates must be greater than 0".to_string());
        }
        if self.session.max_pending_remotes == 0 {
            errors.push("session.max_pending_remotes must be greater than 0".to_string());
        }
        if self.session.negotiation_timeout_seconds > 0 && self.session.sweep_interval_seconds == 0
        {
            errors.push("session.sweep_interval_seconds must be greater than 0".to_string());
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format: '{}' is not one of json, pretty",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
