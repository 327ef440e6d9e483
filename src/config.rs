//! Server configuration.
//!
//! Loaded from a TOML file merged with `HUDDLE_`-prefixed environment
//! variables. Unrecognized keys are a startup error, not a warning: a
//! typoed rate limit that silently falls back to a default is worse than
//! a refusal to boot.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::SignalingError;

/// What to do with a room whose last host left but which still has
/// participants, once the grace period expires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostlessPolicy {
    /// Close the room with a terminal event.
    #[default]
    CloseAfterGrace,
    /// Promote the earliest participant in draw order to host.
    AutoPromoteOldest,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the websocket listener binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// URL path segment in front of the room id: `/<ws_prefix>/<room_id>`.
    #[serde(default = "default_ws_prefix")]
    pub ws_prefix: String,

    /// Origins allowed to upgrade, compared by scheme and host. Empty
    /// list admits every origin; requests without an Origin header are
    /// always admitted (non-browser clients).
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// HMAC secret for the bundled JWT validator.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    #[serde(default)]
    pub enable_media_plane: bool,
    #[serde(default)]
    pub media_plane_addr: Option<String>,

    /// How long an empty or hostless room is preserved for a reconnect.
    #[serde(with = "humantime_serde", default = "default_cleanup_grace")]
    pub cleanup_grace: Duration,

    #[serde(default)]
    pub hostless_policy: HostlessPolicy,

    // Rate limits, in permits per minute per bucket.
    #[serde(default = "default_rate_api_global")]
    pub rate_limit_api_global: u32,
    #[serde(default = "default_rate_api_public")]
    pub rate_limit_api_public: u32,
    #[serde(default = "default_rate_api_rooms")]
    pub rate_limit_api_rooms: u32,
    #[serde(default = "default_rate_api_messages")]
    pub rate_limit_api_messages: u32,
    #[serde(default = "default_rate_ws_ip")]
    pub rate_limit_ws_ip: u32,
    #[serde(default = "default_rate_ws_user")]
    pub rate_limit_ws_user: u32,

    /// Disables the per-user message gate and lets the `username` query
    /// parameter override the client id, so one principal can simulate a
    /// full room.
    #[serde(default)]
    pub dev_mode: bool,

    /// Address of the cross-instance bus. Absent means single-instance.
    #[serde(default)]
    pub bus_addr: Option<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Capacity of each session's normal outbound queue, in frames.
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    /// Capacity of each session's priority outbound queue, in frames.
    #[serde(default = "default_priority_queue_capacity")]
    pub priority_queue_capacity: usize,
    /// How many public chat events a room retains for replay.
    #[serde(default = "default_recent_chat_capacity")]
    pub recent_chat_capacity: usize,

    /// Interval between server keep-alive pings. Two unanswered pings
    /// tear the session down.
    #[serde(with = "humantime_serde", default = "default_ping_interval")]
    pub ping_interval: Duration,
    /// Deadline for a single socket write.
    #[serde(with = "humantime_serde", default = "default_write_timeout")]
    pub write_timeout: Duration,
    /// Deadline for graceful shutdown.
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8443".to_owned()
}
fn default_ws_prefix() -> String {
    "ws".to_owned()
}
fn default_cleanup_grace() -> Duration {
    Duration::from_secs(5)
}
fn default_rate_api_global() -> u32 {
    1000
}
fn default_rate_api_public() -> u32 {
    300
}
fn default_rate_api_rooms() -> u32 {
    300
}
fn default_rate_api_messages() -> u32 {
    600
}
fn default_rate_ws_ip() -> u32 {
    30
}
fn default_rate_ws_user() -> u32 {
    30
}
fn default_log_level() -> String {
    "info".to_owned()
}
fn default_send_queue_capacity() -> usize {
    256
}
fn default_priority_queue_capacity() -> usize {
    64
}
fn default_recent_chat_capacity() -> usize {
    128
}
fn default_ping_interval() -> Duration {
    Duration::from_secs(20)
}
fn default_write_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for Config {
    fn default() -> Self {
        Self::from_figment(Figment::new()).expect("defaults are valid")
    }
}

impl Config {
    /// Loads configuration from `path` (if it exists) merged with
    /// `HUDDLE_`-prefixed environment variables. Environment wins.
    pub fn load(path: Option<&Path>) -> Result<Self, SignalingError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        } else {
            figment = figment.merge(Toml::file("huddle.toml"));
        }
        Self::from_figment(figment.merge(Env::prefixed("HUDDLE_")))
    }

    fn from_figment(figment: Figment) -> Result<Self, SignalingError> {
        figment
            .extract::<Self>()
            .map_err(|e| SignalingError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml: &str) -> Result<Config, SignalingError> {
        Config::from_figment(Figment::from(Toml::string(toml)))
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.cleanup_grace, Duration::from_secs(5));
        assert_eq!(config.hostless_policy, HostlessPolicy::CloseAfterGrace);
        assert_eq!(config.ws_prefix, "ws");
        assert!(!config.dev_mode);
        assert!(config.bus_addr.is_none());
    }

    #[test]
    fn recognized_keys_parse() {
        let config = from_toml(
            r#"
            listen_addr = "0.0.0.0:9000"
            allowed_origins = ["https://meet.example.com"]
            cleanup_grace = "30s"
            hostless_policy = "auto_promote_oldest"
            rate_limit_ws_ip = 10
            dev_mode = true
            recent_chat_capacity = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.cleanup_grace, Duration::from_secs(30));
        assert_eq!(config.hostless_policy, HostlessPolicy::AutoPromoteOldest);
        assert_eq!(config.rate_limit_ws_ip, 10);
        assert_eq!(config.recent_chat_capacity, 16);
        assert!(config.dev_mode);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = from_toml("cleanup_grace_period = \"5s\"").unwrap_err();
        assert!(matches!(err, SignalingError::Config(_)));
    }

    #[test]
    fn bad_duration_is_rejected() {
        assert!(from_toml("cleanup_grace = \"not a duration\"").is_err());
    }
}
