//! # Configuration Management
//!
//! Loads the observer's settings from layered sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between section and key)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_STREAM__URL`, `APP_AUDIO__ENABLED`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Rust Concepts Used:
//! - **Serde**: The same structs deserialize from TOML, env vars and JSON
//! - **Builder pattern**: `config::Config::builder()` stacks sources in priority order
//! - **anyhow::Result**: Startup errors carry a message and bubble up with `?`

use crate::audio::PcmFormat;
use crate::stream::StreamSettings;
use crate::view::ViewLimits;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::env;

pub const DEFAULT_STREAM_URL: &str =
    "wss://clinic-hepa-backend-481780815788.us-central1.run.app/ws/simulation";

/// Main application configuration.
///
/// ## Sections:
/// - **server**: Where the local observer API listens
/// - **stream**: Which simulation server to follow and how to start it
/// - **audio**: Playback device and the format of header-less audio
/// - **views**: Caps applied to the ranked lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub stream: StreamConfig,
    pub audio: AudioConfig,
    pub views: ViewsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Simulation server connection settings.
///
/// ## Fields:
/// - `url`: WebSocket endpoint (`ws://` or `wss://`)
/// - `start_message`: Text frame that tells the server to begin the interview
/// - `connect_on_startup`: Open the connection as soon as the observer starts
///   (the default). When false, the first start request opens it. The audio
///   output is acquired on the start request either way
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub url: String,
    pub start_message: String,
    pub connect_on_startup: bool,
}

/// Audio playback settings.
///
/// ## Fields:
/// - `enabled`: When false, audio events are accepted and silently dropped
/// - `output_device`: Output device name; empty selects the system default
/// - `fallback_sample_rate` / `fallback_channels`: Format assumed for raw PCM payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub enabled: bool,
    pub output_device: String,
    pub fallback_sample_rate: u32,
    pub fallback_channels: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewsConfig {
    pub diagnosis_limit: usize,
    pub active_question_limit: usize,
    pub asked_history_limit: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let limits = ViewLimits::default();
        let pcm = PcmFormat::default();
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            stream: StreamConfig {
                url: DEFAULT_STREAM_URL.to_string(),
                start_message: "start".to_string(),
                connect_on_startup: true,
            },
            audio: AudioConfig {
                enabled: true,
                output_device: String::new(),
                fallback_sample_rate: pcm.sample_rate,
                fallback_channels: pcm.channels,
            },
            views: ViewsConfig {
                diagnosis_limit: limits.diagnoses,
                active_question_limit: limits.active_questions,
                asked_history_limit: limits.asked_history,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_STREAM__URL=ws://localhost:8000/ws/simulation`: Follow a local server
    /// - `APP_AUDIO__ENABLED=false`: Run without touching the sound card
    /// - `APP_VIEWS__DIAGNOSIS_LIMIT=5`: Show five diagnoses
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("Server port cannot be 0");
        }

        let url = self.stream.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            bail!("Stream URL must start with ws:// or wss://, got '{}'", url);
        }

        if self.stream.start_message.trim().is_empty() {
            bail!("Start message cannot be empty");
        }

        if self.audio.fallback_sample_rate == 0 {
            bail!("Fallback sample rate must be greater than 0");
        }

        if self.audio.fallback_channels == 0 {
            bail!("Fallback channel count must be greater than 0");
        }

        if self.views.diagnosis_limit == 0
            || self.views.active_question_limit == 0
            || self.views.asked_history_limit == 0
        {
            bail!("View limits must be greater than 0");
        }

        Ok(())
    }

    /// Apply a partial JSON update, e.g. `{"views": {"diagnosis_limit": 5}}`.
    ///
    /// Fields that are absent keep their value. The result is validated before
    /// returning, so on error `self` may hold a half-applied update and the
    /// caller should discard it.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)?;
            }
        }

        if let Some(stream) = partial_config.get("stream") {
            if let Some(url) = stream.get("url").and_then(|v| v.as_str()) {
                self.stream.url = url.to_string();
            }
            if let Some(message) = stream.get("start_message").and_then(|v| v.as_str()) {
                self.stream.start_message = message.to_string();
            }
            if let Some(flag) = stream.get("connect_on_startup").and_then(|v| v.as_bool()) {
                self.stream.connect_on_startup = flag;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(flag) = audio.get("enabled").and_then(|v| v.as_bool()) {
                self.audio.enabled = flag;
            }
            if let Some(device) = audio.get("output_device").and_then(|v| v.as_str()) {
                self.audio.output_device = device.to_string();
            }
            if let Some(rate) = audio.get("fallback_sample_rate").and_then(|v| v.as_u64()) {
                self.audio.fallback_sample_rate = u32::try_from(rate)?;
            }
            if let Some(channels) = audio.get("fallback_channels").and_then(|v| v.as_u64()) {
                self.audio.fallback_channels = u16::try_from(channels)?;
            }
        }

        if let Some(views) = partial_config.get("views") {
            if let Some(limit) = views.get("diagnosis_limit").and_then(|v| v.as_u64()) {
                self.views.diagnosis_limit = limit as usize;
            }
            if let Some(limit) = views.get("active_question_limit").and_then(|v| v.as_u64()) {
                self.views.active_question_limit = limit as usize;
            }
            if let Some(limit) = views.get("asked_history_limit").and_then(|v| v.as_u64()) {
                self.views.asked_history_limit = limit as usize;
            }
        }

        self.validate()?;
        Ok(())
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            url: self.stream.url.trim().to_string(),
            start_message: self.stream.start_message.clone(),
        }
    }

    pub fn view_limits(&self) -> ViewLimits {
        ViewLimits {
            diagnoses: self.views.diagnosis_limit,
            active_questions: self.views.active_question_limit,
            asked_history: self.views.asked_history_limit,
        }
    }

    pub fn pcm_format(&self) -> PcmFormat {
        PcmFormat {
            sample_rate: self.audio.fallback_sample_rate,
            channels: self.audio.fallback_channels,
        }
    }

    /// `None` selects the host's default output device.
    pub fn output_device(&self) -> Option<String> {
        let name = self.audio.output_device.trim();
        (!name.is_empty()).then(|| name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.stream.url, DEFAULT_STREAM_URL);
        assert_eq!(config.stream.start_message, "start");
        assert!(config.stream.connect_on_startup);
        assert_eq!(config.view_limits(), ViewLimits::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.stream.url = "https://example.com/ws".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.stream.start_message = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.views.asked_history_limit = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.fallback_channels = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "views": {"diagnosis_limit": 5}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.view_limits().diagnoses, 5);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.view_limits().active_questions, 10);
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());

        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"stream": {"url": "ftp://x"}}"#).is_err());
    }

    #[test]
    fn test_output_device_blank_means_default() {
        let mut config = AppConfig::default();
        assert_eq!(config.output_device(), None);
        config.audio.output_device = " USB Speakers ".to_string();
        assert_eq!(config.output_device().as_deref(), Some("USB Speakers"));
    }
}
