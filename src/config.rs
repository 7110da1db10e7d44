//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with `APP__` prefix, `__` between sections)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platform conventions)
//! 2. Environment variables (APP__SERVER__PORT, APP__SPEECH__SECRET_KEY, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The loaded configuration is read-only for the lifetime of the process. Sessions receive
//! a clone of the sections they need at connection time.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub speech: SpeechConfig,
    pub session: SessionConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host`: IP address or hostname to bind the server to (e.g., "127.0.0.1", "0.0.0.0")
/// - `port`: TCP port number to listen on
/// - `allowed_origins`: Origins accepted for browser clients. Empty means any origin,
///   which matches how browser-based practice clients are usually deployed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Credentials and connection settings for the remote assessment engine.
///
/// ## Fields:
/// - `app_id`, `secret_id`, `secret_key`: Tencent Cloud account credentials
/// - `host`: Engine host (no scheme), normally `soe.cloud.tencent.com`
/// - `voice_format`: Engine audio format code (0 = pcm, 1 = wav, 2 = mp3)
/// - `slice_size`: Maximum bytes per engine write, 0 disables slicing
/// - `connect_timeout_secs`: Upper bound for connecting and the engine handshake
/// - `write_timeout_secs`: Upper bound for each audio or end-of-input write to the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub app_id: String,
    pub secret_id: String,
    pub secret_key: String,
    pub host: String,
    pub voice_format: u8,
    pub slice_size: usize,
    pub connect_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

/// Per-session timing and I/O settings.
///
/// ## Tuning guidelines:
/// - `write_timeout_secs` bounds every outbound frame so a stalled client cannot hold teardown
/// - `drain_timeout_secs` bounds the wait for the engine's final result after end-of-stream
/// - `inbound_queue_frames` is how many client frames may be queued ahead of the reader
/// - `audio_dir` is where sessions that ask for it store their audio as WAV
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub write_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub inbound_queue_frames: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub audio_dir: PathBuf,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                allowed_origins: Vec::new(),
            },
            speech: SpeechConfig {
                app_id: String::new(),
                secret_id: String::new(),
                secret_key: String::new(),
                host: "soe.cloud.tencent.com".to_string(),
                voice_format: 1,
                slice_size: 0,
                connect_timeout_secs: 10,
                write_timeout_secs: 10,
            },
            session: SessionConfig {
                write_timeout_secs: 10,
                drain_timeout_secs: 30,
                inbound_queue_frames: 1024,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                audio_dir: PathBuf::from("recordings"),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 64,
            },
        }
    }
}

impl SessionConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl SpeechConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// True when all three credential values are present.
    pub fn has_credentials(&self) -> bool {
        !self.app_id.is_empty() && !self.secret_id.is_empty() && !self.secret_key.is_empty()
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with `APP__`
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP__SPEECH__SECRET_KEY=...`: Engine secret key
    /// - `APP__SESSION__WRITE_TIMEOUT_SECS=5`: Outbound write deadline
    ///
    /// A double underscore separates sections so that field names such as `secret_key`
    /// keep their single underscores.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.allowed_origins")
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
    ///
    /// Missing engine credentials are not an error here: the server still starts (health
    /// checks keep working) and each session reports the engine start failure to its client.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.session.write_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Session write timeout must be greater than 0"));
        }

        if self.session.drain_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Session drain timeout must be greater than 0"));
        }

        if self.session.inbound_queue_frames == 0 {
            return Err(anyhow::anyhow!("Inbound queue size must be greater than 0"));
        }

        if self.session.heartbeat_interval_secs == 0
            || self.session.client_timeout_secs <= self.session.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be greater than the heartbeat interval (and both non-zero)"
            ));
        }

        if self.speech.connect_timeout_secs == 0 || self.speech.write_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Engine timeouts must be greater than 0"));
        }

        if self.speech.host.is_empty() {
            return Err(anyhow::anyhow!("Speech engine host cannot be empty"));
        }

        Ok(())
    }

    /// A copy of the configuration that is safe to show over the API.
    pub fn redacted(&self) -> AppConfig {
        let mut copy = self.clone();
        if !copy.speech.secret_id.is_empty() {
            copy.speech.secret_id = "***".to_string();
        }
        if !copy.speech.secret_key.is_empty() {
            copy.speech.secret_key = "***".to_string();
        }
        copy
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
        assert_eq!(config.session.write_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
        assert!(!config.speech.has_credentials());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.client_timeout_secs = config.session.heartbeat_interval_secs;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.drain_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.speech.write_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let mut config = AppConfig::default();
        config.speech.app_id = "1300000000".to_string();
        config.speech.secret_id = "AKIDexample".to_string();
        config.speech.secret_key = "very-secret".to_string();

        let shown = config.redacted();
        assert_eq!(shown.speech.app_id, "1300000000");
        assert_eq!(shown.speech.secret_id, "***");
        assert_eq!(shown.speech.secret_key, "***");
        assert!(config.speech.has_credentials());
    }
}
