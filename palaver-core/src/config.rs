use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
        }
    }
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

/// Media engine settings handed to the worker pool and transport factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Engine backend ("mock" is the only in-tree implementation; a real
    /// engine plugs in behind the `MediaEngine` trait)
    pub engine: String,
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub listen_ip: String,
    /// Public address advertised in ICE candidates
    pub announced_ip: Option<String>,
    pub max_incoming_bitrate: u32,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            engine: "mock".to_string(),
            num_workers: 1,
            rtc_min_port: 10101,
            rtc_max_port: 10200,
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            max_incoming_bitrate: 1_500_000,
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }
}

/// A media codec the router is willing to negotiate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecCapability {
    pub kind: String,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
}

/// Default codec set: Opus audio and VP8 video.
#[must_use]
pub fn default_codecs() -> Vec<CodecCapability> {
    vec![
        CodecCapability {
            kind: "audio".to_string(),
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
        },
        CodecCapability {
            kind: "video".to_string(),
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
        },
    ]
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> std::result::Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (PALAVER_SERVER_HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("PALAVER")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> std::result::Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Validate settings that would otherwise fail late.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.media.num_workers == 0 {
            errors.push("media.num_workers must be at least 1".to_string());
        }
        if self.media.rtc_min_port > self.media.rtc_max_port {
            errors.push(format!(
                "media rtc port range is inverted: {}-{}",
                self.media.rtc_min_port, self.media.rtc_max_port
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
