//! Konfiguration
//!
//! Eine `CallConfig` ersetzt die fest verdrahteten ICE-Server und Audio-Einstellungen.
//! Reihenfolge beim Laden:
//! 1. expliziter Pfad (`--config`)
//! 2. `config.toml` im Konfigurationsverzeichnis der Plattform
//! 3. eingebaute Defaults
//!
//! Danach werden Umgebungsvariablen angewendet.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Überschreibt die ICE-Server (kommagetrennte URLs)
pub const ICE_SERVERS_ENV: &str = "PASTECALL_ICE_SERVERS";

/// Sample Rate (48kHz ist der Standard für Opus)
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Höchste Sample Rate, die cpal-Geräte in der Praxis anbieten
pub const MAX_SAMPLE_RATE: u32 = 384_000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid ICE server URL: {0}")]
    InvalidIceUrl(String),

    #[error("Invalid audio configuration: {0}")]
    InvalidAudio(String),
}

// ============================================================================
// CONFIG STRUCTS
// ============================================================================

/// Ein STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServerConfig {
    /// STUN-Server ohne Credentials
    pub fn stun<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            username: String::new(),
            credential: String::new(),
        }
    }

    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone(),
            credential: self.credential.clone(),
            ..Default::default()
        }
    }
}

/// Audio-Constraints für die lokale Aufnahme
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    /// Name des Eingabegeräts, `None` = Standardgerät
    pub input_device: Option<String>,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 1,
            input_device: None,
        }
    }
}

/// Konfiguration eines Call-Koordinators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub audio: AudioConstraints,
    /// Obergrenze für das Sammeln der ICE Candidates vor dem Export der SDP
    pub ice_gather_timeout_ms: u64,
    /// Pause zwischen zwei Diagnose-Checks
    pub diagnostics_pacing_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            audio: AudioConstraints::default(),
            ice_gather_timeout_ms: 5000,
            diagnostics_pacing_ms: 500,
        }
    }
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::stun([
        "stun:stun.l.google.com:19302",
        "stun:stun1.l.google.com:19302",
        "stun:stun2.l.google.com:19302",
    ])]
}

impl CallConfig {
    /// Lädt die Konfiguration und wendet Umgebungsvariablen an
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        tracing::info!("Loading config from {:?}", path);
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Pfad zur Konfigurationsdatei
    /// - Linux: `~/.config/pastecall/config.toml`
    /// - macOS: `~/Library/Application Support/com.pastecall.pastecall/config.toml`
    /// - Windows: `%APPDATA%/pastecall/pastecall/config/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "pastecall", "pastecall")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Wendet Overrides an; `lookup` ist austauschbar für Tests
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ICE_SERVERS_ENV) {
            let servers: Vec<IceServerConfig> = raw
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(|url| IceServerConfig::stun([url]))
                .collect();

            if !servers.is_empty() {
                tracing::debug!("{} overrides {} ICE server(s)", ICE_SERVERS_ENV, servers.len());
                self.ice_servers = servers;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        const SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

        for url in self.ice_servers.iter().flat_map(|s| s.urls.iter()) {
            if !SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                return Err(ConfigError::InvalidIceUrl(url.clone()));
            }
        }

        if self.audio.sample_rate == 0 || self.audio.sample_rate > MAX_SAMPLE_RATE {
            return Err(ConfigError::InvalidAudio(format!(
                "sample_rate must be between 1 and {MAX_SAMPLE_RATE}, got {}",
                self.audio.sample_rate
            )));
        }
        if self.audio.channels == 0 {
            return Err(ConfigError::InvalidAudio("channels must be > 0".into()));
        }

        Ok(())
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.iter().map(IceServerConfig::to_rtc).collect()
    }

    pub fn ice_gather_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gather_timeout_ms)
    }

    pub fn diagnostics_pacing(&self) -> Duration {
        Duration::from_millis(self.diagnostics_pacing_ms)
    }
}
