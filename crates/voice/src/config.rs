//! Configuration types for the voice mesh engine

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration for a voice client
///
/// # Example
///
/// ```
/// use meshcall_voice::VoiceMeshConfig;
///
/// let config = VoiceMeshConfig::from_toml_str(r#"
///     channel_capacity = 4
///
///     [speaking]
///     sample_interval_ms = 100
/// "#).unwrap();
///
/// assert_eq!(config.channel_capacity, 4);
/// assert_eq!(config.ice.ice_candidate_pool_size, 10);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceMeshConfig {
    /// STUN/TURN settings handed to every peer connection
    pub ice: IceConfig,

    /// Joins are refused when this many users are already present (default: 6)
    pub channel_capacity: usize,

    /// Extra attempts for the roster write on join (default: 1)
    pub roster_write_retries: u32,

    /// Speaking-activity sampling
    pub speaking: SpeakingConfig,

    /// Depth of the engine command queue (default: 32)
    pub command_buffer: usize,
}

/// ICE server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Candidates gathered ahead of negotiation (default: 10)
    pub ice_candidate_pool_size: u8,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Speaking-activity monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakingConfig {
    /// Sampling period in milliseconds (default: 200)
    pub sample_interval_ms: u64,

    /// RMS of the local capture frame above which self is speaking (default: 0.02)
    pub outgoing_rms_threshold: f64,

    /// Linear inbound audio level above which a peer is speaking (default: 0.0007)
    pub incoming_level_threshold: f64,
}

impl Default for VoiceMeshConfig {
    fn default() -> Self {
        Self {
            ice: IceConfig::default(),
            channel_capacity: 6,
            roster_write_retries: 1,
            speaking: SpeakingConfig::default(),
            command_buffer: 32,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
            ice_candidate_pool_size: 10,
        }
    }
}

impl Default for SpeakingConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 200,
            outgoing_rms_threshold: 0.02,
            incoming_level_threshold: 0.0007,
        }
    }
}

impl VoiceMeshConfig {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))
    }

    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&source)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        self.ice.validate()?;

        if self.channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "channel_capacity must be at least 1".to_string(),
            ));
        }

        if self.command_buffer == 0 {
            return Err(Error::InvalidConfig(
                "command_buffer must be at least 1".to_string(),
            ));
        }

        self.speaking.validate()
    }
}

impl IceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        Ok(())
    }
}

impl SpeakingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "speaking.sample_interval_ms must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("outgoing_rms_threshold", self.outgoing_rms_threshold),
            ("incoming_level_threshold", self.incoming_level_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidConfig(format!(
                    "speaking.{} must be in range 0.0-1.0, got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = VoiceMeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ice.stun_servers.len(), 2);
        assert_eq!(config.ice.ice_candidate_pool_size, 10);
        assert_eq!(config.speaking.sample_interval_ms, 200);
    }

    #[test]
    fn test_empty_stun_servers_fails() {
        let mut config = VoiceMeshConfig::default();
        config.ice.stun_servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_urls_fail() {
        let mut config = VoiceMeshConfig::default();
        config.ice.stun_servers = vec!["http://stun.example.com".to_string()];
        assert!(config.validate().is_err());

        let mut config = VoiceMeshConfig::default();
        config.ice.turn_servers.push(TurnServerConfig {
            url: "stun:turn.example.com:3478".to_string(),
            username: "user".to_string(),
            credential: "pass".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_capacity_and_speaking_fail() {
        let mut config = VoiceMeshConfig::default();
        config.channel_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = VoiceMeshConfig::default();
        config.speaking.sample_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = VoiceMeshConfig::default();
        config.speaking.incoming_level_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = VoiceMeshConfig::from_toml_str(
            r#"
            roster_write_retries = 3

            [ice]
            stun_servers = ["stun:stun.example.com:3478"]

            [[ice.turn_servers]]
            url = "turn:turn.example.com:3478"
            username = "user"
            credential = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.roster_write_retries, 3);
        assert_eq!(config.channel_capacity, 6);
        assert_eq!(config.ice.turn_servers.len(), 1);
        assert_eq!(config.ice.ice_candidate_pool_size, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = VoiceMeshConfig::from_toml_str("channel_capacity = \"six\"").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "channel_capacity = 2").unwrap();

        let config = VoiceMeshConfig::load(file.path()).unwrap();
        assert_eq!(config.channel_capacity, 2);

        assert!(matches!(
            VoiceMeshConfig::load("/nonexistent/meshcall.toml"),
            Err(Error::Io(_))
        ));
    }
}
