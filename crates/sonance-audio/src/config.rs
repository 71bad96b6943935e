//! Engine tuning, loadable from TOML
//!
//! Every field has a default, so an empty document (or `AudioConfig::default()`)
//! gives the stock engine behaviour.

use crate::ducking::DuckingRule;
use serde::{Deserialize, Serialize};
use sonance_core::{Result, SonanceError};
use std::path::Path;

/// Defaults for distance attenuation on spatial sounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialDefaults {
    pub ref_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
}

impl Default for SpatialDefaults {
    fn default() -> Self {
        Self {
            ref_distance: 1.0,
            max_distance: 25.0,
            rolloff_factor: 1.0,
        }
    }
}

/// Audio device settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Open the default device. Off, or with no device present, the engine runs silent.
    pub enabled: bool,
    /// Kira sub-track budget. Each bus takes two and each playing sound one.
    pub max_tracks: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tracks: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Named layers allowed per entity
    pub max_layers_per_entity: usize,
    /// Concurrent one-shots before the oldest is evicted
    pub max_one_shots: usize,
    /// Ramp used for volume, mute and pitch changes
    pub param_ramp_ms: f32,
    /// Ramp used when the music intensity changes
    pub intensity_ramp_ms: f32,
    pub occlusion_clear_hz: f32,
    pub occlusion_muffled_hz: f32,
    pub occlusion_ramp_ms: f32,
    pub default_bpm: f32,
    /// Installed when the bus graph initializes
    pub default_ducking: Option<DuckingRule>,
    pub spatial: SpatialDefaults,
    pub output: OutputConfig,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            max_layers_per_entity: 8,
            max_one_shots: 32,
            param_ramp_ms: 16.0,
            intensity_ramp_ms: 500.0,
            occlusion_clear_hz: 5000.0,
            occlusion_muffled_hz: 500.0,
            occlusion_ramp_ms: 100.0,
            default_bpm: 120.0,
            default_ducking: Some(DuckingRule::default()),
            spatial: SpatialDefaults::default(),
            output: OutputConfig::default(),
        }
    }
}

impl AudioConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: AudioConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(SonanceError::ConfigError(
                "sample_rate must be greater than zero".into(),
            ));
        }
        if self.default_bpm.is_nan() || self.default_bpm <= 0.0 {
            return Err(SonanceError::ConfigError(format!(
                "default_bpm must be positive, got {}",
                self.default_bpm
            )));
        }
        if self.occlusion_clear_hz <= 0.0 || self.occlusion_muffled_hz <= 0.0 {
            return Err(SonanceError::ConfigError(
                "occlusion frequencies must be positive".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn param_ramp(&self) -> f64 {
        self.param_ramp_ms.max(0.0) as f64 / 1000.0
    }

    pub(crate) fn intensity_ramp(&self) -> f64 {
        self.intensity_ramp_ms.max(0.0) as f64 / 1000.0
    }

    pub(crate) fn occlusion_ramp(&self) -> f64 {
        self.occlusion_ramp_ms.max(0.0) as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.max_layers_per_entity, 8);
        assert_eq!(config.max_one_shots, 32);
        assert_eq!(config.occlusion_clear_hz, 5000.0);
        assert_eq!(config.occlusion_muffled_hz, 500.0);
        assert_eq!(config.default_ducking, Some(DuckingRule::new("voice", "music", 0.3)));
        assert!((config.intensity_ramp() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AudioConfig::from_toml_str(
            r#"
            max_one_shots = 4
            default_bpm = 96.0

            [spatial]
            max_distance = 60.0

            [default_ducking]
            triggerBus = "voice"
            targetBus = "ambient"
            duckLevel = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.max_one_shots, 4);
        assert_eq!(config.max_layers_per_entity, 8);
        assert_eq!(config.default_bpm, 96.0);
        assert_eq!(config.spatial.max_distance, 60.0);
        assert_eq!(config.spatial.ref_distance, 1.0);
        assert!(config.output.enabled);
        let rule = config.default_ducking.unwrap();
        assert_eq!(rule.target_bus, "ambient");
        assert_eq!(rule.attack_ms, 100.0);
    }

    #[test]
    fn test_output_can_be_disabled() {
        let config = AudioConfig::from_toml_str(
            r#"
            [output]
            enabled = false
            "#,
        )
        .unwrap();
        assert!(!config.output.enabled);
        assert_eq!(config.output.max_tracks, 512);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            AudioConfig::from_toml_str("sample_rate = 0"),
            Err(SonanceError::ConfigError(_))
        ));
        assert!(matches!(
            AudioConfig::from_toml_str("default_bpm = -10.0"),
            Err(SonanceError::ConfigError(_))
        ));
        assert!(matches!(
            AudioConfig::from_toml_str("max_one_shots = \"lots\""),
            Err(SonanceError::TomlParseError(_))
        ));
    }
}
