//! Tunables for a mission, loaded from a [ron] file. Every field has a
//! default, so a config file only needs to name what it changes:
//!
//! ```text
//! (
//!     fleet_size: 3,
//!     mapping: (cell_cm: 5.0),
//!     exploration: (seed: Some(7)),
//! )
//! ```

use crate::simulator::SimulatorConfig;
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, fs, path::Path, path::PathBuf};

/// Everything a mission can be tuned with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// How many robots may register. Fixed for the lifetime of the process.
    pub fleet_size: usize,
    /// Depth of each report queue. Zero means "same as the fleet size".
    pub queue_depth: usize,
    #[allow(missing_docs)]
    pub acoustics: AcousticConfig,
    #[allow(missing_docs)]
    pub localization: LocalizationConfig,
    #[allow(missing_docs)]
    pub mapping: MappingConfig,
    #[allow(missing_docs)]
    pub exploration: ExplorationConfig,
    /// When set, every listener capture is written here as a WAV file.
    pub capture_dir: Option<PathBuf>,
    /// The world `echofleet simulate` runs in.
    pub simulator: SimulatorConfig,
}

/// Timing and physics of the acoustic handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcousticConfig {
    /// Frequency of the tone the speaker plays. Must match the robot firmware.
    pub tone_hz: f64,
    /// How long the listener records.
    pub listen_ms: u32,
    /// How long the speaker plays.
    pub speak_ms: u32,
    /// Delay the robots wait before starting, so both commands land first.
    pub start_delay_ms: i64,
    /// Extra delay given to the speaker on top of `start_delay_ms`.
    pub speaker_lag_ms: i64,
    /// Meters per second.
    pub speed_of_sound: f64,
    /// Distance between the left and right microphones.
    pub mic_spacing_cm: f64,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    /// How far the leader drives between its two listening positions.
    pub leader_step_cm: u32,
    /// Pause after the leader stops, before the second capture.
    pub settle_ms: u64,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Side length of a grid cell.
    pub cell_cm: f64,
    /// Probability that a range reading's evidence about a cell is right.
    pub hit_probability: f64,
    /// |log-odds| at or above which a cell is impassable.
    pub occupied_threshold: f64,
    /// Longest range reading worth mapping. Anything further, or anything
    /// that is not a finite number, is discarded.
    pub max_range_cm: f64,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorationConfig {
    /// Number of random frontier candidates drawn per replan.
    pub frontier_samples: usize,
    /// Candidates are drawn from this many cells around the robot.
    pub frontier_radius: i64,
    /// Heartbeat period of the policy loop.
    pub tick_ms: u64,
    /// Seed for frontier sampling. `None` draws one from the OS.
    pub seed: Option<u64>,
    /// Turn used when no path could be planned, so the next reading looks
    /// somewhere new.
    pub scan_turn_deg: f64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            fleet_size: 2,
            queue_depth: 0,
            acoustics: AcousticConfig::default(),
            localization: LocalizationConfig::default(),
            mapping: MappingConfig::default(),
            exploration: ExplorationConfig::default(),
            capture_dir: None,
            simulator: SimulatorConfig::default(),
        }
    }
}

impl Default for AcousticConfig {
    fn default() -> Self {
        Self {
            tone_hz: 300.0,
            listen_ms: 500,
            speak_ms: 125,
            start_delay_ms: 500,
            speaker_lag_ms: 10,
            speed_of_sound: 343.0,
            mic_spacing_cm: 10.1,
        }
    }
}

impl Default for LocalizationConfig {
    fn default() -> Self {
        Self {
            leader_step_cm: 100,
            settle_ms: 1000,
        }
    }
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            cell_cm: 10.0,
            hit_probability: 0.7,
            occupied_threshold: 2.0,
            max_range_cm: 1000.0,
        }
    }
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            frontier_samples: 10,
            frontier_radius: 2,
            tick_ms: 1000,
            seed: None,
            scan_turn_deg: 45.0,
        }
    }
}

/// Returned when a config file cannot be read or parsed.
#[derive(Debug)]
pub enum ConfigError {
    /// Returned when the file cannot be read.
    IoError(std::io::Error),
    /// Returned when the file is not a valid [FleetConfig].
    RonSpannedError(ron::de::SpannedError),
    /// Returned when the values parse but make no sense together.
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ConfigError::IoError(error) => Cow::from(format!("io error: {}", error)),
            ConfigError::RonSpannedError(error) => Cow::from(format!("ron error: {}", error)),
            ConfigError::Invalid(why) => Cow::from(format!("invalid config: {}", why)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConfigError {}

impl FleetConfig {
    /// Read and validate a config from a RON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        Self::from_ron(&text)
    }

    /// Parse and validate a config from RON text.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = ron::from_str(text).map_err(ConfigError::RonSpannedError)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make the math downstream meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fleet_size < 2 {
            return Err(ConfigError::Invalid("a fleet needs at least two robots"));
        }
        if self.acoustics.listen_ms == 0 || self.acoustics.speak_ms > self.acoustics.listen_ms {
            return Err(ConfigError::Invalid(
                "the speak window must fit inside a non-empty listen window",
            ));
        }
        if self.mapping.cell_cm <= 0.0 {
            return Err(ConfigError::Invalid("cells must have a positive size"));
        }
        let range = self.mapping.max_range_cm;
        if !(range.is_finite() && range > 0.0) {
            return Err(ConfigError::Invalid("max range must be a positive distance"));
        }
        let p = self.mapping.hit_probability;
        if !(p > 0.5 && p < 1.0) {
            return Err(ConfigError::Invalid("hit probability must lie in (0.5, 1)"));
        }
        if self.exploration.frontier_samples == 0 || self.exploration.frontier_radius < 1 {
            return Err(ConfigError::Invalid(
                "frontier sampling needs at least one candidate within radius one",
            ));
        }
        Ok(())
    }

    /// The depth both report queues are created with.
    pub fn effective_queue_depth(&self) -> usize {
        if self.queue_depth == 0 {
            self.fleet_size
        } else {
            self.queue_depth
        }
    }
}
