use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::types::{
    BiasSelect, Channel, ClockSource, DriverError, ExcitationCurrent, ExcitationDirection, Gain,
    Polarity, Rate, ReferenceSelect,
};

fn default_external_reference_mv() -> f32 { 2500.0 }
fn default_buffered() -> bool { true }

/// Configuration for the AD7793
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdcConfig {
    /// Voltage on REFIN in millivolts, used while the external reference is selected
    #[serde(default = "default_external_reference_mv")]
    pub external_reference_mv: f32,
    pub reference: ReferenceSelect,
    pub clock: ClockSource,
    pub rate: Rate,
    pub channel: Channel,
    pub gain: Gain,
    pub polarity: Polarity,
    pub bias: BiasSelect,
    pub excitation_current: ExcitationCurrent,
    pub excitation_direction: ExcitationDirection,
    #[serde(default = "default_buffered")]
    pub buffered: bool,
    pub burnout_current: bool,
    pub boost: bool,
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            external_reference_mv: default_external_reference_mv(),
            reference: ReferenceSelect::External,
            clock: ClockSource::Internal,
            rate: Rate::Hz16_7,
            channel: Channel::Ain1,
            gain: Gain::X1,
            polarity: Polarity::Bipolar,
            bias: BiasSelect::Disabled,
            excitation_current: ExcitationCurrent::Disabled,
            excitation_direction: ExcitationDirection::Direct,
            buffered: default_buffered(),
            burnout_current: false,
            boost: false,
        }
    }
}

/// Load an ADC configuration from a JSON file. Missing keys take their defaults.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AdcConfig, DriverError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|e| {
        DriverError::ConfigurationError(format!("Could not read '{}': {}", path.display(), e))
    })?;

    let config: AdcConfig = serde_json::from_str(&contents).map_err(|e| {
        DriverError::ConfigurationError(format!("Could not parse '{}': {}", path.display(), e))
    })?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}
