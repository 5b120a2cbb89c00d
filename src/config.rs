//! Ambient configuration for the [`crate::sdk::BeamLink`] facade.
use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::profile::BeamConfig;
use crate::range::RangingConfig;
use crate::session::DEFAULT_AUDIO_QUEUE_DEPTH;

const MAX_AUDIO_QUEUE_DEPTH: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub ranging: RangingConfig,
    pub beam: BeamConfig,
    /// Inbound ciphertext frames a session buffers before dropping the oldest.
    pub audio_queue_depth: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ranging: RangingConfig::default(),
            beam: BeamConfig::default(),
            audio_queue_depth: DEFAULT_AUDIO_QUEUE_DEPTH,
        }
    }
}

impl LinkConfig {
    /// Parses and validates a JSON document; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, LinkError> {
        let config: LinkConfig = serde_json::from_str(json)
            .map_err(|e| LinkError::InvalidArgument(format!("link config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, LinkError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| LinkError::InvalidArgument(format!("link config: {e}")))
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        self.ranging.validate()?;
        self.beam.clone().compile()?;
        crate::bounds::check_range(
            "audio_queue_depth",
            self.audio_queue_depth,
            1,
            MAX_AUDIO_QUEUE_DEPTH,
        )?;
        Ok(())
    }
}
