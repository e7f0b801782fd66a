//! Pipeline configuration management
//!
//! The whole session configuration lives in one serde structure that is
//! loaded from and saved to JSON.

use crate::core::{FilterSet, SentenceType};
use crate::hardware::ReceiverConfig;
use crate::network::{BackoffPolicy, CorrectionConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Default relay queue depth in chunks
pub const DEFAULT_RELAY_CAPACITY: usize = 64;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Invalid parameter value
    #[error("invalid {parameter} = '{value}': {reason}")]
    InvalidParameter {
        parameter: String,
        value: String,
        reason: String,
    },
    /// Configuration file I/O error
    #[error("{message}")]
    IoError { message: String },
    /// JSON serialization/deserialization error
    #[error("{message}")]
    SerializationError { message: String },
}

impl ConfigError {
    fn invalid(parameter: &str, value: impl ToString, reason: impl Into<String>) -> Self {
        ConfigError::InvalidParameter {
            parameter: parameter.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub receiver: ReceiverConfig,
    /// Correction service; the pipeline runs receiver-only without it
    pub correction: Option<CorrectionConfig>,
    pub backoff: BackoffPolicy,
    /// Correction chunks buffered for the receiver before new ones are dropped
    pub relay_capacity: usize,
    /// Three-letter sentence tags, e.g. `["GGA", "RMC"]`
    pub enabled_sentences: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            receiver: ReceiverConfig::default(),
            correction: None,
            backoff: BackoffPolicy::default(),
            relay_capacity: DEFAULT_RELAY_CAPACITY,
            enabled_sentences: SentenceType::ALL.iter().map(|t| t.tag().to_string()).collect(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a JSON configuration file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
            message: format!("Failed to read config file '{}': {}", path_str, e),
        })?;

        let config: PipelineConfig = serde_json::from_str(&content).map_err(|e| ConfigError::SerializationError {
            message: format!("Failed to parse config file '{}': {}", path_str, e),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let content = serde_json::to_string_pretty(self).map_err(|e| ConfigError::SerializationError {
            message: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(&path, content).map_err(|e| ConfigError::IoError {
            message: format!("Failed to write config file '{}': {}", path_str, e),
        })
    }

    /// Enabled sentence set parsed from the tag list
    pub fn filter_set(&self) -> Result<FilterSet, ConfigError> {
        FilterSet::from_tags(&self.enabled_sentences)
            .map_err(|reason| ConfigError::invalid("enabled_sentences", self.enabled_sentences.join(","), reason))
    }

    /// Check every section; the first problem found is returned
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.receiver
            .validate()
            .map_err(|e| ConfigError::invalid("receiver", &self.receiver.port, e.to_string()))?;

        if let Some(correction) = &self.correction {
            correction
                .validate()
                .map_err(|e| ConfigError::invalid("correction", &correction.host, e.to_string()))?;
        }

        self.backoff
            .validate()
            .map_err(|e| ConfigError::invalid("backoff", self.backoff.initial_ms, e.to_string()))?;

        if self.relay_capacity == 0 || self.relay_capacity > 4096 {
            return Err(ConfigError::invalid(
                "relay_capacity",
                self.relay_capacity,
                "must be between 1 and 4096 chunks",
            ));
        }

        self.filter_set().map(|_| ())
    }
}
