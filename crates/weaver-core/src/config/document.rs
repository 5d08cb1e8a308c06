//! Raw shape of the YAML configuration document, before validation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use weaver_spi::BackendSettings;

use crate::config::metric::MetricKind;
use crate::errors::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigDocument {
    /// Fully-qualified names that keys may refer to by their short name.
    pub imports: Vec<String>,
    /// Raw method key to the metrics declared on it.
    pub metrics: BTreeMap<String, Vec<MetricEntry>>,
    pub debug: DebugSettings,
    pub backend: BackendSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEntry {
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub name: String,
    #[serde(default)]
    pub doc: String,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Gauge operation override.
    #[serde(default)]
    pub method: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugSettings {
    pub enabled: bool,
    /// Directory that receives a copy of every rewritten unit.
    pub out_path: PathBuf,
}

impl ConfigDocument {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        // An empty file is an empty configuration.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&text)
    }
}
