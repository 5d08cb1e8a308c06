use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::errors::ConfigError;

/// Bootstrap argument string: comma-separated `key:value` pairs.
///
/// `config:<path>` names the configuration file. Other keys are kept for
/// whoever embeds the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentArgs {
    pub config_path: Option<PathBuf>,
    pub extra: BTreeMap<String, String>,
}

impl AgentArgs {
    pub fn parse(args: &str) -> Result<Self, ConfigError> {
        let mut parsed = AgentArgs::default();
        for part in args.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once(':').ok_or_else(|| ConfigError::BadArgument {
                argument: part.to_string(),
            })?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() {
                return Err(ConfigError::BadArgument {
                    argument: part.to_string(),
                });
            }
            if key == "config" {
                parsed.config_path = Some(PathBuf::from(value));
            } else {
                parsed.extra.insert(key.to_string(), value.to_string());
            }
        }
        Ok(parsed)
    }
}
