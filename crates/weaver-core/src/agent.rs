//! Agent bootstrap: arguments, configuration, backend, dispatcher.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use weaver_spi::{MetricRegisterFactory, MetricsProvider};

use crate::config::{AgentArgs, ConfigIndex};
use crate::dispatcher::TransformDispatcher;

/// Build a dispatcher from the bootstrap argument string.
///
/// Without a `config:` argument the agent runs with an empty configuration
/// and instruments nothing. The backend is installed as the process register;
/// if one is already installed that one is reused.
pub fn bootstrap(args: &str, factory: &dyn MetricRegisterFactory) -> Result<TransformDispatcher> {
    let args = AgentArgs::parse(args)?;
    let config = match &args.config_path {
        Some(path) => ConfigIndex::from_file(path)
            .with_context(|| format!("loading agent config {}", path.display()))?,
        None => {
            warn!("no config argument given, nothing will be instrumented");
            ConfigIndex::default()
        }
    };

    let register = match MetricsProvider::install(factory, config.backend()) {
        Ok(register) => register,
        Err(e) => {
            warn!(error = %e, "keeping the already installed metrics backend");
            MetricsProvider::get_or_default()
        }
    };

    info!(
        methods = config.keys().count(),
        backend = factory.name(),
        "agent ready"
    );
    Ok(TransformDispatcher::new(Arc::new(config), register))
}
