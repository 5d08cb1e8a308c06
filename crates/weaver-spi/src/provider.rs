//! Backend construction and the process-wide register.
//!
//! The register is created at most once per process. Whoever initializes the
//! agent installs a backend built by a [`MetricRegisterFactory`]; if nothing
//! has been installed by the time the first rewritten method reports, an
//! [`InMemoryRegister`] is used.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use tracing::{debug, info};

use crate::memory::InMemoryRegister;
use crate::register::MetricRegister;

/// Free-form settings passed to a backend factory, taken verbatim from the
/// `backend` section of the configuration.
pub type BackendSettings = BTreeMap<String, serde_json::Value>;

/// Builds a backend from its settings.
pub trait MetricRegisterFactory: Send + Sync {
    /// Short identifier, used in logs.
    fn name(&self) -> &str;

    fn new_instance(&self, settings: &BackendSettings) -> Result<Arc<dyn MetricRegister>>;
}

static REGISTER: OnceLock<Arc<dyn MetricRegister>> = OnceLock::new();

/// Accessor for the process-wide [`MetricRegister`].
pub struct MetricsProvider;

impl MetricsProvider {
    /// Install a backend built by `factory`.
    ///
    /// Fails if a backend is already in place; the first installation wins.
    pub fn install(
        factory: &dyn MetricRegisterFactory,
        settings: &BackendSettings,
    ) -> Result<Arc<dyn MetricRegister>> {
        let register = factory.new_instance(settings)?;
        Self::install_register(register)?;
        info!(backend = factory.name(), "metrics backend installed");
        Self::get().ok_or_else(|| anyhow!("metrics backend vanished after install"))
    }

    /// Install an already-built backend.
    pub fn install_register(register: Arc<dyn MetricRegister>) -> Result<()> {
        REGISTER
            .set(register)
            .map_err(|_| anyhow!("a metrics backend is already installed"))
    }

    pub fn get() -> Option<Arc<dyn MetricRegister>> {
        REGISTER.get().cloned()
    }

    /// The installed backend, falling back to an in-memory one.
    pub fn get_or_default() -> Arc<dyn MetricRegister> {
        REGISTER
            .get_or_init(|| {
                debug!("no metrics backend installed, using in-memory register");
                Arc::new(InMemoryRegister::new())
            })
            .clone()
    }
}
