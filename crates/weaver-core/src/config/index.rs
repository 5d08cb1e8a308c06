use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use tracing::{debug, info};
use weaver_spi::BackendSettings;
use weaver_unit::MethodDescriptor;

use crate::config::document::{ConfigDocument, DebugSettings};
use crate::config::key::MethodKey;
use crate::config::metric::Metric;
use crate::errors::ConfigError;

/// Immutable lookup structure over the configured metrics.
///
/// Built once; every query takes `&self`, so one index can be shared by all
/// load threads without locking.
#[derive(Debug, Clone, Default)]
pub struct ConfigIndex {
    /// Short name to fully-qualified name.
    imports: BTreeMap<String, String>,
    metrics: BTreeMap<MethodKey, Vec<Metric>>,
    /// Lowercased unit names with at least one configured method.
    units: HashSet<String>,
    debug: DebugSettings,
    backend: BackendSettings,
}

impl ConfigIndex {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Self::from_document(ConfigDocument::from_yaml_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let index = Self::from_document(ConfigDocument::from_file(path)?)?;
        info!(
            path = %path.display(),
            methods = index.metrics.len(),
            units = index.units.len(),
            "loaded metrics configuration"
        );
        Ok(index)
    }

    /// Validate `doc` and rewrite its keys through the import table.
    pub fn from_document(doc: ConfigDocument) -> Result<Self, ConfigError> {
        let imports = import_table(&doc.imports)?;

        let mut metrics = BTreeMap::new();
        for (raw_key, entries) in &doc.metrics {
            let parsed = MethodKey::parse(raw_key)?;
            let key = apply_imports(&imports, parsed);
            if &key.to_string() != raw_key {
                debug!(raw = %raw_key, key = %key, "rewrote method key");
            }
            let declared = entries
                .iter()
                .map(Metric::from_entry)
                .collect::<Result<Vec<_>, _>>()?;
            if metrics.insert(key.clone(), declared).is_some() {
                return Err(ConfigError::DuplicateKey {
                    key: key.to_string(),
                });
            }
        }

        let units = metrics.keys().map(|k| k.unit.to_lowercase()).collect();
        Ok(Self {
            imports,
            metrics,
            units,
            debug: doc.debug,
            backend: doc.backend,
        })
    }

    /// Whether any method of `unit` is configured. Case-insensitive, exact.
    pub fn has_metric(&self, unit: &str) -> bool {
        self.units.contains(&unit.to_lowercase())
    }

    /// Metrics of every configured method of `unit`, in key order.
    pub fn find_by_unit_name(&self, unit: &str) -> Vec<&Metric> {
        let needle = unit.to_lowercase();
        self.metrics
            .iter()
            .filter(|(key, _)| key.unit.to_lowercase() == needle)
            .flat_map(|(_, metrics)| metrics.iter())
            .collect()
    }

    /// Metrics declared on exactly this method; empty when none are.
    pub fn find_by_key(&self, unit: &str, method: &str, signature: &str) -> &[Metric] {
        self.metrics
            .get(&MethodKey::new(unit, method, signature))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Configured method keys of `unit`.
    pub fn keys_for_unit<'a>(&'a self, unit: &'a str) -> impl Iterator<Item = &'a MethodKey> + 'a {
        self.metrics.keys().filter(move |k| k.unit == unit)
    }

    pub fn keys(&self) -> impl Iterator<Item = &MethodKey> {
        self.metrics.keys()
    }

    pub fn imports(&self) -> &BTreeMap<String, String> {
        &self.imports
    }

    pub fn debug(&self) -> &DebugSettings {
        &self.debug
    }

    pub fn backend(&self) -> &BackendSettings {
        &self.backend
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

fn import_table(imports: &[String]) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut table: BTreeMap<String, String> = BTreeMap::new();
    for import in imports {
        let qualified = import.trim().replace('.', "/");
        let short = qualified
            .rsplit('/')
            .next()
            .unwrap_or(qualified.as_str())
            .to_string();
        match table.get(&short) {
            Some(existing) if existing != &qualified => {
                return Err(ConfigError::AmbiguousImport {
                    short_name: short,
                    first: existing.clone(),
                    second: qualified,
                });
            }
            Some(_) => {}
            None => {
                table.insert(short, qualified);
            }
        }
    }
    Ok(table)
}

/// Qualify the unit name and every unqualified type in the signature.
fn apply_imports(imports: &BTreeMap<String, String>, key: MethodKey) -> MethodKey {
    if imports.is_empty() {
        return key;
    }
    let resolve = |name: &str| -> Option<String> {
        if name.contains('/') {
            None
        } else {
            imports.get(name).cloned()
        }
    };
    let unit = resolve(&key.unit).unwrap_or(key.unit);
    // The key already parsed, so the signature is well formed.
    let signature = match MethodDescriptor::parse(&key.signature) {
        Ok(desc) => desc.map_names(&resolve).to_string(),
        Err(_) => key.signature,
    };
    MethodKey::new(unit, key.method, signature)
}
