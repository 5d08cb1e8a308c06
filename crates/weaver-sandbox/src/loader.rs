//! Unit loader with a transformer hook.
//!
//! Raw bytes are registered by name; a unit is *defined* the first time the
//! VM asks for it, at which point every registered [`UnitTransformer`] runs
//! over the bytes before they are decoded. The loader also serves as the
//! [`ResourceSource`] transformers read headers from, always handing out the
//! raw bytes.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{debug, trace};
use weaver_core::{ResourceSource, UnitTransformer};
use weaver_unit::{decode_unit, read_header, UnitFile};

use crate::core_units::core_units;
use crate::errors::VmError;

pub struct UnitLoader {
    raw: RwLock<HashMap<String, Arc<Vec<u8>>>>,
    defined: RwLock<HashMap<String, Arc<UnitFile>>>,
    transformers: RwLock<Vec<Arc<dyn UnitTransformer>>>,
}

impl UnitLoader {
    /// A loader holding only the built-in units.
    pub fn new() -> Result<Self> {
        let loader = Self::empty();
        for (name, bytes) in core_units()? {
            loader.add_unit(&name, bytes);
        }
        Ok(loader)
    }

    /// A loader with no units at all, not even the built-in ones.
    pub fn empty() -> Self {
        Self {
            raw: RwLock::new(HashMap::new()),
            defined: RwLock::new(HashMap::new()),
            transformers: RwLock::new(Vec::new()),
        }
    }

    /// Register bytes under the name their header declares.
    pub fn add_bytes(&self, bytes: Vec<u8>) -> Result<String> {
        let header = read_header(&bytes).context("reading unit header")?;
        self.add_unit(&header.name, bytes);
        Ok(header.name)
    }

    /// Register bytes under `name`. Replaces earlier bytes that were never
    /// defined; a unit that is already defined keeps its definition.
    pub fn add_unit(&self, name: &str, bytes: Vec<u8>) {
        trace!(unit = name, len = bytes.len(), "adding unit bytes");
        self.raw.write().insert(name.to_string(), Arc::new(bytes));
    }

    /// Run `transformer` on every unit defined from now on, after the
    /// transformers added before it.
    pub fn add_transformer(&self, transformer: Arc<dyn UnitTransformer>) {
        self.transformers.write().push(transformer);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.raw.read().contains_key(name)
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.defined.read().contains_key(name)
    }

    /// The defined unit `name`, defining it first if needed.
    pub fn load(&self, name: &str) -> Result<Arc<UnitFile>, VmError> {
        if let Some(unit) = self.defined.read().get(name) {
            return Ok(unit.clone());
        }
        let raw = self
            .raw
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| VmError::UnitNotFound {
                name: name.to_string(),
            })?;

        let bytes = self.run_transformers(name, &raw)?;
        let unit = decode_unit(&bytes).map_err(|e| VmError::Load {
            unit: name.to_string(),
            message: format!("{:#}", e),
        })?;
        if unit.header.name != name {
            return Err(VmError::Load {
                unit: name.to_string(),
                message: format!("bytes declare unit {}", unit.header.name),
            });
        }

        let mut defined = self.defined.write();
        let unit = defined
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(unit))
            .clone();
        debug!(unit = name, "defined unit");
        Ok(unit)
    }

    /// Bytes the unit was defined from, after transformation.
    pub fn defined_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let unit = self.load(name)?;
        weaver_unit::encode_unit(&unit)
    }

    fn run_transformers(&self, name: &str, raw: &[u8]) -> Result<Vec<u8>, VmError> {
        let transformers = self.transformers.read().clone();
        let mut bytes = raw.to_vec();
        for transformer in &transformers {
            let rewritten = match transformer.transform(name, &bytes, self)? {
                Cow::Owned(rewritten) => Some(rewritten),
                Cow::Borrowed(_) => None,
            };
            if let Some(rewritten) = rewritten {
                bytes = rewritten;
            }
        }
        Ok(bytes)
    }
}

impl ResourceSource for UnitLoader {
    fn unit_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.raw.read().get(name).map(|bytes| bytes.as_ref().clone())
    }
}

impl std::fmt::Debug for UnitLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitLoader")
            .field("units", &self.raw.read().len())
            .field("defined", &self.defined.read().len())
            .field("transformers", &self.transformers.read().len())
            .finish()
    }
}
