//! # Transform dispatch
//!
//! Entry point called by a loader for every unit it is about to define.
//! Units with no configured metrics, and interfaces, come back as the
//! borrowed input. Everything else is decoded, rewritten, re-verified by
//! finalization and re-encoded; the loader gets either the complete
//! rewritten bytes or an error, never something in between.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, warn};
use weaver_spi::MetricRegister;
use weaver_unit::{decode_unit, disasm::disassemble, encode_unit, read_header, UnitFile};

use crate::ancestor::{AncestorResolver, DescriptorCache, ResourceSource};
use crate::class_rewriter::ClassRewriter;
use crate::config::ConfigIndex;
use crate::errors::TransformError;

/// A hook a loader runs on unit bytes before defining them.
pub trait UnitTransformer: Send + Sync {
    fn transform<'b>(
        &self,
        unit_name: &str,
        bytes: &'b [u8],
        source: &dyn ResourceSource,
    ) -> Result<Cow<'b, [u8]>, TransformError>;
}

pub struct TransformDispatcher {
    config: Arc<ConfigIndex>,
    register: Arc<dyn MetricRegister>,
    cache: DescriptorCache,
}

impl TransformDispatcher {
    pub fn new(config: Arc<ConfigIndex>, register: Arc<dyn MetricRegister>) -> Self {
        Self {
            config,
            register,
            cache: DescriptorCache::new(),
        }
    }

    pub fn config(&self) -> &ConfigIndex {
        &self.config
    }

    pub fn register(&self) -> &Arc<dyn MetricRegister> {
        &self.register
    }

    /// Header descriptors seen so far.
    pub fn descriptor_cache(&self) -> &DescriptorCache {
        &self.cache
    }

    fn rewrite(
        &self,
        unit_name: &str,
        bytes: &[u8],
        source: &dyn ResourceSource,
    ) -> Result<Option<Vec<u8>>, TransformError> {
        let decode_error = |e: anyhow::Error| TransformError::Decode {
            unit: unit_name.to_string(),
            message: format!("{:#}", e),
        };
        let header = read_header(bytes).map_err(decode_error)?;
        if header.is_interface() {
            debug!(unit = unit_name, "interface, passing through");
            return Ok(None);
        }
        let mut unit = decode_unit(bytes).map_err(decode_error)?;

        let resolver = AncestorResolver::new(source, &self.cache);
        resolver.seed(&unit.header);
        ClassRewriter::new(&self.config, self.register.as_ref(), &resolver).rewrite(&mut unit)?;

        let rewritten = encode_unit(&unit).map_err(|e| TransformError::Encode {
            unit: unit_name.to_string(),
            message: format!("{:#}", e),
        })?;
        if self.config.debug().enabled {
            dump(&self.config.debug().out_path, &unit, &rewritten);
        }
        Ok(Some(rewritten))
    }
}

impl UnitTransformer for TransformDispatcher {
    fn transform<'b>(
        &self,
        unit_name: &str,
        bytes: &'b [u8],
        source: &dyn ResourceSource,
    ) -> Result<Cow<'b, [u8]>, TransformError> {
        if !self.config.has_metric(unit_name) {
            return Ok(Cow::Borrowed(bytes));
        }
        debug!(unit = unit_name, "unit has configured metrics");
        match self.rewrite(unit_name, bytes, source) {
            Ok(Some(rewritten)) => Ok(Cow::Owned(rewritten)),
            Ok(None) => Ok(Cow::Borrowed(bytes)),
            Err(e) => {
                error!(unit = unit_name, error = %e, "refusing to load unit with broken instrumentation");
                Err(e)
            }
        }
    }
}

/// Path of the debug copy of `unit_name` with extension `ext`.
pub fn dump_path(out_dir: &Path, unit_name: &str, ext: &str) -> PathBuf {
    out_dir.join(format!("{}.{}", unit_name, ext))
}

/// Write the rewritten bytes and a disassembly next to each other. Failures
/// are logged only.
fn dump(out_dir: &Path, unit: &UnitFile, bytes: &[u8]) {
    let binary = dump_path(out_dir, unit.name(), "unit");
    let listing = dump_path(out_dir, unit.name(), "txt");
    let result = binary
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|_| std::fs::write(&binary, bytes))
        .and_then(|_| std::fs::write(&listing, disassemble(unit)));
    match result {
        Ok(()) => debug!(path = %binary.display(), "wrote debug copy"),
        Err(e) => warn!(path = %binary.display(), error = %e, "failed to write debug copy"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ancestor::NoResources;
    use weaver_spi::InMemoryRegister;
    use weaver_unit::analysis::RootHierarchy;
    use weaver_unit::builder::{CodeBuilder, UnitBuilder};
    use weaver_unit::{access, Insn};

    const CONFIG: &str = r#"
metrics:
  "app/Foo.bar()V":
    - type: Counter
      name: calls_total
"#;

    fn foo_bytes() -> Vec<u8> {
        let mut code = CodeBuilder::new();
        code.emit(Insn::Return(None));
        UnitBuilder::new("app/Foo")
            .method(access::PUBLIC, "bar", "()V", code)
            .to_bytes(&RootHierarchy)
            .unwrap()
    }

    fn dispatcher(yaml: &str) -> TransformDispatcher {
        TransformDispatcher::new(
            Arc::new(ConfigIndex::from_yaml_str(yaml).unwrap()),
            Arc::new(InMemoryRegister::new()),
        )
    }

    #[test]
    fn test_unconfigured_unit_borrowed() {
        let d = dispatcher(CONFIG);
        let bytes = foo_bytes();
        let out = d.transform("app/Other", &bytes, &NoResources).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(out.as_ref(), bytes.as_slice());
    }

    #[test]
    fn test_configured_unit_rewritten() {
        let d = dispatcher(CONFIG);
        let bytes = foo_bytes();
        let out = d.transform("app/Foo", &bytes, &NoResources).unwrap();
        assert!(matches!(out, Cow::Owned(_)));
        let unit = decode_unit(&out).unwrap();
        assert!(unit.has_static_init());
        weaver_unit::verify_unit(&unit, &RootHierarchy).unwrap();
    }

    #[test]
    fn test_interface_passes_through() {
        let d = dispatcher("metrics:\n  \"app/Named.name()V\":\n    - type: Counter\n      name: n\n");
        let bytes = UnitBuilder::interface("app/Named")
            .declare(access::PUBLIC | access::ABSTRACT, "name", "()V")
            .to_bytes(&RootHierarchy)
            .unwrap();
        let out = d.transform("app/Named", &bytes, &NoResources).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let d = dispatcher(CONFIG);
        let err = d.transform("app/Foo", b"nope", &NoResources).unwrap_err();
        assert!(matches!(err, TransformError::Decode { .. }));
    }

    #[test]
    fn test_dump_path_nests_by_unit_name() {
        assert_eq!(
            dump_path(Path::new("/tmp/out"), "app/Foo", "unit"),
            PathBuf::from("/tmp/out/app/Foo.unit")
        );
    }
}
