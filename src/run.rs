//! Load a directory of units into the sandbox with instrumentation enabled
//! and execute one entry point.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use weaver_core::{MethodKey, TransformDispatcher};
use weaver_sandbox::{UnitLoader, Value, Vm, VmError};
use weaver_spi::MetricRegister;
use weaver_unit::MethodDescriptor;

use crate::transform::collect_unit_files;

/// A loader holding the built-in units plus every unit under `units_dir`,
/// with `dispatcher` applied on definition.
pub fn instrumented_loader(dispatcher: TransformDispatcher, units_dir: &Path) -> Result<Arc<UnitLoader>> {
    let loader = UnitLoader::new()?;
    for path in collect_unit_files(units_dir)? {
        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        loader
            .add_bytes(bytes)
            .with_context(|| format!("adding {}", path.display()))?;
    }
    loader.add_transformer(Arc::new(dispatcher));
    Ok(Arc::new(loader))
}

/// Invoke the static, argument-less method `entry`.
///
/// The outer error covers setup problems; the inner one is whatever the
/// program itself did, including uncaught exceptions.
pub fn run_entry(
    loader: Arc<UnitLoader>,
    register: Arc<dyn MetricRegister>,
    entry: &MethodKey,
) -> Result<Result<Option<Value>, VmError>> {
    let descriptor = MethodDescriptor::parse(&entry.signature)
        .with_context(|| format!("entry point {}", entry))?;
    if !descriptor.params.is_empty() {
        bail!("entry point {} must take no arguments", entry);
    }
    info!(entry = %entry, "running entry point");
    let mut vm = Vm::new(loader, register);
    Ok(vm.invoke_static(&entry.unit, &entry.method, &entry.signature, &[]))
}
