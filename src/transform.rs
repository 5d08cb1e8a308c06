//! Offline rewriting of a directory of unit files.
//!
//! Every `*.unit` under the input directory is read up front so header
//! lookups during rewriting can see the whole set. Each unit is then passed
//! through the dispatcher and written to the output directory under its
//! internal name. Units that fail to rewrite are reported and not written.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};
use weaver_core::dispatcher::dump_path;
use weaver_core::{ResourceSource, TransformDispatcher, UnitTransformer};
use weaver_unit::read_header;

pub const UNIT_EXTENSION: &str = "unit";

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransformReport {
    pub rewritten: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<FailedUnit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedUnit {
    pub unit: String,
    pub error: String,
}

impl TransformReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Units read from disk, keyed by internal name.
#[derive(Debug, Default)]
pub struct DirectorySource {
    units: HashMap<String, Vec<u8>>,
}

impl DirectorySource {
    pub fn read(dir: &Path) -> Result<Self> {
        let mut units = HashMap::new();
        for path in collect_unit_files(dir)? {
            let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let header =
                read_header(&bytes).with_context(|| format!("reading header of {}", path.display()))?;
            if units.insert(header.name.clone(), bytes).is_some() {
                warn!(unit = %header.name, path = %path.display(), "duplicate unit, keeping the later file");
            }
        }
        Ok(Self { units })
    }

    /// Unit names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.units.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl ResourceSource for DirectorySource {
    fn unit_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.units.get(name).cloned()
    }
}

/// Every `*.unit` file below `dir`, sorted.
pub fn collect_unit_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries =
            fs::read_dir(&current).with_context(|| format!("listing {}", current.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == UNIT_EXTENSION) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Rewrite every unit under `units_dir` into `out_dir`.
pub fn transform_dir(
    dispatcher: &TransformDispatcher,
    units_dir: &Path,
    out_dir: &Path,
) -> Result<TransformReport> {
    let source = DirectorySource::read(units_dir)?;
    info!(units = source.len(), dir = %units_dir.display(), "transforming units");

    let mut report = TransformReport::default();
    for name in source.names() {
        let Some(bytes) = source.units.get(name) else {
            continue;
        };
        match dispatcher.transform(name, bytes, &source) {
            Ok(out) => {
                let changed = out.as_ref() != bytes.as_slice();
                write_unit(out_dir, name, &out)?;
                if changed {
                    report.rewritten.push(name.to_string());
                } else {
                    report.unchanged.push(name.to_string());
                }
            }
            Err(e) => report.failed.push(FailedUnit {
                unit: name.to_string(),
                error: e.to_string(),
            }),
        }
    }
    info!(
        rewritten = report.rewritten.len(),
        unchanged = report.unchanged.len(),
        failed = report.failed.len(),
        "transform finished"
    );
    Ok(report)
}

fn write_unit(out_dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let path = dump_path(out_dir, name, UNIT_EXTENSION);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))
}
