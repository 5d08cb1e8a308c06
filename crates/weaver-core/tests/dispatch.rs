//! Dispatcher behavior around debug dumps and failure policy.

use std::borrow::Cow;
use std::fs;
use std::sync::Arc;

use tempfile::TempDir;
use weaver_core::dispatcher::dump_path;
use weaver_core::{ConfigIndex, NoResources, TransformDispatcher, TransformError, UnitTransformer};
use weaver_spi::InMemoryRegister;
use weaver_unit::analysis::RootHierarchy;
use weaver_unit::builder::{CodeBuilder, UnitBuilder};
use weaver_unit::{access, decode_unit, Insn};

fn config_with_dump(out: &std::path::Path) -> String {
    format!(
        r#"
metrics:
  "app/Foo.bar()V":
    - type: Counter
      name: bar_calls
debug:
  enabled: true
  outPath: "{}"
"#,
        out.display()
    )
}

fn foo_bytes() -> Vec<u8> {
    let mut code = CodeBuilder::new();
    code.emit(Insn::Return(None));
    UnitBuilder::new("app/Foo")
        .method(access::PUBLIC, "bar", "()V", code)
        .to_bytes(&RootHierarchy)
        .unwrap()
}

fn dispatcher(yaml: &str) -> (TransformDispatcher, Arc<InMemoryRegister>) {
    let register = Arc::new(InMemoryRegister::new());
    let dispatcher = TransformDispatcher::new(
        Arc::new(ConfigIndex::from_yaml_str(yaml).unwrap()),
        register.clone(),
    );
    (dispatcher, register)
}

/// With debug enabled, the rewritten bytes and a listing land under outPath.
#[test]
fn test_debug_dump_written() {
    let dir = TempDir::new().unwrap();
    let (d, _) = dispatcher(&config_with_dump(dir.path()));
    let bytes = foo_bytes();
    let out = d.transform("app/Foo", &bytes, &NoResources).unwrap();

    let binary = dump_path(dir.path(), "app/Foo", "unit");
    let listing = dump_path(dir.path(), "app/Foo", "txt");
    assert_eq!(fs::read(&binary).unwrap(), out.as_ref());
    let text = fs::read_to_string(&listing).unwrap();
    assert!(text.contains("app/Foo"));
    assert!(text.contains("weaver/Reporter.counterInc"));
}

/// A dump directory that cannot be created does not fail the transform.
#[test]
fn test_debug_dump_failure_swallowed() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, b"file").unwrap();
    let (d, _) = dispatcher(&config_with_dump(&blocker));

    let bytes = foo_bytes();
    let out = d.transform("app/Foo", &bytes, &NoResources).unwrap();
    assert!(matches!(out, Cow::Owned(_)));
    assert!(decode_unit(&out).unwrap().has_static_init());
}

/// Instruments are registered while rewriting, before any code runs.
#[test]
fn test_rewrite_registers_instruments() {
    let (d, register) = dispatcher("metrics:\n  \"app/Foo.bar()V\":\n    - type: Counter\n      name: bar_calls\n");
    d.transform("app/Foo", &foo_bytes(), &NoResources).unwrap();
    assert!(register.instrument("bar_calls").is_some());
    assert_eq!(register.counter_total("bar_calls"), 0);
}

/// A label that points past the argument list refuses the whole unit.
#[test]
fn test_bad_label_refuses_unit() {
    let (d, register) = dispatcher(
        "metrics:\n  \"app/Foo.bar()V\":\n    - type: Counter\n      name: bar_calls\n      labels: [\"who:$0\"]\n",
    );
    let err = d.transform("app/Foo", &foo_bytes(), &NoResources).unwrap_err();
    assert!(matches!(err, TransformError::Label { .. }));
    assert!(register.instrument("bar_calls").is_none());
}

/// The dispatcher is shared across loader threads.
#[test]
fn test_parallel_transforms() {
    let (d, register) = dispatcher("metrics:\n  \"app/Foo.bar()V\":\n    - type: Counter\n      name: bar_calls\n");
    let d = Arc::new(d);
    let bytes = Arc::new(foo_bytes());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let d = d.clone();
            let bytes = bytes.clone();
            std::thread::spawn(move || d.transform("app/Foo", &bytes, &NoResources).map(|b| b.into_owned()))
        })
        .collect();
    let outputs: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();
    assert!(outputs.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(register.instrument_count(), 1);
}
