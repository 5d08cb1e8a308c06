//! Agent bootstrap from an argument string. Kept in its own test binary
//! because it installs the process-wide register.

use std::fs;

use tempfile::TempDir;
use weaver_core::agent::bootstrap;
use weaver_core::{NoResources, UnitTransformer};
use weaver_spi::{InMemoryFactory, MetricsProvider};
use weaver_unit::analysis::RootHierarchy;
use weaver_unit::builder::{CodeBuilder, UnitBuilder};
use weaver_unit::{access, Insn};

/// `config:<path>` loads the file, installs the backend and rewrites.
#[test]
fn test_bootstrap_from_args() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("agent.yaml");
    fs::write(
        &path,
        "metrics:\n  \"app/Foo.bar()V\":\n    - type: Counter\n      name: boot_calls\n",
    )
    .unwrap();

    let dispatcher = bootstrap(&format!("config:{}", path.display()), &InMemoryFactory).unwrap();
    assert!(dispatcher.config().has_metric("app/Foo"));
    assert!(MetricsProvider::get().is_some());

    let mut code = CodeBuilder::new();
    code.emit(Insn::Return(None));
    let bytes = UnitBuilder::new("app/Foo")
        .method(access::PUBLIC, "bar", "()V", code)
        .to_bytes(&RootHierarchy)
        .unwrap();
    dispatcher.transform("app/Foo", &bytes, &NoResources).unwrap();

    // A second bootstrap keeps the installed register.
    let again = bootstrap("", &InMemoryFactory).unwrap();
    assert!(again.config().is_empty());
    assert!(std::sync::Arc::ptr_eq(again.register(), dispatcher.register()));

    assert!(bootstrap("config", &InMemoryFactory).is_err());
    assert!(bootstrap(&format!("config:{}", dir.path().join("nope.yaml").display()), &InMemoryFactory).is_err());
}
