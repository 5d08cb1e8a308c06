//! End-to-end runs of instrumented units: configuration in, rewritten units
//! executed in the sandbox, metrics observed in an in-memory register.

use std::sync::Arc;

use weaver_core::{AncestorResolver, ConfigIndex, DescriptorCache, TransformDispatcher};
use weaver_sandbox::{UnitLoader, Value, Vm, VmError};
use weaver_spi::InMemoryRegister;
use weaver_unit::analysis::RootHierarchy;
use weaver_unit::builder::{CodeBuilder, UnitBuilder};
use weaver_unit::{access, decode_unit, verify_unit, Insn, MemberRef, ValueKind};

const STATIC: u16 = access::PUBLIC | access::STATIC;
const RUNTIME_EXCEPTION: &str = "core/RuntimeException";

struct Harness {
    loader: Arc<UnitLoader>,
    register: Arc<InMemoryRegister>,
    vm: Vm,
}

fn harness(yaml: &str, units: Vec<UnitBuilder>) -> Harness {
    let register = Arc::new(InMemoryRegister::new());
    let loader = Arc::new(UnitLoader::new().unwrap());
    for unit in units {
        loader.add_bytes(unit.to_bytes(&RootHierarchy).unwrap()).unwrap();
    }
    let config = ConfigIndex::from_yaml_str(yaml).unwrap();
    loader.add_transformer(Arc::new(TransformDispatcher::new(
        Arc::new(config),
        register.clone(),
    )));
    let vm = Vm::new(loader.clone(), register.clone());
    Harness {
        loader,
        register,
        vm,
    }
}

fn void_body() -> CodeBuilder {
    let mut code = CodeBuilder::new();
    code.emit(Insn::Return(None));
    code
}

/// `run(Z)V`: throws a RuntimeException with message "boom" when the
/// argument is true, returns normally otherwise.
fn maybe_throw(slot: u16) -> CodeBuilder {
    let mut code = CodeBuilder::new();
    let ok = code.label();
    code.emit_all([Insn::Load(ValueKind::Int, slot), Insn::IfEq(ok)])
        .emit_all(throw_runtime("boom"))
        .mark(ok)
        .emit(Insn::Return(None));
    code
}

fn throw_runtime(message: &str) -> Vec<Insn> {
    vec![
        Insn::New(RUNTIME_EXCEPTION.into()),
        Insn::Dup,
        Insn::PushStr(message.into()),
        Insn::PutField(MemberRef::new("core/Throwable", "message", "Lcore/String;")),
        Insn::Throw,
    ]
}

fn verify_defined(h: &Harness, unit: &str) {
    let bytes = h.loader.defined_bytes(unit).unwrap();
    let cache = DescriptorCache::new();
    let resolver = AncestorResolver::new(h.loader.as_ref(), &cache);
    verify_unit(&decode_unit(&bytes).unwrap(), &resolver).unwrap();
}

/// A label-free counter on an instance method counts every invocation.
#[test]
fn test_counter_counts_invocations() {
    let mut h = harness(
        r#"
metrics:
  "app/Foo.bar()V":
    - type: Counter
      name: calls_total
      doc: Calls to bar
"#,
        vec![UnitBuilder::new("app/Foo").method(access::PUBLIC, "bar", "()V", void_body())],
    );
    let foo = h.vm.new_instance("app/Foo").unwrap();
    for _ in 0..3 {
        h.vm.invoke_virtual(foo, "bar", "()V", &[]).unwrap();
    }
    assert_eq!(h.register.counter_value("calls_total", &[]), 3);
    assert_eq!(h.register.instrument("calls_total").unwrap().doc, "Calls to bar");
    verify_defined(&h, "app/Foo");
}

/// `method: decrement` routes to gaugeDec; the default is gaugeInc.
#[test]
fn test_gauge_method_override() {
    let mut h = harness(
        r#"
metrics:
  "app/Pool.acquire()V":
    - type: Gauge
      name: in_use
  "app/Pool.release()V":
    - type: Gauge
      name: in_use
      method: decrement
"#,
        vec![UnitBuilder::new("app/Pool")
            .method(STATIC, "acquire", "()V", void_body())
            .method(STATIC, "release", "()V", void_body())],
    );
    for _ in 0..3 {
        h.vm.invoke_static("app/Pool", "acquire", "()V", &[]).unwrap();
    }
    h.vm.invoke_static("app/Pool", "release", "()V", &[]).unwrap();
    assert_eq!(h.register.gauge_value("in_use", &[]), 2);

    for _ in 0..3 {
        h.vm.invoke_static("app/Pool", "release", "()V", &[]).unwrap();
    }
    assert_eq!(h.register.gauge_value("in_use", &[]), -1);
    assert_eq!(h.register.instrument_count(), 1);
}

/// A histogram records exactly one duration for a successful call and
/// exactly one for a throwing call, and the exception still escapes intact.
#[test]
fn test_histogram_records_on_both_paths() {
    let mut h = harness(
        r#"
metrics:
  "app/Job.run(Z)V":
    - type: Histogram
      name: run_seconds
"#,
        vec![UnitBuilder::new("app/Job").method(STATIC, "run", "(Z)V", maybe_throw(0))],
    );

    h.vm.invoke_static("app/Job", "run", "(Z)V", &[Value::bool(false)]).unwrap();
    assert_eq!(h.register.observations("run_seconds", &[]).len(), 1);

    let err = h
        .vm
        .invoke_static("app/Job", "run", "(Z)V", &[Value::bool(true)])
        .unwrap_err();
    match err {
        VmError::Uncaught { class, message } => {
            assert_eq!(class, RUNTIME_EXCEPTION);
            assert_eq!(message.as_deref(), Some("boom"));
        }
        other => panic!("expected uncaught exception, got {:?}", other),
    }
    let observations = h.register.observations("run_seconds", &[]);
    assert_eq!(observations.len(), 2);
    verify_defined(&h, "app/Job");
}

/// Counters fire on the exceptional exit too.
#[test]
fn test_counter_fires_when_method_throws() {
    let mut h = harness(
        r#"
metrics:
  "app/Job.run(Z)V":
    - type: Counter
      name: runs_total
"#,
        vec![UnitBuilder::new("app/Job").method(STATIC, "run", "(Z)V", maybe_throw(0))],
    );
    assert!(h
        .vm
        .invoke_static("app/Job", "run", "(Z)V", &[Value::bool(true)])
        .unwrap_err()
        .is_uncaught());
    h.vm.invoke_static("app/Job", "run", "(Z)V", &[Value::bool(false)]).unwrap();
    assert_eq!(h.register.counter_value("runs_total", &[]), 2);
}

/// An exception caught inside the method is not an exceptional exit.
#[test]
fn test_caught_exception_is_normal_exit() {
    let mut code = CodeBuilder::new();
    let (start, end, handler) = (code.label(), code.label(), code.label());
    code.handler(start, end, handler, Some(RUNTIME_EXCEPTION))
        .mark(start)
        .emit_all(throw_runtime("inner"))
        .mark(end)
        .mark(handler)
        .emit_all([Insn::Pop, Insn::PushInt(42), Insn::Return(Some(ValueKind::Int))]);
    let mut h = harness(
        r#"
metrics:
  "app/Safe.run()I":
    - type: Histogram
      name: safe_seconds
    - type: Counter
      name: safe_total
"#,
        vec![UnitBuilder::new("app/Safe").method(STATIC, "run", "()I", code)],
    );
    assert_eq!(
        h.vm.invoke_static("app/Safe", "run", "()I", &[]).unwrap(),
        Some(Value::Int(42))
    );
    assert_eq!(h.register.observations("safe_seconds", &[]).len(), 1);
    assert_eq!(h.register.counter_value("safe_total", &[]), 1);
    verify_defined(&h, "app/Safe");
}

/// Every return site reports once and return values are untouched.
#[test]
fn test_multiple_returns_preserve_values() {
    // abs(x)
    let mut code = CodeBuilder::new();
    let negative = code.label();
    code.emit_all([
        Insn::Load(ValueKind::Int, 0),
        Insn::PushInt(0),
        Insn::IfICmpLt(negative),
        Insn::Load(ValueKind::Int, 0),
        Insn::Return(Some(ValueKind::Int)),
    ])
    .mark(negative)
    .emit_all([
        Insn::PushInt(0),
        Insn::Load(ValueKind::Int, 0),
        Insn::ISub,
        Insn::Return(Some(ValueKind::Int)),
    ]);
    let mut h = harness(
        r#"
metrics:
  "app/Num.abs(I)I":
    - type: Counter
      name: abs_total
      labels: ["input:$0"]
    - type: Histogram
      name: abs_seconds
"#,
        vec![UnitBuilder::new("app/Num").method(STATIC, "abs", "(I)I", code)],
    );
    for (input, expected) in [(5, 5), (-4, 4), (0, 0)] {
        assert_eq!(
            h.vm.invoke_static("app/Num", "abs", "(I)I", &[Value::Int(input)]).unwrap(),
            Some(Value::Int(expected))
        );
    }
    assert_eq!(h.register.counter_value("abs_total", &["5"]), 1);
    assert_eq!(h.register.counter_value("abs_total", &["-4"]), 1);
    assert_eq!(h.register.counter_total("abs_total"), 3);
    assert_eq!(h.register.observations("abs_seconds", &[]).len(), 3);
    verify_defined(&h, "app/Num");
}

/// Literal, argument and nested-property labels all reach the register.
#[test]
fn test_label_bindings() {
    let mut h = harness(
        r#"
imports:
  - app/model/User
metrics:
  "app/Svc.handle(LUser;IJZ)V":
    - type: Counter
      name: handled_total
      labels: ["user:$0.name", "count:$1", "big:$2", "flag:$3", "source:api"]
"#,
        vec![
            UnitBuilder::new("app/model/User").field(access::PUBLIC, "name", "Lcore/String;"),
            UnitBuilder::new("app/Svc").method(
                access::PUBLIC,
                "handle",
                "(Lapp/model/User;IJZ)V",
                void_body(),
            ),
        ],
    );
    let svc = h.vm.new_instance("app/Svc").unwrap();
    let user = h.vm.new_instance("app/model/User").unwrap();
    let name = h.vm.new_string("ann");
    h.vm.set_field(user, "name", name).unwrap();

    let args = [user, Value::Int(7), Value::Long(1 << 33), Value::bool(true)];
    h.vm.invoke_virtual(svc, "handle", "(Lapp/model/User;IJZ)V", &args)
        .unwrap();
    assert_eq!(
        h.register
            .counter_value("handled_total", &["ann", "7", "8589934592", "true", "api"]),
        1
    );

    // A null argument cannot be followed into; the label is "null".
    let args = [Value::Null, Value::Int(1), Value::Long(0), Value::bool(false)];
    h.vm.invoke_virtual(svc, "handle", "(Lapp/model/User;IJZ)V", &args)
        .unwrap();
    assert_eq!(
        h.register
            .counter_value("handled_total", &["null", "1", "0", "false", "api"]),
        1
    );
    assert_eq!(
        h.register.instrument("handled_total").unwrap().label_names,
        vec!["user", "count", "big", "flag", "source"]
    );
    verify_defined(&h, "app/Svc");
}

/// Histogram labels are captured and survive the exceptional exit.
#[test]
fn test_histogram_labels_on_throw() {
    let mut h = harness(
        r#"
metrics:
  "app/Job.run(Z)V":
    - type: Histogram
      name: job_seconds
      labels: ["failing:$0"]
"#,
        vec![UnitBuilder::new("app/Job").method(STATIC, "run", "(Z)V", maybe_throw(0))],
    );
    let _ = h.vm.invoke_static("app/Job", "run", "(Z)V", &[Value::bool(true)]);
    h.vm.invoke_static("app/Job", "run", "(Z)V", &[Value::bool(false)]).unwrap();
    assert_eq!(h.register.observations("job_seconds", &["true"]).len(), 1);
    assert_eq!(h.register.observations("job_seconds", &["false"]).len(), 1);
}

/// The same metric name on two methods is one instrument fed by both.
#[test]
fn test_shared_metric_single_instrument() {
    let mut h = harness(
        r#"
metrics:
  "app/Api.get()V":
    - type: Counter
      name: api_calls
  "app/Api.put()V":
    - type: Counter
      name: api_calls
"#,
        vec![UnitBuilder::new("app/Api")
            .method(STATIC, "get", "()V", void_body())
            .method(STATIC, "put", "()V", void_body())],
    );
    h.vm.invoke_static("app/Api", "get", "()V", &[]).unwrap();
    h.vm.invoke_static("app/Api", "put", "()V", &[]).unwrap();
    h.vm.invoke_static("app/Api", "put", "()V", &[]).unwrap();
    assert_eq!(h.register.instrument_count(), 1);
    assert_eq!(h.register.counter_value("api_calls", &[]), 3);
}

/// A unit's own static initializer still runs exactly once.
#[test]
fn test_existing_static_init_kept() {
    let field = MemberRef::new("app/Cfg", "loads", "I");
    let mut clinit = CodeBuilder::new();
    clinit.emit_all([
        Insn::GetStatic(field.clone()),
        Insn::PushInt(1),
        Insn::IAdd,
        Insn::PutStatic(field.clone()),
        Insn::Return(None),
    ]);
    let mut read = CodeBuilder::new();
    read.emit_all([Insn::GetStatic(field), Insn::Return(Some(ValueKind::Int))]);
    let mut h = harness(
        r#"
metrics:
  "app/Cfg.loads()I":
    - type: Counter
      name: cfg_reads
"#,
        vec![UnitBuilder::new("app/Cfg")
            .field(access::STATIC, "loads", "I")
            .method(access::STATIC, "<clinit>", "()V", clinit)
            .method(STATIC, "loads", "()I", read)],
    );
    for _ in 0..2 {
        assert_eq!(
            h.vm.invoke_static("app/Cfg", "loads", "()I", &[]).unwrap(),
            Some(Value::Int(1))
        );
    }
    assert_eq!(h.register.counter_value("cfg_reads", &[]), 2);
}

/// Units the configuration does not mention are defined from their
/// original bytes.
#[test]
fn test_unconfigured_units_untouched() {
    let h = harness(
        "metrics:\n  \"app/Foo.bar()V\":\n    - type: Counter\n      name: c\n",
        vec![UnitBuilder::new("app/Other").method(STATIC, "run", "()V", void_body())],
    );
    let defined = h.loader.defined_bytes("app/Other").unwrap();
    let unit = decode_unit(&defined).unwrap();
    assert!(!unit.has_static_init());
    assert_eq!(h.register.instrument_count(), 0);
}

/// A label referencing a missing argument refuses the unit at load time.
#[test]
fn test_invalid_label_refuses_load() {
    let mut h = harness(
        r#"
metrics:
  "app/Foo.bar()V":
    - type: Counter
      name: calls_total
      labels: ["x:$3"]
"#,
        vec![UnitBuilder::new("app/Foo").method(STATIC, "bar", "()V", void_body())],
    );
    let err = h.vm.invoke_static("app/Foo", "bar", "()V", &[]).unwrap_err();
    assert!(matches!(err, VmError::Transform(_)));
    assert!(!h.loader.is_defined("app/Foo"));
}

/// Two methods sharing a metric name with different label lists refuse the
/// second unit instead of feeding one instrument with mismatched labels.
#[test]
fn test_shared_metric_label_mismatch_refuses_load() {
    let mut h = harness(
        r#"
metrics:
  "app/Foo.a()V":
    - type: Counter
      name: hits
      labels: ["k:a"]
  "app/Bar.b()V":
    - type: Counter
      name: hits
      labels: ["k:b", "extra:y"]
"#,
        vec![
            UnitBuilder::new("app/Foo").method(STATIC, "a", "()V", void_body()),
            UnitBuilder::new("app/Bar").method(STATIC, "b", "()V", void_body()),
        ],
    );
    h.vm.invoke_static("app/Foo", "a", "()V", &[]).unwrap();
    assert_eq!(h.register.counter_value("hits", &["a"]), 1);

    let err = h.vm.invoke_static("app/Bar", "b", "()V", &[]).unwrap_err();
    assert!(matches!(err, VmError::Transform(_)));
    assert!(!h.loader.is_defined("app/Bar"));
    assert_eq!(h.register.instrument("hits").unwrap().label_names, vec!["k"]);
}

/// A counter label whose `toString` throws is evaluated after the
/// histogram's clock has started, so the histogram still records once.
#[test]
fn test_histogram_records_when_later_label_throws() {
    let mut bad_to_string = CodeBuilder::new();
    bad_to_string.emit_all(throw_runtime("bad"));
    let mut h = harness(
        r#"
imports:
  - app/Bad
metrics:
  "app/Job.run(LBad;)V":
    - type: Histogram
      name: job_seconds
    - type: Counter
      name: job_calls
      labels: ["v:$0"]
"#,
        vec![
            UnitBuilder::new("app/Bad").method(
                access::PUBLIC,
                "toString",
                "()Lcore/String;",
                bad_to_string,
            ),
            UnitBuilder::new("app/Job").method(STATIC, "run", "(Lapp/Bad;)V", void_body()),
        ],
    );
    let bad = h.vm.new_instance("app/Bad").unwrap();
    let err = h
        .vm
        .invoke_static("app/Job", "run", "(Lapp/Bad;)V", &[bad])
        .unwrap_err();
    match err {
        VmError::Uncaught { class, message } => {
            assert_eq!(class, RUNTIME_EXCEPTION);
            assert_eq!(message.as_deref(), Some("bad"));
        }
        other => panic!("expected uncaught exception, got {:?}", other),
    }
    assert_eq!(h.register.observations("job_seconds", &[]).len(), 1);
    assert_eq!(h.register.counter_total("job_calls"), 0);
    verify_defined(&h, "app/Job");
}
