//! Built-in units every loader starts with.
//!
//! The root type, strings, throwables and the declarations of every native
//! call site rewritten code may invoke. Native bodies live in
//! [`crate::natives`].

use anyhow::{Context, Result};
use weaver_core::reporter;
use weaver_unit::analysis::RootHierarchy;
use weaver_unit::builder::{CodeBuilder, UnitBuilder};
use weaver_unit::{access, Insn, MemberRef, ValueKind, ROOT_TYPE, STRING_TYPE, THROWABLE_TYPE};

pub const RUNTIME_EXCEPTION: &str = "core/RuntimeException";
pub const NULL_POINTER: &str = "core/NullPointerException";
pub const INDEX_OUT_OF_BOUNDS: &str = "core/IndexOutOfBoundsException";

/// Field holding a throwable's message.
pub const MESSAGE_FIELD: &str = "message";

const NATIVE_STATIC: u16 = access::PUBLIC | access::STATIC | access::NATIVE;

/// `(name, bytes)` of every built-in unit.
pub fn core_units() -> Result<Vec<(String, Vec<u8>)>> {
    let mut get_message = CodeBuilder::new();
    get_message.emit_all([
        Insn::Load(ValueKind::Ref, 0),
        Insn::GetField(MemberRef::new(THROWABLE_TYPE, MESSAGE_FIELD, "Lcore/String;")),
        Insn::Return(Some(ValueKind::Ref)),
    ]);

    let builders = vec![
        UnitBuilder::new(ROOT_TYPE).no_super(),
        UnitBuilder::new(STRING_TYPE)
            .access(access::PUBLIC | access::FINAL)
            .declare(NATIVE_STATIC, reporter::VALUE_OF, reporter::VALUE_OF_INT)
            .declare(NATIVE_STATIC, reporter::VALUE_OF, reporter::VALUE_OF_LONG)
            .declare(NATIVE_STATIC, reporter::VALUE_OF, reporter::VALUE_OF_BOOL)
            .declare(NATIVE_STATIC, reporter::VALUE_OF, reporter::VALUE_OF_OBJECT),
        UnitBuilder::new(THROWABLE_TYPE)
            .field(access::PRIVATE, MESSAGE_FIELD, "Lcore/String;")
            .method(access::PUBLIC, "getMessage", "()Lcore/String;", get_message),
        UnitBuilder::new(RUNTIME_EXCEPTION).extends(THROWABLE_TYPE),
        UnitBuilder::new(NULL_POINTER).extends(RUNTIME_EXCEPTION),
        UnitBuilder::new(INDEX_OUT_OF_BOUNDS).extends(RUNTIME_EXCEPTION),
        UnitBuilder::new(reporter::SYSTEM)
            .access(access::PUBLIC | access::FINAL)
            .declare(NATIVE_STATIC, reporter::NANO_TIME, reporter::NANO_TIME_DESC),
        UnitBuilder::new(reporter::REPORTER)
            .access(access::PUBLIC | access::FINAL)
            .declare(NATIVE_STATIC, reporter::COUNTER_INC, reporter::REPORT_DESC)
            .declare(NATIVE_STATIC, reporter::GAUGE_INC, reporter::REPORT_DESC)
            .declare(NATIVE_STATIC, reporter::GAUGE_DEC, reporter::REPORT_DESC)
            .declare(NATIVE_STATIC, reporter::RECORD_TIME, reporter::RECORD_TIME_DESC),
        UnitBuilder::new(reporter::PROPERTIES)
            .access(access::PUBLIC | access::FINAL)
            .declare(NATIVE_STATIC, reporter::NESTED, reporter::NESTED_DESC),
    ];

    builders
        .into_iter()
        .map(|builder| {
            let unit = builder.build();
            let name = unit.header.name.clone();
            let bytes = weaver_unit::encode_unit(&finalized(unit)?)
                .with_context(|| format!("encoding core unit {}", name))?;
            Ok((name, bytes))
        })
        .collect()
}

fn finalized(mut unit: weaver_unit::UnitFile) -> Result<weaver_unit::UnitFile> {
    weaver_unit::finalize_unit(&mut unit, &RootHierarchy)
        .with_context(|| format!("finalizing core unit {}", unit.header.name))?;
    Ok(unit)
}
