use tracing::{info, warn};
use weaver_spi::MetricRegister;
use weaver_unit::{
    access, finalize_unit, AccessFlags, Code, Insn, Method, TypeHierarchy, UnitFile, STATIC_INIT,
};

use crate::config::{ConfigIndex, MethodKey};
use crate::errors::TransformError;
use crate::method_rewriter::MethodRewriter;

/// What a unit rewrite did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    /// `name(descriptor)` of every instrumented method.
    pub instrumented: Vec<String>,
    /// Configured methods the unit does not declare.
    pub missing: Vec<MethodKey>,
    pub synthesized_static_init: bool,
    /// Interfaces are left alone.
    pub skipped_interface: bool,
}

/// Applies the configured metrics to every method of one unit.
pub struct ClassRewriter<'a> {
    config: &'a ConfigIndex,
    register: &'a dyn MetricRegister,
    hierarchy: &'a dyn TypeHierarchy,
}

impl<'a> ClassRewriter<'a> {
    pub fn new(
        config: &'a ConfigIndex,
        register: &'a dyn MetricRegister,
        hierarchy: &'a dyn TypeHierarchy,
    ) -> Self {
        Self {
            config,
            register,
            hierarchy,
        }
    }

    /// Rewrite `unit` in place. On error `unit` may be partially modified and
    /// must be discarded.
    pub fn rewrite(&self, unit: &mut UnitFile) -> Result<RewriteSummary, TransformError> {
        let mut summary = RewriteSummary::default();
        if unit.is_interface() {
            summary.skipped_interface = true;
            return Ok(summary);
        }
        let unit_name = unit.header.name.clone();
        let methods = MethodRewriter::new(&unit_name, self.register);

        // Every method is checked before any is rewritten or registers an
        // instrument, so a refused unit leaves the backend untouched.
        for method in unit.methods.iter().filter(|m| is_candidate(m)) {
            let metrics = self
                .config
                .find_by_key(&unit_name, &method.name, &method.descriptor);
            methods.check(method, metrics)?;
        }

        for method in unit.methods.iter_mut().filter(|m| is_candidate(m)) {
            let metrics = self
                .config
                .find_by_key(&unit_name, &method.name, &method.descriptor);
            if methods.rewrite(method, metrics)? {
                summary
                    .instrumented
                    .push(format!("{}{}", method.name, method.descriptor));
            }
        }

        for key in self.config.keys_for_unit(&unit_name) {
            if unit.find_method(&key.method, &key.signature).is_none() {
                warn!(unit = %unit_name, method = %key, "configured method not declared by unit");
                summary.missing.push(key.clone());
            }
        }

        if !unit.has_static_init() {
            unit.methods.push(empty_static_init());
            summary.synthesized_static_init = true;
        }

        finalize_unit(unit, self.hierarchy)?;
        info!(
            unit = %unit_name,
            methods = summary.instrumented.len(),
            "rewrote unit"
        );
        Ok(summary)
    }
}

fn is_candidate(method: &Method) -> bool {
    method.code.is_some() && !method.access.is_synthetic()
}

fn empty_static_init() -> Method {
    Method {
        access: AccessFlags(access::STATIC),
        name: STATIC_INIT.to_string(),
        descriptor: "()V".to_string(),
        code: Some(Code {
            insns: vec![Insn::Return(None)],
            ..Code::default()
        }),
    }
}
