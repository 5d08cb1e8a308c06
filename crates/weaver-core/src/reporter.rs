//! Call sites that rewritten code invokes, and instrument registration.
//!
//! Rewritten methods never name a metrics backend. They call static methods
//! on `weaver/Reporter`, whose runtime implementation forwards to the
//! process [`MetricRegister`](weaver_spi::MetricRegister).

use tracing::debug;
use weaver_spi::MetricRegister;
use weaver_unit::MemberRef;

use crate::config::Metric;
use crate::errors::TransformError;

pub const REPORTER: &str = "weaver/Reporter";
pub const COUNTER_INC: &str = "counterInc";
pub const GAUGE_INC: &str = "gaugeInc";
pub const GAUGE_DEC: &str = "gaugeDec";
pub const RECORD_TIME: &str = "recordTime";

/// `(name, labelValues)`
pub const REPORT_DESC: &str = "(Lcore/String;[Lcore/String;)V";
/// `(name, labelValues, elapsedNanos)`
pub const RECORD_TIME_DESC: &str = "(Lcore/String;[Lcore/String;J)V";

pub const SYSTEM: &str = "core/System";
pub const NANO_TIME: &str = "nanoTime";
pub const NANO_TIME_DESC: &str = "()J";

pub const STRING: &str = "core/String";
pub const VALUE_OF: &str = "valueOf";
pub const VALUE_OF_INT: &str = "(I)Lcore/String;";
pub const VALUE_OF_LONG: &str = "(J)Lcore/String;";
pub const VALUE_OF_BOOL: &str = "(Z)Lcore/String;";
pub const VALUE_OF_OBJECT: &str = "(Lcore/Object;)Lcore/String;";

pub const PROPERTIES: &str = "weaver/Properties";
pub const NESTED: &str = "nested";
pub const NESTED_DESC: &str = "(Lcore/Object;Lcore/String;)Lcore/Object;";

/// Element descriptor of the label value array.
pub const LABEL_ARRAY_ELEM: &str = "Lcore/String;";

pub fn reporter_call(method: &str) -> MemberRef {
    let desc = if method == RECORD_TIME {
        RECORD_TIME_DESC
    } else {
        REPORT_DESC
    };
    MemberRef::new(REPORTER, method, desc)
}

pub fn nano_time() -> MemberRef {
    MemberRef::new(SYSTEM, NANO_TIME, NANO_TIME_DESC)
}

pub fn value_of(descriptor: &str) -> MemberRef {
    MemberRef::new(STRING, VALUE_OF, descriptor)
}

pub fn nested_property() -> MemberRef {
    MemberRef::new(PROPERTIES, NESTED, NESTED_DESC)
}

/// Register the instrument of every metric with `register`. Repeated names
/// are no-ops in the backend.
pub fn register_metrics(
    register: &dyn MetricRegister,
    metrics: &[Metric],
) -> Result<(), TransformError> {
    for metric in metrics {
        debug!(metric = %metric.name, kind = %metric.kind, "registering metric");
        register
            .register(
                metric.kind.instrument_kind(),
                &metric.name,
                &metric.label_names(),
                &metric.doc,
            )
            .map_err(|e| TransformError::Register {
                metric: metric.name.clone(),
                message: e.to_string(),
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GaugeOp;
    use weaver_spi::InMemoryRegister;

    #[test]
    fn test_register_metrics_idempotent() {
        let reg = InMemoryRegister::new();
        let metrics = vec![
            Metric::counter("calls_total").with_label("user:$0").unwrap(),
            Metric::gauge("inflight", GaugeOp::Increment),
        ];
        register_metrics(&reg, &metrics).unwrap();
        register_metrics(&reg, &metrics).unwrap();
        assert_eq!(reg.instrument_count(), 2);
        assert_eq!(reg.instrument("calls_total").unwrap().label_names, vec!["user"]);
    }

    #[test]
    fn test_register_kind_conflict_is_transform_error() {
        let reg = InMemoryRegister::new();
        register_metrics(&reg, &[Metric::counter("x")]).unwrap();
        let err = register_metrics(&reg, &[Metric::histogram("x")]).unwrap_err();
        assert!(matches!(err, TransformError::Register { .. }));
    }

    #[test]
    fn test_call_descriptors() {
        assert_eq!(reporter_call(RECORD_TIME).descriptor, RECORD_TIME_DESC);
        assert_eq!(reporter_call(GAUGE_DEC).descriptor, REPORT_DESC);
    }
}
