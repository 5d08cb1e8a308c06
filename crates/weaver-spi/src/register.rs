use anyhow::Result;
use std::fmt;

/// Kind of instrument a metric name is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentKind {
    Counter,
    Gauge,
    Histogram,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentKind::Counter => write!(f, "counter"),
            InstrumentKind::Gauge => write!(f, "gauge"),
            InstrumentKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// Backend that owns metric instruments.
///
/// Registration is register-if-absent: registering a name that already
/// exists is a no-op, so the same metric may be declared on many methods and
/// reached from many load threads. Recording calls never fail; a record
/// against an unknown name is dropped by the implementation.
pub trait MetricRegister: Send + Sync {
    fn register_counter(&self, name: &str, label_names: &[String], doc: &str) -> Result<()>;

    fn register_gauge(&self, name: &str, label_names: &[String], doc: &str) -> Result<()>;

    fn register_histogram(&self, name: &str, label_names: &[String], doc: &str) -> Result<()>;

    fn counter_inc(&self, name: &str, label_values: &[String]) {
        self.counter_inc_by(name, label_values, 1);
    }

    fn counter_inc_by(&self, name: &str, label_values: &[String], amount: u64);

    fn gauge_inc(&self, name: &str, label_values: &[String]);

    fn gauge_dec(&self, name: &str, label_values: &[String]);

    /// Record one observation of `duration_nanos` on a histogram.
    fn record_time(&self, name: &str, label_values: &[String], duration_nanos: u64);

    /// Register an instrument of the given kind.
    fn register(
        &self,
        kind: InstrumentKind,
        name: &str,
        label_names: &[String],
        doc: &str,
    ) -> Result<()> {
        match kind {
            InstrumentKind::Counter => self.register_counter(name, label_names, doc),
            InstrumentKind::Gauge => self.register_gauge(name, label_names, doc),
            InstrumentKind::Histogram => self.register_histogram(name, label_names, doc),
        }
    }
}
