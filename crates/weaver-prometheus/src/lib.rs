//! Prometheus backend for the metrics-weaver register SPI.
//!
//! Every metric declared in the configuration becomes a labelled vector
//! (`CounterVec`, `GaugeVec` or `HistogramVec`) in a private
//! [`prometheus::Registry`]. Durations arrive in nanoseconds and are observed
//! in seconds.
//!
//! Recognised backend settings:
//!
//! | key         | type         | meaning                               |
//! |-------------|--------------|---------------------------------------|
//! | `namespace` | string       | prefix applied to every metric name   |
//! | `buckets`   | list of f64  | histogram buckets in seconds          |
//!
//! Exposition over HTTP is left to the embedding process; [`PrometheusRegister::render`]
//! produces the text format.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::RwLock;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tracing::{debug, trace, warn};
use weaver_spi::{BackendSettings, InstrumentKind, MetricRegister, MetricRegisterFactory};

enum Instrument {
    Counter(CounterVec),
    Gauge(GaugeVec),
    Histogram(HistogramVec),
}

impl Instrument {
    fn kind(&self) -> InstrumentKind {
        match self {
            Instrument::Counter(_) => InstrumentKind::Counter,
            Instrument::Gauge(_) => InstrumentKind::Gauge,
            Instrument::Histogram(_) => InstrumentKind::Histogram,
        }
    }
}

struct Registered {
    instrument: Instrument,
    label_names: Vec<String>,
}

pub struct PrometheusRegister {
    registry: Registry,
    namespace: Option<String>,
    buckets: Option<Vec<f64>>,
    instruments: RwLock<HashMap<String, Registered>>,
}

impl PrometheusRegister {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            namespace: None,
            buckets: None,
            instruments: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &BackendSettings) -> Result<Self> {
        let mut register = Self::new();
        if let Some(ns) = settings.get("namespace") {
            let ns = ns
                .as_str()
                .ok_or_else(|| anyhow!("backend setting `namespace` must be a string"))?;
            register.namespace = Some(ns.to_string());
        }
        if let Some(buckets) = settings.get("buckets") {
            let list = buckets
                .as_array()
                .ok_or_else(|| anyhow!("backend setting `buckets` must be a list"))?;
            let parsed = list
                .iter()
                .map(|v| {
                    v.as_f64()
                        .ok_or_else(|| anyhow!("histogram bucket {} is not a number", v))
                })
                .collect::<Result<Vec<f64>>>()?;
            register.buckets = Some(parsed);
        }
        for key in settings.keys() {
            if key != "namespace" && key != "buckets" {
                warn!(setting = %key, "ignoring unknown prometheus backend setting");
            }
        }
        Ok(register)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current state of every instrument in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metric families")?;
        Ok(String::from_utf8(buffer)?)
    }

    fn register_kind(
        &self,
        kind: InstrumentKind,
        name: &str,
        label_names: &[String],
        doc: &str,
    ) -> Result<()> {
        let mut instruments = self.instruments.write();
        if let Some(existing) = instruments.get(name) {
            if existing.instrument.kind() != kind {
                bail!(
                    "metric {} already registered as a {}, not a {}",
                    name,
                    existing.instrument.kind(),
                    kind
                );
            }
            if existing.label_names != label_names {
                bail!(
                    "metric {} already registered with labels {:?}, not {:?}",
                    name,
                    existing.label_names,
                    label_names
                );
            }
            return Ok(());
        }

        // Prometheus rejects empty help text.
        let help = if doc.is_empty() { name } else { doc };
        let labels: Vec<&str> = label_names.iter().map(String::as_str).collect();
        let instrument = match kind {
            InstrumentKind::Counter => {
                let vec = CounterVec::new(self.opts(name, help), &labels)?;
                self.registry.register(Box::new(vec.clone()))?;
                Instrument::Counter(vec)
            }
            InstrumentKind::Gauge => {
                let vec = GaugeVec::new(self.opts(name, help), &labels)?;
                self.registry.register(Box::new(vec.clone()))?;
                Instrument::Gauge(vec)
            }
            InstrumentKind::Histogram => {
                let mut opts = HistogramOpts::from(self.opts(name, help));
                if let Some(buckets) = &self.buckets {
                    opts = opts.buckets(buckets.clone());
                }
                let vec = HistogramVec::new(opts, &labels)?;
                self.registry.register(Box::new(vec.clone()))?;
                Instrument::Histogram(vec)
            }
        };
        debug!(metric = name, %kind, "registered prometheus instrument");
        instruments.insert(
            name.to_string(),
            Registered {
                instrument,
                label_names: label_names.to_vec(),
            },
        );
        Ok(())
    }

    fn opts(&self, name: &str, help: &str) -> Opts {
        let opts = Opts::new(name, help);
        match &self.namespace {
            Some(ns) => opts.namespace(ns.clone()),
            None => opts,
        }
    }

    fn with_instrument(&self, name: &str, f: impl FnOnce(&Instrument) -> prometheus::Result<()>) {
        let instruments = self.instruments.read();
        let Some(Registered { instrument, .. }) = instruments.get(name) else {
            trace!(metric = name, "dropping record for unregistered metric");
            return;
        };
        if let Err(e) = f(instrument) {
            warn!(metric = name, error = %e, "failed to record metric");
        }
    }
}

impl Default for PrometheusRegister {
    fn default() -> Self {
        Self::new()
    }
}

fn values(label_values: &[String]) -> Vec<&str> {
    label_values.iter().map(String::as_str).collect()
}

fn kind_mismatch(name: &str, wanted: InstrumentKind) -> prometheus::Error {
    prometheus::Error::Msg(format!("{} is not a {}", name, wanted))
}

impl MetricRegister for PrometheusRegister {
    fn register_counter(&self, name: &str, label_names: &[String], doc: &str) -> Result<()> {
        self.register_kind(InstrumentKind::Counter, name, label_names, doc)
    }

    fn register_gauge(&self, name: &str, label_names: &[String], doc: &str) -> Result<()> {
        self.register_kind(InstrumentKind::Gauge, name, label_names, doc)
    }

    fn register_histogram(&self, name: &str, label_names: &[String], doc: &str) -> Result<()> {
        self.register_kind(InstrumentKind::Histogram, name, label_names, doc)
    }

    fn counter_inc_by(&self, name: &str, label_values: &[String], amount: u64) {
        self.with_instrument(name, |i| match i {
            Instrument::Counter(c) => {
                c.get_metric_with_label_values(&values(label_values))?
                    .inc_by(amount as f64);
                Ok(())
            }
            _ => Err(kind_mismatch(name, InstrumentKind::Counter)),
        });
    }

    fn gauge_inc(&self, name: &str, label_values: &[String]) {
        self.with_instrument(name, |i| match i {
            Instrument::Gauge(g) => {
                g.get_metric_with_label_values(&values(label_values))?.inc();
                Ok(())
            }
            _ => Err(kind_mismatch(name, InstrumentKind::Gauge)),
        });
    }

    fn gauge_dec(&self, name: &str, label_values: &[String]) {
        self.with_instrument(name, |i| match i {
            Instrument::Gauge(g) => {
                g.get_metric_with_label_values(&values(label_values))?.dec();
                Ok(())
            }
            _ => Err(kind_mismatch(name, InstrumentKind::Gauge)),
        });
    }

    fn record_time(&self, name: &str, label_values: &[String], duration_nanos: u64) {
        let seconds = duration_nanos as f64 / 1_000_000_000.0;
        self.with_instrument(name, |i| match i {
            Instrument::Histogram(h) => {
                h.get_metric_with_label_values(&values(label_values))?
                    .observe(seconds);
                Ok(())
            }
            _ => Err(kind_mismatch(name, InstrumentKind::Histogram)),
        });
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusFactory;

impl MetricRegisterFactory for PrometheusFactory {
    fn name(&self) -> &str {
        "prometheus"
    }

    fn new_instance(&self, settings: &BackendSettings) -> Result<Arc<dyn MetricRegister>> {
        Ok(Arc::new(PrometheusRegister::from_settings(settings)?))
    }
}
