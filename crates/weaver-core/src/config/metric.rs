//! Validated metric declarations.

use std::fmt;

use serde::Deserialize;
use weaver_spi::InstrumentKind;

use crate::config::document::MetricEntry;
use crate::errors::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum MetricKind {
    #[serde(alias = "counter", alias = "COUNTER")]
    Counter,
    #[serde(alias = "gauge", alias = "GAUGE")]
    Gauge,
    #[serde(alias = "histogram", alias = "HISTOGRAM")]
    Histogram,
}

impl MetricKind {
    pub fn instrument_kind(self) -> InstrumentKind {
        match self {
            MetricKind::Counter => InstrumentKind::Counter,
            MetricKind::Gauge => InstrumentKind::Gauge,
            MetricKind::Histogram => InstrumentKind::Histogram,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.instrument_kind(), f)
    }
}

/// What a gauge does on method entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GaugeOp {
    #[default]
    Increment,
    Decrement,
}

impl GaugeOp {
    pub fn parse(s: &str) -> Option<GaugeOp> {
        match s.trim() {
            "" | "increment" | "inc" | "gaugeInc" => Some(GaugeOp::Increment),
            "decrement" | "dec" | "gaugeDec" => Some(GaugeOp::Decrement),
            _ => None,
        }
    }
}

/// One `<name>:<valueExpr>` label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSpec {
    pub name: String,
    pub value_expr: String,
}

impl LabelSpec {
    pub fn parse(metric: &str, raw: &str) -> Result<Self, ConfigError> {
        let malformed = |reason: &str| ConfigError::MalformedLabel {
            metric: metric.to_string(),
            label: raw.to_string(),
            reason: reason.to_string(),
        };
        let (name, value) = raw
            .split_once(':')
            .ok_or_else(|| malformed("expected <name>:<value>"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(malformed("empty label name"));
        }
        Ok(Self {
            name: name.to_string(),
            value_expr: value.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metric {
    pub kind: MetricKind,
    pub name: String,
    pub doc: String,
    pub labels: Vec<LabelSpec>,
    /// Only meaningful for gauges.
    pub gauge_op: GaugeOp,
}

impl Metric {
    pub fn counter(name: &str) -> Self {
        Self::new(MetricKind::Counter, name)
    }

    pub fn gauge(name: &str, op: GaugeOp) -> Self {
        Self {
            gauge_op: op,
            ..Self::new(MetricKind::Gauge, name)
        }
    }

    pub fn histogram(name: &str) -> Self {
        Self::new(MetricKind::Histogram, name)
    }

    fn new(kind: MetricKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            doc: String::new(),
            labels: Vec::new(),
            gauge_op: GaugeOp::default(),
        }
    }

    /// Add a label from its `<name>:<valueExpr>` form.
    pub fn with_label(mut self, raw: &str) -> Result<Self, ConfigError> {
        self.labels.push(LabelSpec::parse(&self.name, raw)?);
        Ok(self)
    }

    pub fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }

    pub fn from_entry(entry: &MetricEntry) -> Result<Self, ConfigError> {
        if entry.name.trim().is_empty() {
            return Err(ConfigError::Parse {
                message: format!("a {} metric has an empty name", entry.kind),
            });
        }
        let gauge_op = match (&entry.method, entry.kind) {
            (None, _) => GaugeOp::default(),
            (Some(m), MetricKind::Gauge) => {
                GaugeOp::parse(m).ok_or_else(|| ConfigError::UnknownGaugeMethod {
                    metric: entry.name.clone(),
                    method: m.clone(),
                })?
            }
            (Some(m), kind) => {
                tracing::warn!(metric = %entry.name, %kind, method = %m, "method override only applies to gauges, ignoring");
                GaugeOp::default()
            }
        };
        let labels = entry
            .labels
            .iter()
            .map(|raw| LabelSpec::parse(&entry.name, raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            kind: entry.kind,
            name: entry.name.clone(),
            doc: entry.doc.clone(),
            labels,
            gauge_op,
        })
    }
}
