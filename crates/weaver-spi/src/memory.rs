//! In-process register that keeps every value in memory.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::provider::{BackendSettings, MetricRegisterFactory};
use crate::register::{InstrumentKind, MetricRegister};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentSnapshot {
    pub kind: InstrumentKind,
    pub label_names: Vec<String>,
    pub doc: String,
}

#[derive(Debug, Default)]
struct Series {
    counters: HashMap<Vec<String>, u64>,
    gauges: HashMap<Vec<String>, i64>,
    observations: HashMap<Vec<String>, Vec<u64>>,
}

/// A [`MetricRegister`] with inspectable state.
#[derive(Debug, Default)]
pub struct InMemoryRegister {
    instruments: RwLock<HashMap<String, InstrumentSnapshot>>,
    series: RwLock<HashMap<String, Series>>,
}

impl InMemoryRegister {
    pub fn new() -> Self {
        Self::default()
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
            if existing.kind != kind {
                bail!(
                    "metric {} already registered as a {}, not a {}",
                    name,
                    existing.kind,
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
            trace!(metric = name, "already registered");
            return Ok(());
        }
        debug!(metric = name, %kind, labels = ?label_names, "registering instrument");
        instruments.insert(
            name.to_string(),
            InstrumentSnapshot {
                kind,
                label_names: label_names.to_vec(),
                doc: doc.to_string(),
            },
        );
        Ok(())
    }

    fn is_kind(&self, name: &str, kind: InstrumentKind) -> bool {
        self.instruments
            .read()
            .get(name)
            .is_some_and(|i| i.kind == kind)
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut Series)) {
        let mut series = self.series.write();
        f(series.entry(name.to_string()).or_default());
    }

    /// Number of registered instruments.
    pub fn instrument_count(&self) -> usize {
        self.instruments.read().len()
    }

    pub fn instrument(&self, name: &str) -> Option<InstrumentSnapshot> {
        self.instruments.read().get(name).cloned()
    }

    pub fn counter_value(&self, name: &str, label_values: &[&str]) -> u64 {
        let key = owned(label_values);
        self.series
            .read()
            .get(name)
            .and_then(|s| s.counters.get(&key).copied())
            .unwrap_or(0)
    }

    /// Sum over every label combination of a counter.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.series
            .read()
            .get(name)
            .map(|s| s.counters.values().sum())
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str, label_values: &[&str]) -> i64 {
        let key = owned(label_values);
        self.series
            .read()
            .get(name)
            .and_then(|s| s.gauges.get(&key).copied())
            .unwrap_or(0)
    }

    /// Observed durations, in nanoseconds, in recording order.
    pub fn observations(&self, name: &str, label_values: &[&str]) -> Vec<u64> {
        let key = owned(label_values);
        self.series
            .read()
            .get(name)
            .and_then(|s| s.observations.get(&key).cloned())
            .unwrap_or_default()
    }

    /// Every label combination recorded against `name`, across all kinds.
    pub fn label_sets(&self, name: &str) -> Vec<Vec<String>> {
        let series = self.series.read();
        let Some(s) = series.get(name) else {
            return Vec::new();
        };
        let mut sets: Vec<Vec<String>> = s
            .counters
            .keys()
            .chain(s.gauges.keys())
            .chain(s.observations.keys())
            .cloned()
            .collect();
        sets.sort();
        sets.dedup();
        sets
    }
}

fn owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl MetricRegister for InMemoryRegister {
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
        if !self.is_kind(name, InstrumentKind::Counter) {
            trace!(metric = name, "dropping increment of unknown counter");
            return;
        }
        self.update(name, |s| {
            *s.counters.entry(label_values.to_vec()).or_default() += amount;
        });
    }

    fn gauge_inc(&self, name: &str, label_values: &[String]) {
        if !self.is_kind(name, InstrumentKind::Gauge) {
            trace!(metric = name, "dropping increment of unknown gauge");
            return;
        }
        self.update(name, |s| {
            *s.gauges.entry(label_values.to_vec()).or_default() += 1;
        });
    }

    fn gauge_dec(&self, name: &str, label_values: &[String]) {
        if !self.is_kind(name, InstrumentKind::Gauge) {
            trace!(metric = name, "dropping decrement of unknown gauge");
            return;
        }
        self.update(name, |s| {
            *s.gauges.entry(label_values.to_vec()).or_default() -= 1;
        });
    }

    fn record_time(&self, name: &str, label_values: &[String], duration_nanos: u64) {
        if !self.is_kind(name, InstrumentKind::Histogram) {
            trace!(metric = name, "dropping observation of unknown histogram");
            return;
        }
        self.update(name, |s| {
            s.observations
                .entry(label_values.to_vec())
                .or_default()
                .push(duration_nanos);
        });
    }
}

/// Factory for [`InMemoryRegister`]; ignores its settings.
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryFactory;

impl MetricRegisterFactory for InMemoryFactory {
    fn name(&self) -> &str {
        "memory"
    }

    fn new_instance(&self, _settings: &BackendSettings) -> Result<Arc<dyn MetricRegister>> {
        Ok(Arc::new(InMemoryRegister::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(values: &[&str]) -> Vec<String> {
        owned(values)
    }

    #[test]
    fn test_register_is_idempotent() {
        let reg = InMemoryRegister::new();
        reg.register_counter("calls_total", &labels(&["user"]), "calls").unwrap();
        reg.register_counter("calls_total", &labels(&["user"]), "calls").unwrap();
        assert_eq!(reg.instrument_count(), 1);
    }

    #[test]
    fn test_register_kind_conflict_fails() {
        let reg = InMemoryRegister::new();
        reg.register_counter("x", &[], "").unwrap();
        let err = reg.register_gauge("x", &[], "").unwrap_err();
        assert!(err.to_string().contains("already registered as a counter"));
    }

    #[test]
    fn test_register_label_conflict_fails() {
        let reg = InMemoryRegister::new();
        reg.register_counter("hits", &labels(&["k"]), "").unwrap();
        let err = reg
            .register_counter("hits", &labels(&["k", "extra"]), "")
            .unwrap_err();
        assert!(err.to_string().contains("already registered with labels"));
        assert_eq!(reg.instrument("hits").unwrap().label_names, vec!["k"]);
    }

    #[test]
    fn test_counter_per_label_values() {
        let reg = InMemoryRegister::new();
        reg.register_counter("hits", &labels(&["path"]), "").unwrap();
        reg.counter_inc("hits", &labels(&["/a"]));
        reg.counter_inc("hits", &labels(&["/a"]));
        reg.counter_inc_by("hits", &labels(&["/b"]), 5);

        assert_eq!(reg.counter_value("hits", &["/a"]), 2);
        assert_eq!(reg.counter_value("hits", &["/b"]), 5);
        assert_eq!(reg.counter_total("hits"), 7);
        assert_eq!(reg.label_sets("hits").len(), 2);
    }

    #[test]
    fn test_gauge_up_and_down() {
        let reg = InMemoryRegister::new();
        reg.register_gauge("inflight", &[], "").unwrap();
        reg.gauge_inc("inflight", &[]);
        reg.gauge_inc("inflight", &[]);
        reg.gauge_dec("inflight", &[]);
        assert_eq!(reg.gauge_value("inflight", &[]), 1);
    }

    #[test]
    fn test_unregistered_records_are_dropped() {
        let reg = InMemoryRegister::new();
        reg.counter_inc("nope", &[]);
        reg.record_time("nope", &[], 10);
        assert_eq!(reg.counter_total("nope"), 0);
        assert!(reg.observations("nope", &[]).is_empty());
    }

    #[test]
    fn test_record_time_keeps_order() {
        let reg = InMemoryRegister::new();
        reg.register_histogram("latency", &[], "").unwrap();
        reg.record_time("latency", &[], 30);
        reg.record_time("latency", &[], 10);
        assert_eq!(reg.observations("latency", &[]), vec![30, 10]);
    }

    #[test]
    fn test_factory_builds_empty_register() {
        let reg = InMemoryFactory.new_instance(&BackendSettings::new()).unwrap();
        reg.register(InstrumentKind::Histogram, "h", &[], "").unwrap();
        reg.record_time("h", &[], 1);
    }
}
