//! Metrics emission for Trellis components
//!
//! Components receive an `Arc<dyn MetricsEmitter>` instead of reaching for a
//! global registry, so tests can observe or discard what is emitted.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use opentelemetry::metrics::{Gauge, Meter};
use opentelemetry::{global, KeyValue};
use parking_lot::Mutex;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("trellis"));

/// Dimensions attached to a metric sample
pub type Dimensions = BTreeMap<String, String>;

/// Topics emitted by the dispatcher
pub mod topics {
    /// Number of workers currently running
    pub const WORKERS_ACTIVE: &str = "backend.workers.count";
    /// Seconds spent in one provisioning cycle
    pub const CYCLE_DURATION: &str = "backend.cycle.duration";
    /// One sample per finished provisioning cycle, dimensioned by outcome
    pub const CYCLE_RESULT: &str = "backend.cycle.result";
    /// Dispatcher plumbing errors
    pub const DISPATCH_ERRORS: &str = "backend.dispatch.errors";
}

/// Sink for gauge-style metric samples
pub trait MetricsEmitter: Send + Sync {
    /// Emit an integer sample
    fn emit_gauge(&self, topic: &str, value: i64, dims: &Dimensions);

    /// Emit a floating-point sample
    fn emit_float(&self, topic: &str, value: f64, dims: &Dimensions);
}

/// Build a dimension map from `(key, value)` pairs
pub fn dims<const N: usize>(pairs: [(&str, &str); N]) -> Dimensions {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Emitter backed by OpenTelemetry gauges
///
/// Topics map to instruments named `trellis_<topic with '.' as '_'>`.
#[derive(Default)]
pub struct OtelEmitter {
    int_gauges: DashMap<String, Gauge<i64>>,
    float_gauges: DashMap<String, Gauge<f64>>,
}

impl OtelEmitter {
    /// Create a shareable emitter
    pub fn shared() -> Arc<dyn MetricsEmitter> {
        Arc::new(Self::default())
    }
}

fn instrument_name(topic: &str) -> String {
    format!("trellis_{}", topic.replace('.', "_"))
}

fn attributes(dims: &Dimensions) -> Vec<KeyValue> {
    dims.iter()
        .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
        .collect()
}

impl MetricsEmitter for OtelEmitter {
    fn emit_gauge(&self, topic: &str, value: i64, dims: &Dimensions) {
        let gauge = self
            .int_gauges
            .entry(topic.to_string())
            .or_insert_with(|| METER.i64_gauge(instrument_name(topic)).build());
        gauge.record(value, &attributes(dims));
    }

    fn emit_float(&self, topic: &str, value: f64, dims: &Dimensions) {
        let gauge = self
            .float_gauges
            .entry(topic.to_string())
            .or_insert_with(|| METER.f64_gauge(instrument_name(topic)).build());
        gauge.record(value, &attributes(dims));
    }
}

/// Emitter that drops every sample
#[derive(Default, Clone, Copy)]
pub struct NoopEmitter;

impl NoopEmitter {
    /// Create a shareable emitter
    pub fn shared() -> Arc<dyn MetricsEmitter> {
        Arc::new(Self)
    }
}

impl MetricsEmitter for NoopEmitter {
    fn emit_gauge(&self, _topic: &str, _value: i64, _dims: &Dimensions) {}
    fn emit_float(&self, _topic: &str, _value: f64, _dims: &Dimensions) {}
}

/// Emitter that records samples in memory
#[derive(Default)]
pub struct RecordingEmitter {
    samples: Mutex<Vec<(String, f64, Dimensions)>>,
}

impl RecordingEmitter {
    /// Every sample recorded for `topic`, in emission order
    pub fn samples(&self, topic: &str) -> Vec<(f64, Dimensions)> {
        self.samples
            .lock()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, v, d)| (*v, d.clone()))
            .collect()
    }
}

impl MetricsEmitter for RecordingEmitter {
    fn emit_gauge(&self, topic: &str, value: i64, dims: &Dimensions) {
        self.samples
            .lock()
            .push((topic.to_string(), value as f64, dims.clone()));
    }

    fn emit_float(&self, topic: &str, value: f64, dims: &Dimensions) {
        self.samples
            .lock()
            .push((topic.to_string(), value, dims.clone()));
    }
}
