//! The Probe abstraction: a runnable owning some OS resource that pushes a
//! lazy, typed event stream through a bound callback.

pub mod demo;
pub mod perf;
pub mod subprocess;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::ProbeError;

/// Either the probe already knows the event's absolute time, knows only a
/// kernel monotonic ktime that must be reconciled against wall clock, or
/// has neither and the bus should stamp it with the current wall clock.
#[derive(Debug, Clone, Copy)]
pub enum RawTimestamp {
    UnixNs(u64),
    KtimeNs(u64),
    None,
}

/// What a probe hands to its bound callback: a timestamp hint plus an
/// opaque JSON payload. The owning Tracing Task resolves the timestamp
/// and wraps this into a `TracingEvent`.
#[derive(Debug, Clone)]
pub struct RawProbeEvent {
    pub timestamp: RawTimestamp,
    pub payload: Value,
}

pub type EventCallback = Arc<dyn Fn(RawProbeEvent) + Send + Sync>;

/// A capability `{start, stop}`. `start` must return promptly; production
/// happens on workers the probe owns. `stop` is idempotent and, once it
/// returns, the bound callback is guaranteed never to run again.
pub trait Probe: Send {
    fn start(&mut self) -> Result<(), ProbeError>;
    fn stop(&mut self);
}

pub type ProbeFactory = Arc<dyn Fn(EventCallback, Value) -> Result<Box<dyn Probe>, ProbeError> + Send + Sync>;

/// Process-wide mapping from probe-type name to factory.
#[derive(Clone)]
pub struct ProbeRegistry {
    factories: HashMap<String, ProbeFactory>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, factory: ProbeFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn build(&self, probe_type: &str, callback: EventCallback, options: Value) -> Result<Box<dyn Probe>, ProbeError> {
        let factory = self
            .factories
            .get(probe_type)
            .ok_or_else(|| ProbeError::UnknownType(probe_type.to_string()))?;
        factory(callback, options)
    }

    pub fn contains(&self, probe_type: &str) -> bool {
        self.factories.contains_key(probe_type)
    }
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("demo", Arc::new(demo::factory));
        registry.register(
            "delay_analysis_out",
            Arc::new(|cb, opts| perf::factory(perf::DelayKind::Out, cb, opts)),
        );
        registry.register(
            "delay_analysis_out_v6",
            Arc::new(|cb, opts| perf::factory(perf::DelayKind::OutV6, cb, opts)),
        );
        registry.register(
            "delay_analysis_in",
            Arc::new(|cb, opts| perf::factory(perf::DelayKind::In, cb, opts)),
        );
        registry.register(
            "delay_analysis_in_v6",
            Arc::new(|cb, opts| perf::factory(perf::DelayKind::InV6, cb, opts)),
        );
        registry.register(
            "runqslower",
            Arc::new(|cb, opts| perf::factory(perf::DelayKind::RunqSlower, cb, opts)),
        );
        registry.register("retsnoop", Arc::new(subprocess::factory));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_probe_type_is_an_error() {
        let registry = ProbeRegistry::default();
        let result = registry.build("no_such", Arc::new(|_| {}), serde_json::json!({}));
        let err = match result {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(err, ProbeError::UnknownType(name) if name == "no_such"));
    }

    #[test]
    fn default_registry_knows_every_builtin_probe_type() {
        let registry = ProbeRegistry::default();
        for name in [
            "demo",
            "delay_analysis_out",
            "delay_analysis_out_v6",
            "delay_analysis_in",
            "delay_analysis_in_v6",
            "runqslower",
            "retsnoop",
        ] {
            assert!(registry.contains(name), "missing probe type {name}");
        }
    }
}
