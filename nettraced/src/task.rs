//! Tracing Task: owns a set of probes and the Event Bus they feed, with
//! one-way idempotent lifecycle transitions: built → started → stopping →
//! stopped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use nettrace_common::{TracingEvent, TracingTaskOptions};

use crate::bus::{EventBus, Subscription};
use crate::clock::KernelClock;
use crate::error::TaskError;
use crate::probes::{EventCallback, Probe, ProbeRegistry, RawProbeEvent, RawTimestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Built,
    Started,
    Stopping,
    Stopped,
}

pub struct TracingTask {
    options: TracingTaskOptions,
    bus: Arc<EventBus>,
    probes: Mutex<HashMap<String, Box<dyn Probe>>>,
    state: Mutex<TaskState>,
}

fn resolve_timestamp(raw: RawTimestamp, clock: &KernelClock) -> u64 {
    match raw {
        RawTimestamp::UnixNs(ns) => ns,
        RawTimestamp::KtimeNs(ktime) => clock.to_unix_ns(ktime),
        RawTimestamp::None => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0),
    }
}

impl TracingTask {
    /// Builds every probe named in `options.probes` via `registry`, failing
    /// fast (and building nothing further) if any probe-type is unknown or
    /// its options are malformed. No probe is started yet.
    pub fn new(options: TracingTaskOptions, registry: &ProbeRegistry, clock: Arc<KernelClock>) -> Result<Self, TaskError> {
        let bus = Arc::new(EventBus::new(options.events.buffer_length));
        let mut probes: HashMap<String, Box<dyn Probe>> = HashMap::new();

        for (probe_type, probe_options) in &options.probes {
            let callback = Self::make_callback(probe_type.clone(), Arc::clone(&bus), Arc::clone(&clock));
            let probe = registry.build(probe_type, callback, probe_options.clone())?;
            probes.insert(probe_type.clone(), probe);
        }

        Ok(Self {
            options,
            bus,
            probes: Mutex::new(probes),
            state: Mutex::new(TaskState::Built),
        })
    }

    fn make_callback(probe_type: String, bus: Arc<EventBus>, clock: Arc<KernelClock>) -> EventCallback {
        Arc::new(move |raw: RawProbeEvent| {
            let timestamp = resolve_timestamp(raw.timestamp, &clock);
            bus.publish(TracingEvent {
                timestamp,
                probe: probe_type.clone(),
                event: raw.payload,
            });
        })
    }

    pub fn options(&self) -> &TracingTaskOptions {
        &self.options
    }

    /// Starts every probe. On partial failure, already-started sibling
    /// probes are stopped and the error is propagated; the task is left in
    /// `Built` so a caller can discard it.
    pub fn start(&self) -> Result<(), TaskError> {
        let mut state = self.state.lock().unwrap();
        if *state == TaskState::Started {
            return Ok(());
        }

        let mut probes = self.probes.lock().unwrap();
        let keys: Vec<String> = probes.keys().cloned().collect();
        let mut started = Vec::new();
        for key in keys {
            let probe = probes.get_mut(&key).expect("key came from this map");
            match probe.start() {
                Ok(()) => started.push(key),
                Err(err) => {
                    for started_key in &started {
                        probes.get_mut(started_key).expect("just started").stop();
                    }
                    return Err(err.into());
                }
            }
        }
        *state = TaskState::Started;
        Ok(())
    }

    /// Idempotent; after this returns, no probe's callback will fire again.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == TaskState::Stopped || *state == TaskState::Built {
            *state = TaskState::Stopped;
            return;
        }
        *state = TaskState::Stopping;
        let mut probes = self.probes.lock().unwrap();
        for probe in probes.values_mut() {
            probe.stop();
        }
        *state = TaskState::Stopped;
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    fn options_with_demo(interval: f64, buffer_length: usize) -> TracingTaskOptions {
        let mut probes = StdHashMap::new();
        probes.insert("demo".to_string(), json!({"interval": interval}));
        TracingTaskOptions {
            probes,
            events: nettrace_common::TracingTaskEventOptions { buffer_length },
        }
    }

    #[tokio::test]
    async fn demo_task_emits_events_until_stopped() {
        let registry = ProbeRegistry::default();
        let clock = Arc::new(KernelClock::new());
        let task = Arc::new(TracingTask::new(options_with_demo(0.01, 5), &registry, clock).unwrap());
        task.start().unwrap();

        let mut sub = task.subscribe();
        let first = tokio::time::timeout(std::time::Duration::from_secs(1), sub.next())
            .await
            .expect("event within 1s")
            .expect("subscription alive");
        assert_eq!(first.probe, "demo");

        task.stop();
    }

    #[test]
    fn unknown_probe_type_fails_construction() {
        let registry = ProbeRegistry::default();
        let clock = Arc::new(KernelClock::new());
        let mut probes = StdHashMap::new();
        probes.insert("no_such".to_string(), json!({}));
        let options = TracingTaskOptions {
            probes,
            events: Default::default(),
        };
        assert!(TracingTask::new(options, &registry, clock).is_err());
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let registry = ProbeRegistry::default();
        let clock = Arc::new(KernelClock::new());
        let task = TracingTask::new(options_with_demo(1.0, 10), &registry, clock).unwrap();
        task.start().unwrap();
        task.start().unwrap();
        task.stop();
        task.stop();
    }
}
