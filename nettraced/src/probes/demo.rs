//! Synthetic demo probe: emits `{current_time}` every `interval` seconds.
//! Used for end-to-end tests where real kernel attachment isn't available.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::{json, Value};

use super::{EventCallback, Probe, RawProbeEvent, RawTimestamp};
use crate::error::ProbeError;

#[derive(Debug, Deserialize)]
struct DemoOptions {
    #[serde(default = "default_interval")]
    interval: f64,
}

fn default_interval() -> f64 {
    1.0
}

pub struct DemoProbe {
    interval: Duration,
    callback: EventCallback,
    quit: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DemoProbe {
    pub fn new(callback: EventCallback, interval: Duration) -> Self {
        Self {
            interval,
            callback,
            quit: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl Probe for DemoProbe {
    fn start(&mut self) -> Result<(), ProbeError> {
        if self.handle.is_some() {
            return Ok(());
        }
        self.quit.store(false, Ordering::SeqCst);
        let quit = Arc::clone(&self.quit);
        let callback = Arc::clone(&self.callback);
        let interval = self.interval;
        self.handle = Some(thread::spawn(move || {
            while !quit.load(Ordering::SeqCst) {
                thread::sleep(interval);
                if quit.load(Ordering::SeqCst) {
                    break;
                }
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                let current_time = format!("{}.{:09}", now.as_secs(), now.subsec_nanos());
                callback(RawProbeEvent {
                    timestamp: RawTimestamp::None,
                    payload: json!({ "current_time": current_time }),
                });
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        self.quit.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn factory(callback: EventCallback, options: Value) -> Result<Box<dyn Probe>, ProbeError> {
    let options: DemoOptions = serde_json::from_value(options).map_err(|e| ProbeError::MalformedOptions {
        probe: "demo".to_string(),
        reason: e.to_string(),
    })?;
    let interval = Duration::from_secs_f64(options.interval.max(0.001));
    Ok(Box::new(DemoProbe::new(callback, interval)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn emits_events_on_the_configured_interval() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let callback: EventCallback = Arc::new(move |event| {
            events_clone.lock().unwrap().push(event);
        });
        let mut probe = DemoProbe::new(callback, Duration::from_millis(10));
        probe.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        probe.stop();
        let collected = events.lock().unwrap();
        assert!(collected.len() >= 3, "expected several events, got {}", collected.len());
        let payload = &collected[0].payload;
        assert!(payload.get("current_time").is_some());
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let callback: EventCallback = Arc::new(|_| {});
        let mut probe = DemoProbe::new(callback, Duration::from_millis(5));
        probe.start().unwrap();
        probe.start().unwrap();
        probe.stop();
        probe.stop();
    }
}
