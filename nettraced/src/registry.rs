//! Task Registry: process-wide id → TracingTask mapping.

use std::sync::Arc;

use dashmap::DashMap;
use nettrace_common::TracingTaskOptions;
use rand::RngCore;

use crate::clock::KernelClock;
use crate::error::TaskError;
use crate::probes::ProbeRegistry;
use crate::task::TracingTask;

fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct TaskRegistry {
    probes: Arc<ProbeRegistry>,
    clock: Arc<KernelClock>,
    tasks: DashMap<String, Arc<TracingTask>>,
}

impl TaskRegistry {
    pub fn new(probes: Arc<ProbeRegistry>, clock: Arc<KernelClock>) -> Self {
        Self {
            probes,
            clock,
            tasks: DashMap::new(),
        }
    }

    /// Constructs a task, starts it, inserts it under a fresh 128-bit
    /// random hex id, and returns the id. Collisions are not checked
    /// (negligible probability for session-scoped use).
    pub fn create(&self, options: TracingTaskOptions) -> Result<String, TaskError> {
        let task = TracingTask::new(options, &self.probes, Arc::clone(&self.clock))?;
        task.start()?;
        let id = generate_id();
        self.tasks.insert(id.clone(), Arc::new(task));
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<TracingTask>> {
        self.tasks.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn list(&self) -> Vec<(String, TracingTaskOptions)> {
        self.tasks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().options().clone()))
            .collect()
    }

    pub fn remove(&self, id: &str) -> Result<(), TaskError> {
        match self.tasks.remove(id) {
            Some((_, task)) => {
                task.stop();
                Ok(())
            }
            None => Err(TaskError::NotFound(id.to_string())),
        }
    }

    /// Stops every task. Called at daemon shutdown.
    pub fn shutdown(&self) {
        for entry in self.tasks.iter() {
            entry.value().stop();
        }
        self.tasks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn demo_options() -> TracingTaskOptions {
        let mut probes = HashMap::new();
        probes.insert("demo".to_string(), json!({"interval": 1.0}));
        TracingTaskOptions {
            probes,
            events: Default::default(),
        }
    }

    fn registry() -> TaskRegistry {
        TaskRegistry::new(Arc::new(ProbeRegistry::default()), Arc::new(KernelClock::new()))
    }

    #[test]
    fn create_then_list_contains_returned_id_with_matching_options() {
        let reg = registry();
        let id = reg.create(demo_options()).unwrap();
        let listed = reg.list();
        assert!(listed.iter().any(|(listed_id, opts)| listed_id == &id && opts.probes.contains_key("demo")));
        reg.remove(&id).unwrap();
    }

    #[test]
    fn remove_unknown_id_is_an_error() {
        let reg = registry();
        assert!(reg.remove("deadbeef").is_err());
    }

    #[test]
    fn unknown_probe_type_does_not_register_a_task() {
        let reg = registry();
        let mut probes = HashMap::new();
        probes.insert("no_such".to_string(), json!({}));
        let options = TracingTaskOptions {
            probes,
            events: Default::default(),
        };
        assert!(reg.create(options).is_err());
        assert!(reg.list().is_empty());
    }
}
