//! `nettrace start`: create and start a tracing task with a single probe.

use anyhow::{Context, Result};
use nettrace_common::{TracingTaskEventOptions, TracingTaskOptions};
use std::collections::HashMap;

use crate::client::ApiClient;

pub async fn run(client: &ApiClient, probe: &str, options_json: &str, buffer_length: usize) -> Result<()> {
    let probe_options: serde_json::Value = serde_json::from_str(options_json)
        .with_context(|| format!("'{options_json}' is not valid JSON"))?;

    let mut probes = HashMap::new();
    probes.insert(probe.to_string(), probe_options);

    let options = TracingTaskOptions {
        probes,
        events: TracingTaskEventOptions { buffer_length },
    };

    let response = client.create_task(&options).await?;
    println!("{}", response.id);
    Ok(())
}
