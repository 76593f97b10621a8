//! `nettrace ls`: list tracing tasks.

use anyhow::Result;

use crate::client::ApiClient;

pub async fn run(client: &ApiClient) -> Result<()> {
    let tasks = client.list_tasks().await?;
    if tasks.is_empty() {
        println!("No tracing tasks.");
        return Ok(());
    }
    for task in tasks {
        let probes: Vec<&str> = task.options.probes.keys().map(String::as_str).collect();
        println!("{}  probes=[{}]  buffer_length={}", task.id, probes.join(", "), task.options.events.buffer_length);
    }
    Ok(())
}
