//! `nettrace stop`: remove a tracing task.

use anyhow::Result;

use crate::client::ApiClient;

pub async fn run(client: &ApiClient, id: &str) -> Result<()> {
    client.remove_task(id).await?;
    println!("Stopped {id}");
    Ok(())
}
