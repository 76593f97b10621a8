//! `nettrace events`: stream a tracing task's events to a consumer sink.
//!
//! Sinks are a tagged variant with a common `{init, handle, close}`
//! contract rather than a registry of classes.

use anyhow::Result;
use futures_util::StreamExt;
use nettrace_common::TracingEvent;

use crate::client::ApiClient;

trait EventSink {
    fn init(&mut self) {}
    fn handle(&mut self, event: &TracingEvent);
    fn close(&mut self) {}
}

struct PrintSink;

impl EventSink for PrintSink {
    fn handle(&mut self, event: &TracingEvent) {
        println!("{} {} {}", event.timestamp, event.probe, event.event);
    }
}

/// No time-series backend is implemented; this sink exists so
/// `--action upload` round-trips through the same dispatch as `print`
/// rather than being rejected outright.
struct UploadSink;

impl EventSink for UploadSink {
    fn init(&mut self) {
        tracing::warn!("upload sink is not implemented yet; events will be dropped");
    }

    fn handle(&mut self, _event: &TracingEvent) {}
}

fn sink_for(action: &str) -> Box<dyn EventSink> {
    match action {
        "upload" => Box::new(UploadSink),
        _ => Box::new(PrintSink),
    }
}

pub async fn run(client: &ApiClient, id: &str, action: &str) -> Result<()> {
    let mut sink = sink_for(action);
    sink.init();

    let mut stream = Box::pin(client.stream_events(id).await?);
    let mut buffered = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffered.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(newline_at) = buffered.find('\n') {
            let line = buffered[..newline_at].to_string();
            buffered.drain(..=newline_at);
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TracingEvent>(&line) {
                Ok(event) => sink.handle(&event),
                Err(err) => tracing::warn!(%err, line, "skipping malformed event line"),
            }
        }
    }

    sink.close();
    Ok(())
}
