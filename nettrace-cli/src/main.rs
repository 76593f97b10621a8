//! `nettrace`: control client for `nettraced`. A handful of global options
//! plus one subcommand per action.

mod actions;
mod client;

use clap::{Parser, Subcommand};

use client::ApiClient;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:10032";

#[derive(Parser)]
#[command(name = "nettrace", about = "Control client for the network tracing daemon")]
struct Cli {
    /// base URL of the API service exposed by the daemon
    #[arg(short = 'b', long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// name of the logging level
    #[arg(short = 'l', long, default_value = "info")]
    logging_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// list tracing tasks
    Ls,
    /// start a tracing task with a single probe
    Start {
        probe: String,
        /// probe options as a JSON object
        #[arg(long, default_value = "{}")]
        options: String,
        #[arg(long, default_value_t = 100)]
        buffer_length: usize,
    },
    /// stop a tracing task
    Stop { id: String },
    /// stream a tracing task's events
    Events {
        id: String,
        #[arg(long, default_value = "print")]
        action: String,
    },
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.logging_level);

    let client = ApiClient::new(cli.base_url);

    match cli.command {
        Command::Ls => actions::ls::run(&client).await,
        Command::Start { probe, options, buffer_length } => {
            actions::start::run(&client, &probe, &options, buffer_length).await
        }
        Command::Stop { id } => actions::stop::run(&client, &id).await,
        Command::Events { id, action } => actions::events::run(&client, &id, &action).await,
    }
}
