//! Offline demos of hook-instrumented pipelines: echo, word streaming, and a scripted tool agent.

mod agent;
mod cli;
mod hooks;
mod pipelines;

use clap::Parser;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    cli::Cli::parse().run().await
}
