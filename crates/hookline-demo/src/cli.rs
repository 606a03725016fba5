use std::io::Write as _;
use std::time::Duration;

use clap::{Parser, Subcommand};
use hookline_core::observability::{ObservabilityConfig, init_with};
use hookline_core::{CallContext, Flow};
use tracing::info;

use crate::agent::agent_pipeline;
use crate::hooks::{frame_text, logging_registrations, stdout_sink};
use crate::pipelines::{echo_pipeline, words_pipeline};

const HOOK_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "hookline-demo", about = "Hook-instrumented pipeline demos")]
pub struct Cli {
    /// Log filter override (`info`, `debug`, `hookline_core=trace`, ...)
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Pause between streamed frames, in milliseconds
    #[arg(long, global = true, default_value_t = 80)]
    frame_delay_ms: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum Command {
    /// Run a single echo node
    Echo { text: String },
    /// Stream the given words back one frame at a time
    Stream {
        #[arg(required = true)]
        words: Vec<String>,
    },
    /// Ask the offline tool agent a question
    Agent {
        #[arg(required = true)]
        question: Vec<String>,
    },
}

impl Cli {
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let mut config = ObservabilityConfig::from_env();
        if let Some(level) = self.log_level {
            config = config.with_level(level);
        }
        init_with(config);

        let delay = Duration::from_millis(self.frame_delay_ms);
        let (hooks, streams) = logging_registrations(stdout_sink());
        let ctx = CallContext::new();
        info!(
            event = "demo.started",
            domain = "demo",
            invocation_id = %ctx.invocation_id(),
            command = ?self.command
        );

        let output = match self.command {
            Command::Echo { text } => echo_pipeline(hooks)?.invoke(&ctx, text).await?,
            Command::Stream { words } => {
                words_pipeline(hooks, delay)?.invoke(&ctx, words.join(" ")).await?
            }
            Command::Agent { question } => {
                agent_pipeline(hooks, delay)?.invoke(&ctx, question.join(" ")).await?
            }
        };

        match output {
            Flow::Scalar(payload) => {
                println!("{}", Option::<String>::from(payload).unwrap_or_default());
            }
            Flow::Stream(mut stream) => {
                let mut stdout = std::io::stdout();
                while let Some(frame) = stream.recv().await? {
                    print!("{} ", frame_text(&frame).trim_end());
                    stdout.flush()?;
                }
                println!();
                if tokio::time::timeout(HOOK_FLUSH_TIMEOUT, streams.wait_for_streams(1))
                    .await
                    .is_err()
                {
                    tracing::warn!(event = "demo.hook_flush_timeout", domain = "demo");
                }
            }
        }
        Ok(())
    }
}
