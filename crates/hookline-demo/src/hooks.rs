use std::sync::Arc;

use async_trait::async_trait;
use hookline_core::callbacks::{CallbackHook, RunFilter, RunInfo, Timing, Timings};
use hookline_core::{CallContext, ExecutionError, Frame, HookRegistration, Payload, StreamReader};
use tokio::sync::Semaphore;

/// Where log lines go.
pub type Sink = Arc<dyn Fn(String) + Send + Sync>;

pub fn stdout_sink() -> Sink {
    Arc::new(|line| println!("{line}"))
}

/// Prints lifecycle events: `[OnStart]`/`[OnEnd]` with the payload as pretty JSON, `[OnError]`,
/// and `[OnEndStream]` once a streamed output is fully read.
pub struct LoggingHook {
    sink: Sink,
    interests: Timings,
    streams_logged: Arc<Semaphore>,
}

impl LoggingHook {
    pub fn new(sink: Sink) -> Self {
        Self {
            sink,
            interests: Timings::ALL,
            streams_logged: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn with_interests(mut self, interests: Timings) -> Self {
        self.interests = interests;
        self
    }

    /// Wait until `n` streamed outputs have been logged.
    pub async fn wait_for_streams(&self, n: u32) {
        if let Ok(permits) = self.streams_logged.acquire_many(n).await {
            permits.forget();
        }
    }

    fn emit(&self, tag: &str, info: &RunInfo, body: String) {
        (self.sink)(format!(
            "[{tag}] {} ({}, depth {})\n{body}",
            info.name, info.kind, info.depth
        ));
    }
}

fn pretty(payload: &Payload) -> String {
    serde_json::to_string_pretty(payload).unwrap_or_else(|err| format!("<unprintable: {err}>"))
}

pub(crate) fn frame_text(frame: &Frame) -> String {
    Option::<String>::from(frame.payload.clone()).unwrap_or_default()
}

#[async_trait]
impl CallbackHook for LoggingHook {
    fn interests(&self) -> Timings {
        self.interests
    }

    async fn on_start(&self, _ctx: &CallContext, info: &RunInfo, input: &Payload) {
        self.emit("OnStart", info, pretty(input));
    }

    async fn on_end(&self, _ctx: &CallContext, info: &RunInfo, output: &Payload) {
        self.emit("OnEnd", info, pretty(output));
    }

    async fn on_error(&self, _ctx: &CallContext, info: &RunInfo, error: &ExecutionError) {
        self.emit("OnError", info, error.to_string());
    }

    async fn on_end_with_stream_output(
        &self,
        _ctx: &CallContext,
        info: &RunInfo,
        output: StreamReader<Frame>,
    ) {
        let body = match output.collect().await {
            Ok(frames) => frames.iter().map(frame_text).collect::<String>(),
            Err(err) => format!("stream failed: {err}"),
        };
        self.emit("OnEndStream", info, body);
        self.streams_logged.add_permits(1);
    }
}

/// Registrations for the demos: every step's start, end and error, plus the top-level
/// streamed output only.
pub fn logging_registrations(sink: Sink) -> (Vec<HookRegistration>, Arc<LoggingHook>) {
    let events = LoggingHook::new(Arc::clone(&sink))
        .with_interests(Timings::from(Timing::Start) | Timing::End | Timing::Error);
    let streams = Arc::new(
        LoggingHook::new(sink).with_interests(Timing::EndWithStreamOutput.into()),
    );
    let registrations = vec![
        HookRegistration::new(events),
        HookRegistration::from_arc(Arc::clone(&streams) as Arc<dyn CallbackHook>)
            .filter(RunFilter::TopLevel),
    ];
    (registrations, streams)
}
