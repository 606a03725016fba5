use std::time::Duration;

use hookline_core::{
    ConstructionError, Flow, Frame, HookRegistration, NodeSpec, Pipeline, RunOptions,
};

/// Single scalar node returning its input.
pub fn echo_pipeline(hooks: Vec<HookRegistration>) -> Result<Pipeline, ConstructionError> {
    hooks
        .into_iter()
        .fold(Pipeline::builder("echo_pipeline"), |b, h| b.hook(h))
        .node(NodeSpec::lambda("echo", |_ctx, input: Flow| async move {
            input.into_payload().await
        }))
        .compile()
}

/// Streams the input text back one word per frame, pausing `delay` between words.
pub fn words_pipeline(
    hooks: Vec<HookRegistration>,
    delay: Duration,
) -> Result<Pipeline, ConstructionError> {
    hooks
        .into_iter()
        .fold(Pipeline::builder("words_pipeline"), |b, h| b.hook(h))
        .node(NodeSpec::stream_lambda("split_words", move |ctx, input: Flow| async move {
            let text = input.into_payload().await?;
            let words: Vec<String> = text
                .as_text()
                .unwrap_or_default()
                .split_whitespace()
                .map(String::from)
                .collect();
            let (tx, rx) = ctx.pipe::<Frame>();
            tokio::spawn(async move {
                for (idx, word) in words.into_iter().enumerate() {
                    if tx.send(Frame::text(word).with_index(idx as u64)).is_err() {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                }
            });
            Ok(rx)
        }))
        .options(RunOptions {
            timeout: Some(Duration::from_secs(30)),
        })
        .compile()
}
