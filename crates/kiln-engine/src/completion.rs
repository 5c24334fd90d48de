//! The token loop.
//!
//! One completion runs entirely under a single [`EngineLease`]: sampling is
//! configured, the prompt evaluated, then tokens are pulled one at a time
//! until the engine runs dry, the token budget is spent, a stop sequence
//! appears, or the caller asks to stop.

use std::time::{Duration, Instant};

use kiln_core::KilnError;
use kiln_settings::GenerationConfig;
use serde::Serialize;
use tracing::debug;

use crate::handle::EngineLease;

/// Why the token loop ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "reason", content = "sequence")]
pub enum StopReason {
    /// The engine reported no further tokens.
    Exhausted,
    /// `max_tokens` was reached.
    MaxTokens,
    /// Generated text contained this stop sequence.
    StopSequence(String),
    /// [`EngineHandle::interrupt`](crate::EngineHandle::interrupt) was called.
    Interrupted,
    /// The caller's cancellation check returned true.
    Cancelled,
}

/// Input to one completion.
#[derive(Clone, Copy, Debug)]
pub struct CompletionRequest<'a> {
    /// Fully rendered prompt.
    pub prompt: &'a str,
    /// Media interleaved into the prompt.
    pub media_paths: &'a [String],
    /// Sampling parameters and stop conditions.
    pub config: &'a GenerationConfig,
}

/// What the token loop produced.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionOutput {
    /// Generated text, cut before any stop sequence.
    pub text: String,
    /// Tokens sampled.
    pub tokens_generated: usize,
    /// Tokens in the evaluated prompt.
    pub prompt_tokens: usize,
    /// Wall time of the loop including prompt evaluation.
    pub elapsed: Duration,
    /// Why the loop ended.
    pub stop_reason: StopReason,
}

impl EngineLease<'_> {
    /// Run one completion.
    ///
    /// `is_cancelled` is polled before every token. `on_piece` receives each
    /// new increment of text that precedes any stop sequence.
    pub fn complete<C, P>(
        &mut self,
        request: CompletionRequest<'_>,
        is_cancelled: C,
        mut on_piece: P,
    ) -> kiln_core::Result<CompletionOutput>
    where
        C: Fn() -> bool,
        P: FnMut(&str),
    {
        let started = Instant::now();
        let config = request.config;
        config.validate()?;

        self.handle.clear_interrupt();
        self.set_sampling(config);
        if !self.init_sampling() {
            return Err(KilnError::GenerationFailed(
                "failed to initialize sampling".into(),
            ));
        }
        self.rewind();
        let prompt_tokens = self.load_prompt(request.prompt, request.media_paths)?;
        self.begin_completion();

        let looped = self.pull_tokens(config, &is_cancelled, &mut on_piece);
        self.end_completion();
        let (text, tokens_generated, stop_reason) = looped?;

        debug!(
            tokens = tokens_generated,
            prompt_tokens,
            reason = ?stop_reason,
            "completion finished"
        );
        Ok(CompletionOutput {
            text,
            tokens_generated,
            prompt_tokens,
            elapsed: started.elapsed(),
            stop_reason,
        })
    }

    fn pull_tokens(
        &mut self,
        config: &GenerationConfig,
        is_cancelled: &dyn Fn() -> bool,
        on_piece: &mut dyn FnMut(&str),
    ) -> kiln_core::Result<(String, usize, StopReason)> {
        let mut text = String::new();
        let mut generated = 0usize;
        let reason = loop {
            if !self.has_next_token() {
                break StopReason::Exhausted;
            }
            if self.handle.is_interrupted() {
                break StopReason::Interrupted;
            }
            if is_cancelled() {
                break StopReason::Cancelled;
            }
            if config.max_tokens.is_some_and(|max| generated >= max) {
                break StopReason::MaxTokens;
            }

            let output = self.do_completion()?;
            generated += 1;
            let before = text.len();
            text.push_str(&output.text);

            if let Some(stop) = config.detected_stop_sequence(&text) {
                let stop = stop.to_owned();
                let cut = text.find(&stop).unwrap_or(text.len());
                if cut > before {
                    on_piece(&text[before..cut]);
                }
                text.truncate(cut);
                break StopReason::StopSequence(stop);
            }
            if text.len() > before {
                on_piece(&text[before..]);
            }
        };
        Ok((text, generated, reason))
    }
}

/// Tokens per second over `elapsed`, zero for an empty interval.
#[allow(clippy::cast_precision_loss)]
pub fn tokens_per_second(tokens: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { tokens as f64 / secs } else { 0.0 }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineHandle;
    use crate::testing::ScriptedBackend;
    use assert_matches::assert_matches;
    use kiln_settings::ModelConfig;

    fn engine(backend: ScriptedBackend) -> EngineHandle {
        let engine = EngineHandle::new(Box::new(backend));
        engine
            .load_model(&ModelConfig::with_model_path("/models/test.gguf"))
            .unwrap();
        engine
    }

    fn run(
        engine: &EngineHandle,
        config: &GenerationConfig,
    ) -> (kiln_core::Result<CompletionOutput>, Vec<String>) {
        let mut pieces = Vec::new();
        let output = engine.lease().unwrap().complete(
            CompletionRequest {
                prompt: "hello there",
                media_paths: &[],
                config,
            },
            || false,
            |piece| pieces.push(piece.to_owned()),
        );
        (output, pieces)
    }

    #[test]
    fn runs_until_exhausted() {
        let engine = engine(ScriptedBackend::new(["Hel", "lo", " world"]));
        let (output, pieces) = run(&engine, &GenerationConfig::default());
        let output = output.unwrap();
        assert_eq!(output.text, "Hello world");
        assert_eq!(output.tokens_generated, 3);
        assert_eq!(output.prompt_tokens, 2);
        assert_eq!(output.stop_reason, StopReason::Exhausted);
        assert_eq!(pieces, ["Hel", "lo", " world"]);
    }

    #[test]
    fn honours_max_tokens() {
        let engine = engine(ScriptedBackend::new(["a", "b", "c", "d"]));
        let config = GenerationConfig::default().with_max_tokens(2);
        let output = run(&engine, &config).0.unwrap();
        assert_eq!(output.text, "ab");
        assert_eq!(output.stop_reason, StopReason::MaxTokens);
    }

    #[test]
    fn stop_sequence_cuts_text_and_stream() {
        let engine = engine(ScriptedBackend::new(["Hello", " there\n", "\nMore", " text"]));
        let config = GenerationConfig::default().with_stop_sequences(["\n\n", "Human:"]);
        let (output, pieces) = run(&engine, &config);
        let output = output.unwrap();
        assert_eq!(output.text, "Hello there");
        assert_eq!(output.tokens_generated, 3);
        assert_eq!(output.stop_reason, StopReason::StopSequence("\n\n".into()));
        assert_eq!(pieces, ["Hello", " there\n"]);
    }

    #[test]
    fn stop_inside_one_piece_delivers_prefix() {
        let engine = engine(ScriptedBackend::new(["Sure. Human: next"]));
        let config = GenerationConfig::default().with_stop_sequences(["Human:"]);
        let (output, pieces) = run(&engine, &config);
        assert_eq!(output.unwrap().text, "Sure. ");
        assert_eq!(pieces, ["Sure. "]);
    }

    #[test]
    fn empty_stop_sequences_are_ignored() {
        let engine = engine(ScriptedBackend::new(["a", "b"]));
        let config = GenerationConfig::default().with_stop_sequences([""]);
        let output = run(&engine, &config).0.unwrap();
        assert_eq!(output.text, "ab");
        assert_eq!(output.stop_reason, StopReason::Exhausted);
    }

    #[test]
    fn cancellation_stops_at_token_boundary() {
        let engine = engine(ScriptedBackend::new(["a", "b", "c"]));
        let config = GenerationConfig::default();
        let mut seen = 0;
        let output = engine
            .lease()
            .unwrap()
            .complete(
                CompletionRequest {
                    prompt: "p",
                    media_paths: &[],
                    config: &config,
                },
                || false,
                |_| seen += 1,
            )
            .unwrap();
        assert_eq!(seen, 3);
        assert_eq!(output.stop_reason, StopReason::Exhausted);

        let cancelled = engine
            .lease()
            .unwrap()
            .complete(
                CompletionRequest {
                    prompt: "p",
                    media_paths: &[],
                    config: &config,
                },
                || true,
                |_| {},
            )
            .unwrap();
        assert_eq!(cancelled.text, "");
        assert_eq!(cancelled.stop_reason, StopReason::Cancelled);
    }

    #[test]
    fn interrupt_before_lease_is_cleared() {
        let engine = engine(ScriptedBackend::new(["a"]));
        engine.interrupt();
        let output = run(&engine, &GenerationConfig::default()).0.unwrap();
        assert_eq!(output.stop_reason, StopReason::Exhausted);
    }

    #[test]
    fn engine_failure_propagates_and_ends_completion() {
        let backend = ScriptedBackend::new(["a", "b"]).failing_at(1);
        let script_log = backend.script_log();
        let engine = engine(backend);
        let err = run(&engine, &GenerationConfig::default()).0.unwrap_err();
        assert_matches!(err, KilnError::GenerationFailed(_));
        assert_eq!(script_log.active(), 0);
    }

    #[test]
    fn invalid_config_is_rejected_before_engine_use() {
        let backend = ScriptedBackend::new(["a"]);
        let script_log = backend.script_log();
        let engine = engine(backend);
        let config = GenerationConfig {
            temperature: -1.0,
            ..GenerationConfig::default()
        };
        assert_matches!(
            run(&engine, &config).0,
            Err(KilnError::InvalidArgument(_))
        );
        assert_eq!(script_log.completions(), 0);
    }

    #[test]
    fn media_without_projector_fails() {
        let engine = engine(ScriptedBackend::new(["a"]));
        let config = GenerationConfig::default();
        let media = vec!["/tmp/cat.png".to_owned()];
        let err = engine
            .lease()
            .unwrap()
            .complete(
                CompletionRequest {
                    prompt: "describe",
                    media_paths: &media,
                    config: &config,
                },
                || false,
                |_| {},
            )
            .unwrap_err();
        assert_eq!(err, KilnError::MultimodalNotEnabled);
    }

    #[test]
    fn sampling_config_reaches_backend() {
        let backend = ScriptedBackend::new(["a"]);
        let script_log = backend.script_log();
        let engine = engine(backend);
        let config = GenerationConfig::precise();
        let _ = run(&engine, &config).0.unwrap();
        assert_eq!(script_log.last_config(), Some(config));
        assert_eq!(script_log.prompts(), ["hello there"]);
    }

    #[test]
    fn tokens_per_second_handles_zero_interval() {
        assert!(tokens_per_second(10, Duration::ZERO).abs() < f64::EPSILON);
        assert!((tokens_per_second(10, Duration::from_secs(2)) - 5.0).abs() < 1e-9);
    }
}
