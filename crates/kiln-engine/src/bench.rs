//! Benchmark parameters and the parsed engine report.

use kiln_core::KilnError;
use serde::{Deserialize, Serialize};

/// Shape of a benchmark run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BenchParams {
    /// Prompt tokens processed per repetition.
    pub prompt_tokens: u32,
    /// Tokens generated per repetition.
    pub gen_tokens: u32,
    /// Parallel sequences.
    pub parallel: u32,
    /// Repetitions averaged over.
    pub repetitions: u32,
}

impl Default for BenchParams {
    fn default() -> Self {
        Self {
            prompt_tokens: 512,
            gen_tokens: 128,
            parallel: 1,
            repetitions: 3,
        }
    }
}

/// Parsed benchmark result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkReport {
    /// Model description reported by the engine.
    pub model_description: String,
    /// Weights size in bytes.
    pub model_size: u64,
    /// Parameter count.
    pub n_params: u64,
    /// Prompt processing speed, tokens/s.
    pub prompt_speed: f64,
    /// Standard deviation of the prompt speed.
    pub prompt_speed_std: f64,
    /// Generation speed, tokens/s.
    pub generation_speed: f64,
    /// Standard deviation of the generation speed.
    pub generation_speed_std: f64,
    /// Parameters the run used.
    pub params: BenchParams,
}

/// Wire order of the engine's benchmark array.
type RawReport = (String, u64, u64, f64, f64, f64, f64);

impl BenchmarkReport {
    /// Parse the engine's JSON array
    /// `[desc, size, n_params, pp_avg, pp_std, tg_avg, tg_std]`.
    ///
    /// # Errors
    ///
    /// [`KilnError::Backend`] for an empty or malformed array.
    pub fn parse(json: &str, params: BenchParams) -> kiln_core::Result<Self> {
        if json.trim() == "[]" {
            return Err(KilnError::Backend("benchmark produced no result".into()));
        }
        let (model_description, model_size, n_params, pp_avg, pp_std, tg_avg, tg_std): RawReport =
            serde_json::from_str(json)
                .map_err(|e| KilnError::Backend(format!("malformed benchmark output: {e}")))?;
        Ok(Self {
            model_description,
            model_size,
            n_params,
            prompt_speed: pp_avg,
            prompt_speed_std: pp_std,
            generation_speed: tg_avg,
            generation_speed_std: tg_std,
            params,
        })
    }

    /// Rough wall time of the whole run, in seconds.
    pub fn estimated_total_secs(&self) -> f64 {
        let per_rep = |tokens: u32, speed: f64| {
            if speed > 0.0 {
                f64::from(tokens) / speed
            } else {
                0.0
            }
        };
        let reps = f64::from(self.params.repetitions);
        reps * (per_rep(self.params.prompt_tokens, self.prompt_speed)
            + per_rep(self.params.gen_tokens, self.generation_speed))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
