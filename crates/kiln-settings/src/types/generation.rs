//! Sampling and stopping parameters for one generation.

use kiln_core::KilnError;
use serde::{Deserialize, Serialize};

/// Generation parameters applied to the engine before each completion.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationConfig {
    /// Token limit. `None` generates until a stop condition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    /// Sampler seed. `None` picks a random seed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    /// Softmax temperature.
    pub temperature: f32,
    /// Top-k cutoff (0 disables).
    pub top_k: u32,
    /// Nucleus sampling mass.
    pub top_p: f32,
    /// Minimum relative probability.
    pub min_p: f32,
    /// Locally typical sampling mass (1.0 disables).
    pub typical_p: f32,
    /// Window of recent tokens considered by the penalties.
    pub penalty_last_n: u32,
    /// Repetition penalty.
    pub penalty_repeat: f32,
    /// Frequency penalty.
    pub penalty_freq: f32,
    /// Presence penalty.
    pub penalty_present: f32,
    /// Mirostat mode (0 off, 1 or 2).
    pub mirostat: u8,
    /// Mirostat target entropy.
    pub mirostat_tau: f32,
    /// Mirostat learning rate.
    pub mirostat_eta: f32,
    /// Keep sampling past end-of-sequence.
    pub ignore_eos: bool,
    /// Literal substrings that end generation.
    pub stop_sequences: Vec<String>,
    /// Optional GBNF grammar constraining output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grammar: Option<String>,
    /// Number of token probabilities to report.
    pub n_probs: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: None,
            seed: None,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typical_p: 1.0,
            penalty_last_n: 64,
            penalty_repeat: 1.1,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            ignore_eos: false,
            stop_sequences: Vec::new(),
            grammar: None,
            n_probs: 0,
        }
    }
}

impl GenerationConfig {
    /// Short, fairly deterministic answers.
    pub fn fast() -> Self {
        Self {
            max_tokens: Some(256),
            temperature: 0.7,
            top_k: 20,
            top_p: 0.9,
            ..Self::default()
        }
    }

    /// Diverse, exploratory output for creative writing.
    pub fn creative() -> Self {
        Self {
            temperature: 1.0,
            top_k: 100,
            top_p: 0.98,
            min_p: 0.02,
            penalty_repeat: 1.05,
            ..Self::default()
        }
    }

    /// Focused output for factual answers.
    pub fn precise() -> Self {
        Self {
            temperature: 0.2,
            top_k: 10,
            top_p: 0.5,
            min_p: 0.1,
            penalty_repeat: 1.15,
            ..Self::default()
        }
    }

    /// Builder-style stop sequence setter.
    #[must_use]
    pub fn with_stop_sequences<I, S>(mut self, stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_sequences = stops.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style token limit setter.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Stop sequences with empty entries removed, in configured order.
    pub fn filtered_stop_sequences(&self) -> Vec<&str> {
        self.stop_sequences
            .iter()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Whether `text` contains any non-empty stop sequence.
    pub fn contains_stop_sequence(&self, text: &str) -> bool {
        self.detected_stop_sequence(text).is_some()
    }

    /// The first configured stop sequence (in list order) found in `text`.
    pub fn detected_stop_sequence(&self, text: &str) -> Option<&str> {
        self.filtered_stop_sequences()
            .into_iter()
            .find(|stop| text.contains(stop))
    }

    /// Check parameter ranges.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidArgument`] naming the first bad field.
    pub fn validate(&self) -> kiln_core::Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(KilnError::invalid_argument("temperature must be >= 0"));
        }
        for (name, value) in [
            ("topP", self.top_p),
            ("minP", self.min_p),
            ("typicalP", self.typical_p),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(KilnError::invalid_argument(format!(
                    "{name} must be within [0, 1]"
                )));
            }
        }
        if self.mirostat > 2 {
            return Err(KilnError::invalid_argument("mirostat must be 0, 1 or 2"));
        }
        if self.max_tokens == Some(0) {
            return Err(KilnError::invalid_argument("maxTokens must be positive"));
        }
        Ok(())
    }
}
