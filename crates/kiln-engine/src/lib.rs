//! # kiln-engine
//!
//! Boundary between the kiln runtime and a native inference engine.
//!
//! The engine itself (weights, KV cache, sampler) lives behind the
//! [`InferenceBackend`] trait and is not thread-safe. [`EngineHandle`] owns
//! the single backend instance and takes its mutex inside every method, so
//! no caller can reach the engine unlocked. A completion holds the lock for
//! its whole token loop through an [`EngineLease`].
//!
//! With the `testing` feature, `testing::ScriptedBackend` replays canned
//! text and is what the runtime's own tests drive.

#![deny(unsafe_code)]

pub mod backend;
pub mod bench;
pub mod chat;
pub mod completion;
pub mod handle;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{InferenceBackend, ModelInfo, Token, TokenOutput, TokenizeResult};
pub use bench::{BenchParams, BenchmarkReport};
pub use completion::{CompletionOutput, CompletionRequest, StopReason, tokens_per_second};
pub use handle::{EngineHandle, EngineLease};
