//! # kiln-context
//!
//! Context-window management for kiln conversations.
//!
//! Given a conversation's full message list and a token/message budget,
//! [`ContextManager`] returns a reduced list using one of the
//! [`RetentionStrategy`](kiln_settings::RetentionStrategy) policies:
//!
//! - **`KeepAll`**: no reduction
//! - **`SlidingWindow`**: most recent `maxMessages`
//! - **`SmartCompression`**: system prompt, compressed older turns, recent 20
//! - **`SummaryBased`**: system prompt, one summary message, recent 10
//! - **`TokenBased`**: system prompt if it fits, then newest-first until full
//!
//! Token counts come from [`TokenEstimator`], a length-based heuristic.

#![deny(unsafe_code)]

pub mod compression;
pub mod constants;
pub mod estimator;
pub mod manager;
pub mod types;

pub use estimator::TokenEstimator;
pub use manager::ContextManager;
pub use types::{ContextEvent, ContextStats, ContextUsage};
