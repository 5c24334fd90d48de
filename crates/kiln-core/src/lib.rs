//! # kiln-core
//!
//! Foundation types, errors, branded IDs, and logging for the kiln inference runtime.
//!
//! This crate provides the shared vocabulary that all other kiln crates depend on:
//!
//! - **Branded IDs**: `TaskId`, `SessionId` as newtypes for type safety
//! - **Messages**: `Message` with `System`, `User`, `Assistant`, `Tool` roles
//! - **Errors**: `KilnError` taxonomy via `thiserror`, with stable numeric codes
//! - **Events**: `EventEmitter<E>`, a non-blocking broadcast fan-out for observers
//! - **Logging**: `tracing` subscriber bootstrap and test capture helpers

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod messages;

pub use errors::{KilnError, Result};
pub use events::EventEmitter;
pub use ids::{SessionId, TaskId};
pub use messages::{Message, Role, ToolSpec};
