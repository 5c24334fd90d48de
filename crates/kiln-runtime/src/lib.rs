//! # kiln-runtime
//!
//! Sessions, the session registry and model lifecycle for the kiln inference
//! runtime.
//!
//! A [`KilnRuntime`] owns one [`TaskProcessor`](kiln_tasks::TaskProcessor),
//! one [`EngineHandle`](kiln_engine::EngineHandle) and one
//! [`ContextManager`](kiln_context::ContextManager). Sessions created through
//! its [`SessionRegistry`] keep their own history and generation settings and
//! submit generation work to the shared processor; the engine serializes the
//! actual inference.

#![deny(unsafe_code)]

pub mod model;
pub mod registry;
pub mod runtime;
pub mod session;

pub use model::{ModelEvent, ModelManager, ModelState};
pub use registry::{RegistryEvent, RegistryStatistics, SessionRegistry};
pub use runtime::KilnRuntime;
pub use session::types::{
    GenerationResult, IntegrityIssue, SessionEvent, SessionSnapshot, SessionState, SessionStats,
    SessionType,
};
pub use session::{GenerationHandlers, Session};
