//! Activity processing module
//!
//! Handles:
//! - Schema registry (per-type descriptors, mirror metadata)
//! - Envelope normalization
//! - Dispatch state machine and hooks
//! - Per-type handlers

mod dispatcher;
mod handlers;
mod hooks;
mod normalize;
mod registry;

pub use dispatcher::{DispatchReport, DispatchStage, Dispatcher, activity_to_json};
pub use handlers::{HandlerOutcome, Handlers, SideEffect};
pub use hooks::HookSet;
pub use normalize::normalize;
pub use registry::{ActivityRegistry, ActivitySchema, FederationRule};
