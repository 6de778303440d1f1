//! Priority-ordered event dispatch with per-handler isolation.

pub mod dispatcher;
pub mod handler;
pub mod registry;

pub use dispatcher::{DispatcherConfig, DispatcherStats, EventDispatcher, FailedEvent};
pub use handler::{EventHandler, HandlerError, HandlerMetricsSnapshot, HandlerRegistration};
pub use registry::HandlerRegistry;
