//! Shared domain types for the Warren runtime: the common error type,
//! configuration model, cancellation tokens, and the invoker/tool contracts
//! every other crate builds against.

pub mod cancel;
pub mod config;
pub mod error;
pub mod invoker;
pub mod tool;
pub mod trace;

pub use cancel::{CancelMap, CancelToken};
pub use error::{Error, Result};
pub use invoker::{
    AgentInvoker, FinishedReason, InvocationMetrics, InvokeOutcome, InvokeRequest, InvokerFactory,
};
pub use tool::{ToolCatalog, ToolDefinition};
pub use trace::TraceEvent;
