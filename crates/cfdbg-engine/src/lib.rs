//! The VM-coupled debug engine for CF.
//!
//! CF pages compile to classes on a managed bytecode VM; this crate attaches
//! to that VM over its wire debug protocol and keeps a source-level view on
//! top of it:
//!
//! - live thread tracking with a worker-assisted mapping between wire thread
//!   references and native thread objects,
//! - class mirrors keyed by canonical source path, reacting to class
//!   prepare/unload,
//! - replayable source-line breakpoints that bind and rebind across dynamic
//!   class loading, with stable DAP ids per (path, line),
//! - step-in/over/out built from one-shot bytecode breakpoints instead of
//!   the VM's native (and slow) step facility,
//! - an event pump enforcing the suspension discipline.
//!
//! The DAP front-end drives the [`CfVm`] façade; the in-VM agent side is
//! reached through the [`DebugManager`] and [`WorkerBridge`] traits. Socket
//! framing, variable rendering, configuration loading, and IDE path mapping
//! all live outside this crate.

mod breakpoints;
mod classes;
mod config;
mod error;
mod events;
mod ids;
mod manager;
mod stepping;
mod threads;
mod vm;
mod worker;

pub use breakpoints::{Breakpoint, BreakpointsChangedEvent};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use ids::{CanonicalServerPath, DapBreakpointId, DwpThreadId, RawIdePath};
pub use manager::{
    CfStepHandler, CfStepKind, CfValueHandle, DebugEntity, DebugEntityKind, DebugFrame,
    DebugManager, EvalResult, NativeThread, WorkerBridge,
};
pub use vm::{BreakpointEventCallback, BreakpointsChangedCallback, CfVm, StepEventCallback};
