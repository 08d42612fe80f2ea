//! Blocking JDWP wire client for the cfdbg debug engine.
//!
//! The engine drives the target VM over plain blocking sockets: one OS thread
//! owns the read side of the connection and correlates replies with pending
//! commands, while composite event packets are decoded into [`EventSet`]s and
//! queued for the engine's event pump. Only the slice of JDWP the engine
//! actually needs is implemented (threads, classes, line tables, event
//! requests, static method invocation); value inspection lives on the in-VM
//! agent side and is out of scope here.
//!
//! The [`mock`] module provides a small scriptable JDWP VM so the engine's
//! test suite can exercise breakpoint binding, stepping, and class lifecycle
//! handling without a real VM on the machine.

pub mod codec;
pub mod mock;
pub mod types;

mod client;

pub use client::{EventModifier, JdwpClient, JdwpClientConfig};
pub use types::{
    ClassInfo, EventSet, FrameInfo, JdwpError, JdwpEvent, JdwpIdSizes, JdwpValue, LineTable,
    LineTableEntry, Location, MethodId, MethodInfo, ObjectId, ReferenceTypeId, Result, ThreadId,
    ERROR_ABSENT_INFORMATION, ERROR_INVALID_OBJECT, EVENT_KIND_BREAKPOINT,
    EVENT_KIND_CLASS_PREPARE, EVENT_KIND_CLASS_UNLOAD, EVENT_KIND_SINGLE_STEP,
    EVENT_KIND_THREAD_DEATH, EVENT_KIND_THREAD_START, EVENT_KIND_VM_DEATH, EVENT_KIND_VM_START,
    INVOKE_SINGLE_THREADED, SUSPEND_POLICY_ALL, SUSPEND_POLICY_EVENT_THREAD, SUSPEND_POLICY_NONE,
};
