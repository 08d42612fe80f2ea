//! Capability seams to the in-VM agent side.
//!
//! The engine never renders CF values or walks CF scopes itself; the injected
//! agent's debug manager does, and the engine reaches it through
//! [`DebugManager`]. Likewise the worker helper's thread buffer is only
//! reachable in-process, behind [`WorkerBridge`]. Both traits are narrow on
//! purpose — tests script them, and the production bridge can grow without
//! touching engine call sites.

use std::sync::Arc;

use serde::Serialize;

/// Handle to a live thread object inside the target VM, as owned by the
/// in-process agent side. The engine's thread registry holds these weakly:
/// when the agent drops the thread (it died and was collected), registry
/// entries referencing it go stale and are pruned.
#[derive(Debug)]
pub struct NativeThread {
    /// Key the worker's static method buffered this thread under.
    pub buffer_key: i64,
    /// The thread's object id in the wire protocol's id space.
    pub object_id: u64,
}

/// Step granularity requested by the user, interpreted by the debug manager
/// at CF dispatch edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfStepKind {
    StepIn,
    StepOver,
    StepOut,
}

/// Variable-listing filter for paged DAP `variables` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugEntityKind {
    Named,
    Indexed,
}

/// One CF-level stack frame as rendered by the debug manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugFrame {
    pub id: u64,
    pub name: String,
    pub source_path: String,
    pub line: u32,
}

/// A scope or variable rendered by the debug manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugEntity {
    pub name: String,
    pub value: String,
    /// Nonzero when the entity has children the client may expand.
    pub variables_reference: i64,
    pub named_variables: u32,
    pub indexed_variables: u32,
}

/// A structured evaluation result that stays expandable on the client side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CfValueHandle {
    pub variables_reference: i64,
    pub summary: String,
}

/// Successful result of [`DebugManager::evaluate`]: either a live value
/// handle or a plain textual rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalResult {
    Value(CfValueHandle),
    Textual(String),
}

/// Callback the engine registers with the debug manager; invoked on the
/// stepping thread itself once execution reaches the next CF dispatch edge
/// matching the armed step kind. `min_frame_offset` is the number of frames
/// the notification machinery is known to have pushed above the CF frames.
pub type CfStepHandler = Arc<dyn Fn(Arc<NativeThread>, usize) + Send + Sync>;

/// The variable-inspection and step-arming subsystem inside the target VM.
pub trait DebugManager: Send + Sync {
    fn get_cf_stack(&self, thread: &Arc<NativeThread>) -> Vec<DebugFrame>;

    fn get_scopes_for_frame(&self, frame_id: u64) -> Vec<DebugEntity>;

    fn get_variables(&self, id: i64, kind: Option<DebugEntityKind>) -> Vec<DebugEntity>;

    fn register_cf_step_handler(&self, handler: CfStepHandler);

    fn register_step_request(&self, thread: &Arc<NativeThread>, kind: CfStepKind);

    fn clear_step_request(&self, thread: &Arc<NativeThread>);

    /// Evaluates a conditional-breakpoint expression in the context of the
    /// thread's topmost CF frame. Falsy means the hit is suppressed.
    fn evaluate_as_boolean_for_conditional_breakpoint(
        &self,
        thread: &Arc<NativeThread>,
        expr: &str,
    ) -> bool;

    /// True when `method_name` is the step-notification entry function — the
    /// frame the stepping engine scans for during finalization. The CF frame
    /// immediately below it is the topmost user frame.
    fn is_step_notification_entry(&self, method_name: &str) -> bool;

    fn do_dump(&self, suspended_threads: &[Arc<NativeThread>], variables_ref: i64) -> String;

    fn do_dump_as_json(&self, suspended_threads: &[Arc<NativeThread>], variables_ref: i64)
        -> String;

    fn get_source_path_for_variables_ref(&self, variables_ref: i64) -> String;

    fn evaluate(&self, frame_id: u64, expr: &str) -> std::result::Result<EvalResult, String>;
}

/// In-process side of the worker bootstrap (spec'd by the agent injection):
/// spawning the parked helper thread and draining the numbered buffer its
/// static method writes thread objects into.
pub trait WorkerBridge: Send + Sync {
    /// Asks the agent to start the helper thread, which immediately enters
    /// the park method and trips the engine's bootstrap breakpoint.
    fn spawn_worker_thread(&self);

    /// Removes and returns the thread buffered under `key` by a
    /// `bufferThreadForDebugger` invocation.
    fn take_thread(&self, key: i64) -> Option<Arc<NativeThread>>;
}
