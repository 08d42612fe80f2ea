//! The engine façade and its shared state.
//!
//! [`CfVm`] is what the DAP front-end talks to. Internally one structure is
//! shared between the façade (DAP request threads), the event pump, and the
//! step finalizer; every container in it supports fine-grained concurrent
//! mutation and no lock is held across a wire round-trip.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{mpsc, Arc},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use cfdbg_jdwp::{
    EventModifier, JdwpClient, ReferenceTypeId, ThreadId, EVENT_KIND_CLASS_PREPARE,
    EVENT_KIND_CLASS_UNLOAD, EVENT_KIND_THREAD_DEATH, EVENT_KIND_THREAD_START,
    SUSPEND_POLICY_EVENT_THREAD, SUSPEND_POLICY_NONE,
};

use crate::breakpoints::{Breakpoint, BreakpointEngine, BreakpointsChangedEvent};
use crate::classes::ClassRegistry;
use crate::config::EngineConfig;
use crate::error::{fatal, EngineError, Result};
use crate::events;
use crate::ids::{CanonicalServerPath, DapBreakpointId, DwpThreadId, RawIdePath};
use crate::manager::{
    DebugEntity, DebugEntityKind, DebugFrame, DebugManager, EvalResult, NativeThread, WorkerBridge,
};
use crate::stepping::{self, FinalizeJob, SteppingStates};
use crate::threads::ThreadRegistry;
use crate::worker::{self, WorkerState};

pub type StepEventCallback = Arc<dyn Fn(DwpThreadId) + Send + Sync>;
pub type BreakpointEventCallback = Arc<dyn Fn(DwpThreadId, DapBreakpointId) + Send + Sync>;
pub type BreakpointsChangedCallback = Arc<dyn Fn(BreakpointsChangedEvent) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    step: RwLock<Option<StepEventCallback>>,
    breakpoint: RwLock<Option<BreakpointEventCallback>>,
    breakpoints_changed: RwLock<Option<BreakpointsChangedCallback>>,
}

pub(crate) struct VmShared {
    pub(crate) config: EngineConfig,
    pub(crate) jdwp: JdwpClient,
    pub(crate) manager: Arc<dyn DebugManager>,
    pub(crate) bridge: Arc<dyn WorkerBridge>,
    pub(crate) threads: ThreadRegistry,
    pub(crate) classes: ClassRegistry,
    pub(crate) breakpoints: BreakpointEngine,
    pub(crate) stepping: SteppingStates,
    pub(crate) worker: WorkerState,
    /// Threads observed suspended and not yet resumed by us.
    pub(crate) suspended: Mutex<HashSet<DwpThreadId>>,
    /// Request id of the name-filtered base-class prepare request, present
    /// only while the base page class has not loaded yet.
    pub(crate) base_class_one_shot: Mutex<Option<i32>>,
    base_class_signature: String,
    callbacks: Callbacks,
    finalizer_tx: Mutex<Option<mpsc::Sender<FinalizeJob>>>,
}

impl VmShared {
    pub(crate) fn base_class_signature(&self) -> &str {
        &self.base_class_signature
    }

    /// Installs subclass-filtered prepare tracking rooted at the (now
    /// loaded) base page class, plus unload tracking. Both requests are live
    /// immediately.
    pub(crate) fn boot_subclass_tracking(&self, base_class: ReferenceTypeId) {
        if let Err(err) = self.jdwp.event_request_set(
            EVENT_KIND_CLASS_PREPARE,
            SUSPEND_POLICY_EVENT_THREAD,
            vec![EventModifier::ClassOnly {
                class_id: base_class,
            }],
        ) {
            fatal(format_args!("couldn't install class prepare tracking: {err}"));
        }
        if let Err(err) =
            self.jdwp
                .event_request_set(EVENT_KIND_CLASS_UNLOAD, SUSPEND_POLICY_NONE, Vec::new())
        {
            fatal(format_args!("couldn't install class unload tracking: {err}"));
        }
    }

    /// Single resume paired with an event delivered under the event-thread
    /// suspend policy.
    pub(crate) fn resume_event_thread(&self, thread_ref: ThreadId) {
        match self.jdwp.thread_resume(thread_ref) {
            Ok(()) => {}
            Err(err) if err.is_object_collected() => {
                debug!(thread = thread_ref, "event thread collected before resume");
            }
            Err(err) => fatal(format_args!(
                "couldn't resume event thread {thread_ref}: {err}"
            )),
        }
    }

    /// Resumes the thread fully, sampling the suspend count exactly once.
    ///
    /// Re-sampling after each resume would race with breakpoints hit in the
    /// window after the final resume: the refreshed count would be nonzero
    /// again and the loop would silently resume straight past the hit.
    pub(crate) fn continue_thread_ref(&self, thread_ref: ThreadId) {
        self.suspended.lock().remove(&DwpThreadId(thread_ref));

        let suspend_count = match self.jdwp.thread_suspend_count(thread_ref) {
            Ok(count) => count,
            Err(err) if err.is_object_collected() => {
                self.threads.unregister(thread_ref);
                return;
            }
            Err(err) => fatal(format_args!(
                "couldn't read suspend count for thread {thread_ref}: {err}"
            )),
        };

        for _ in 0..suspend_count {
            match self.jdwp.thread_resume(thread_ref) {
                Ok(()) => {}
                Err(err) if err.is_object_collected() => {
                    self.threads.unregister(thread_ref);
                    return;
                }
                Err(err) => fatal(format_args!(
                    "couldn't resume thread {thread_ref}: {err}"
                )),
            }
        }
    }

    pub(crate) fn continue_by_id(&self, thread: DwpThreadId) {
        let thread_ref = self.threads.thread_ref_by_dwp_id_or_fail(thread);
        self.continue_thread_ref(thread_ref);
    }

    /// Queues a phase-2 job; false when the finalizer is gone (teardown).
    pub(crate) fn submit_finalize(&self, job: FinalizeJob) -> bool {
        match self.finalizer_tx.lock().as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    pub(crate) fn fire_step_event(&self, thread: DwpThreadId) {
        let cb = self.callbacks.step.read().clone();
        if let Some(cb) = cb {
            (*cb)(thread);
        }
    }

    pub(crate) fn fire_breakpoint_event(&self, thread: DwpThreadId, breakpoint: DapBreakpointId) {
        let cb = self.callbacks.breakpoint.read().clone();
        if let Some(cb) = cb {
            (*cb)(thread, breakpoint);
        }
    }

    pub(crate) fn fire_breakpoints_changed(&self, event: BreakpointsChangedEvent) {
        let cb = self.callbacks.breakpoints_changed.read().clone();
        if let Some(cb) = cb {
            (*cb)(event);
        }
    }

    /// Suspended threads whose native handle is still live, for dump-style
    /// operations that need any thread with a page context.
    fn suspended_native_threads(&self) -> Vec<Arc<NativeThread>> {
        let ids: Vec<DwpThreadId> = self.suspended.lock().iter().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.threads.thread_by_dwp_id(id))
            .collect()
    }
}

/// The VM-coupled debug engine façade.
///
/// All operations are safe to call from any thread. Callbacks fire on the
/// engine's event pump thread and must not re-enter blocking façade calls.
pub struct CfVm {
    shared: Arc<VmShared>,
}

impl CfVm {
    /// Attaches to the target VM's wire debug port and boots the engine:
    /// event pump, step finalizer, worker bootstrap, class tracking, thread
    /// tracking, and the manager's step hook, in that order.
    pub fn attach(
        addr: SocketAddr,
        config: EngineConfig,
        manager: Arc<dyn DebugManager>,
        bridge: Arc<dyn WorkerBridge>,
    ) -> Result<CfVm> {
        let (jdwp, events) = JdwpClient::connect(addr)?;

        let base_class_signature = EngineConfig::class_signature(&config.page_base_class);
        let shared = Arc::new(VmShared {
            config,
            jdwp,
            manager,
            bridge,
            threads: ThreadRegistry::default(),
            classes: ClassRegistry::default(),
            breakpoints: BreakpointEngine::default(),
            stepping: SteppingStates::default(),
            worker: WorkerState::default(),
            suspended: Mutex::new(HashSet::new()),
            base_class_one_shot: Mutex::new(None),
            base_class_signature,
            callbacks: Callbacks::default(),
            finalizer_tx: Mutex::new(None),
        });

        let (finalizer_tx, finalizer_rx) = mpsc::channel();
        *shared.finalizer_tx.lock() = Some(finalizer_tx);

        let pump_shared = shared.clone();
        std::thread::Builder::new()
            .name("cfdbg-event-pump".to_string())
            .spawn(move || events::run_event_pump(pump_shared, events))
            .map_err(cfdbg_jdwp::JdwpError::Io)?;

        let finalizer_shared = shared.clone();
        std::thread::Builder::new()
            .name("cfdbg-step-finalizer".to_string())
            .spawn(move || stepping::run_step_finalizer(finalizer_shared, finalizer_rx))
            .map_err(cfdbg_jdwp::JdwpError::Io)?;

        worker::boot_worker(&shared);
        Self::boot_class_tracking(&shared);
        Self::boot_thread_tracking(&shared);

        shared
            .manager
            .register_cf_step_handler(stepping::make_cf_step_handler(&shared));

        info!("attached to target vm");
        Ok(CfVm { shared })
    }

    fn boot_class_tracking(shared: &VmShared) {
        let refs = match shared.jdwp.classes_by_signature(shared.base_class_signature()) {
            Ok(refs) => refs,
            Err(err) => fatal(format_args!("couldn't look up base page class: {err}")),
        };
        match refs.len() {
            0 => {
                // Base class not loaded yet (the usual case at attach time):
                // a one-shot name-filtered prepare request catches it, and
                // its handler swaps in subclass tracking.
                let request_id = match shared.jdwp.event_request_set(
                    EVENT_KIND_CLASS_PREPARE,
                    SUSPEND_POLICY_EVENT_THREAD,
                    vec![EventModifier::ClassMatch {
                        pattern: shared.config.page_base_class.clone(),
                    }],
                ) {
                    Ok(request_id) => request_id,
                    Err(err) => fatal(format_args!(
                        "couldn't install base class prepare request: {err}"
                    )),
                };
                *shared.base_class_one_shot.lock() = Some(request_id);
            }
            1 => shared.boot_subclass_tracking(refs[0].type_id),
            n => fatal(format_args!(
                "expected 0 or 1 refs for class {}, but got {n}",
                shared.config.page_base_class
            )),
        }
    }

    fn boot_thread_tracking(shared: &VmShared) {
        // No suspension on thread lifecycle events: threads can be collected
        // before we ever touch them, and the handlers tolerate that.
        if let Err(err) =
            shared
                .jdwp
                .event_request_set(EVENT_KIND_THREAD_START, SUSPEND_POLICY_NONE, Vec::new())
        {
            fatal(format_args!("couldn't install thread start tracking: {err}"));
        }

        // Threads started before attach never produce a start event; list
        // and track them now.
        match shared.jdwp.all_threads() {
            Ok(threads) => {
                for thread_ref in threads {
                    worker::track_thread(shared, thread_ref);
                }
            }
            Err(err) => fatal(format_args!("couldn't list threads: {err}")),
        }

        if let Err(err) =
            shared
                .jdwp
                .event_request_set(EVENT_KIND_THREAD_DEATH, SUSPEND_POLICY_NONE, Vec::new())
        {
            fatal(format_args!("couldn't install thread death tracking: {err}"));
        }
    }

    /// Tears down the connection; the event pump and finalizer stop, and all
    /// registered wire requests are abandoned to the VM.
    pub fn shutdown(&self) {
        self.shared.finalizer_tx.lock().take();
        self.shared.jdwp.shutdown();
    }

    // ---- callbacks (each registered once by the front-end) ----

    pub fn register_step_event_callback(&self, cb: StepEventCallback) {
        *self.shared.callbacks.step.write() = Some(cb);
    }

    pub fn register_breakpoint_event_callback(&self, cb: BreakpointEventCallback) {
        *self.shared.callbacks.breakpoint.write() = Some(cb);
    }

    pub fn register_breakpoints_changed_callback(&self, cb: BreakpointsChangedCallback) {
        *self.shared.callbacks.breakpoints_changed.write() = Some(cb);
    }

    // ---- threads, stacks, variables ----

    /// Currently tracked threads with their names.
    pub fn thread_listing(&self) -> Vec<(DwpThreadId, String)> {
        let mut listing = Vec::new();
        for thread_ref in self.shared.threads.thread_refs() {
            let name = self
                .shared
                .jdwp
                .thread_name(thread_ref)
                .unwrap_or_else(|_| "thread".to_string());
            listing.push((DwpThreadId(thread_ref), name));
        }
        listing
    }

    pub fn stack_trace(&self, thread: DwpThreadId) -> Vec<DebugFrame> {
        let native = self.shared.threads.thread_by_dwp_id_or_fail(thread);
        self.shared.manager.get_cf_stack(&native)
    }

    pub fn scopes(&self, frame_id: u64) -> Vec<DebugEntity> {
        self.shared.manager.get_scopes_for_frame(frame_id)
    }

    pub fn variables(&self, id: i64) -> Vec<DebugEntity> {
        self.shared.manager.get_variables(id, None)
    }

    pub fn named_variables(&self, id: i64) -> Vec<DebugEntity> {
        self.shared.manager.get_variables(id, Some(DebugEntityKind::Named))
    }

    pub fn indexed_variables(&self, id: i64) -> Vec<DebugEntity> {
        self.shared
            .manager
            .get_variables(id, Some(DebugEntityKind::Indexed))
    }

    // ---- breakpoints ----

    /// Binds breakpoints for one source file, one result per input line in
    /// input order. Ids of lines that already have records are retained.
    ///
    /// When several classes are mapped to the path, the returned list is the
    /// last processed mapping's view; any mapping answers equivalently for
    /// bound/unbound state under the shared line table contract.
    pub fn bind_breakpoints(
        &self,
        ide_path: &RawIdePath,
        server_path: &CanonicalServerPath,
        lines: &[u32],
        exprs: &[Option<String>],
    ) -> Result<Vec<Breakpoint>> {
        if lines.len() != exprs.len() {
            return Err(EngineError::InvalidRequest(format!(
                "got {} lines but {} condition expressions",
                lines.len(),
                exprs.len()
            )));
        }
        let line_info = self
            .shared
            .breakpoints
            .line_records(ide_path, server_path, lines, exprs);
        Ok(self
            .shared
            .breakpoints
            .bind(&self.shared.jdwp, &self.shared.classes, server_path, &line_info))
    }

    pub fn clear_all_breakpoints(&self) {
        self.shared.breakpoints.clear_all_breakpoints(&self.shared.jdwp);
    }

    /// Diagnostic listing of every replayable record: (ide view, server
    /// view), each suffixed with line and bound state.
    pub fn breakpoint_detail(&self) -> Vec<(String, String)> {
        self.shared.breakpoints.breakpoint_detail()
    }

    /// Canonical source paths of every tracked class mirror.
    pub fn tracked_canonical_file_names(&self) -> Vec<String> {
        self.shared.classes.tracked_source_paths()
    }

    // ---- execution control ----

    pub fn continue_(&self, thread: DwpThreadId) {
        self.shared.continue_by_id(thread);
    }

    pub fn continue_all(&self) {
        // Snapshot first: resuming mutates the suspended set.
        let ids: Vec<DwpThreadId> = self.shared.suspended.lock().iter().copied().collect();
        for id in ids {
            self.shared.continue_by_id(id);
        }
    }

    pub fn step_in(&self, thread: DwpThreadId) {
        stepping::arm_step(&self.shared, thread, crate::manager::CfStepKind::StepIn);
    }

    pub fn step_over(&self, thread: DwpThreadId) {
        stepping::arm_step(&self.shared, thread, crate::manager::CfStepKind::StepOver);
    }

    pub fn step_out(&self, thread: DwpThreadId) {
        stepping::arm_step(&self.shared, thread, crate::manager::CfStepKind::StepOut);
    }

    // ---- evaluation and dumps ----

    pub fn evaluate(&self, frame_id: u64, expr: &str) -> Result<EvalResult> {
        self.shared
            .manager
            .evaluate(frame_id, expr)
            .map_err(EngineError::Evaluation)
    }

    pub fn dump(&self, variables_ref: i64) -> String {
        self.shared
            .manager
            .do_dump(&self.shared.suspended_native_threads(), variables_ref)
    }

    pub fn dump_as_json(&self, variables_ref: i64) -> String {
        self.shared
            .manager
            .do_dump_as_json(&self.shared.suspended_native_threads(), variables_ref)
    }

    pub fn get_source_path_for_variables_ref(&self, variables_ref: i64) -> String {
        self.shared
            .manager
            .get_source_path_for_variables_ref(variables_ref)
    }
}

impl Drop for CfVm {
    fn drop(&mut self) {
        self.shutdown();
    }
}
