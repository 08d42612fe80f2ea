//! The event pump: one thread draining composite event sets from the wire
//! client and routing each event to its handler.
//!
//! Handlers run on the pump thread and must never block on the DAP side;
//! every container they touch supports concurrent mutation, so façade calls
//! proceed in parallel. Event kinds outside the tracked set are an invariant
//! violation — a request we never made produced an event.

use std::sync::{mpsc, Arc};

use tracing::{debug, info};

use cfdbg_jdwp::{EventSet, JdwpEvent, Location, ReferenceTypeId, ThreadId, EVENT_KIND_CLASS_PREPARE};

use crate::classes::KlassMap;
use crate::error::fatal;
use crate::ids::DwpThreadId;
use crate::stepping::SteppingState;
use crate::vm::VmShared;
use crate::worker;

pub(crate) fn run_event_pump(shared: Arc<VmShared>, events: mpsc::Receiver<EventSet>) {
    for event_set in events.iter() {
        for event in event_set.events {
            match event {
                JdwpEvent::ThreadStart { thread, .. } => worker::track_thread(&shared, thread),
                JdwpEvent::ThreadDeath { thread, .. } => handle_thread_death(&shared, thread),
                JdwpEvent::ClassPrepare {
                    thread,
                    type_id,
                    signature,
                    ..
                } => handle_class_prepare(&shared, thread, type_id, &signature),
                JdwpEvent::ClassUnload { signature, .. } => {
                    handle_class_unload(&shared, &signature)
                }
                JdwpEvent::Breakpoint {
                    request_id,
                    thread,
                    location,
                } => handle_breakpoint(&shared, request_id, thread, location),
                JdwpEvent::VmStart { .. } => {
                    // Delivered once as part of the attach handshake.
                    debug!("vm start event");
                }
                JdwpEvent::VmDeath => {
                    info!("target vm exited; stopping event pump");
                    return;
                }
                JdwpEvent::Unknown { kind } => {
                    fatal(format_args!("unexpected wire event kind {kind}"))
                }
            }
        }
    }
    debug!("event pump stopped");
}

fn handle_thread_death(shared: &VmShared, thread: ThreadId) {
    shared.threads.unregister(thread);
    // Thread churn is when weak handles die; sweep the rest of the registry
    // while we are here.
    shared.threads.sweep();
}

fn handle_class_prepare(
    shared: &VmShared,
    event_thread: ThreadId,
    type_id: ReferenceTypeId,
    signature: &str,
) {
    if signature == shared.base_class_signature() {
        // One-shot bootstrap: the base page class itself just loaded. Swap
        // the name-filtered request for subclass tracking rooted at the now
        // known reference type.
        if let Some(request_id) = shared.base_class_one_shot.lock().take() {
            let _ = shared
                .jdwp
                .event_request_clear(EVENT_KIND_CLASS_PREPARE, request_id);
        }
        shared.boot_subclass_tracking(type_id);
        // The event held its thread suspended so no subclass prepares could
        // slip past before the tracking request exists; let it go now.
        shared.resume_event_thread(event_thread);
        return;
    }

    track_class_ref(shared, type_id, signature);
    // Suspended so breakpoints bind synchronously with the class load.
    shared.resume_event_thread(event_thread);
}

fn track_class_ref(shared: &VmShared, type_id: ReferenceTypeId, signature: &str) {
    match KlassMap::try_build(&shared.config, &shared.jdwp, type_id) {
        Ok(Some(klass)) => {
            let path = klass.source_path.clone();
            shared.classes.insert(klass);
            if shared.breakpoints.has_records_for(&path) {
                // Strictly after the registry update, so a listener looking
                // up the path sees the new mirror.
                if let Some(event) =
                    shared.breakpoints.rebind(&shared.jdwp, &shared.classes, &path)
                {
                    shared.fire_breakpoints_changed(event);
                }
            }
        }
        Ok(None) => {
            if !signature.contains(&shared.config.ephemeral_class_marker) {
                info!(signature, "class information could not be retrieved");
            }
        }
        Err(err) if err.is_object_collected() => {
            debug!(signature, "class collected during prepare handling");
        }
        Err(err) => fatal(format_args!(
            "building class mirror for {signature} failed: {err}"
        )),
    }
}

fn handle_class_unload(shared: &VmShared, signature: &str) {
    let affected = shared.classes.remove_by_signature(signature);
    for path in affected {
        // Records revert to unbound; the next prepare of this path rebinds
        // them under their existing ids.
        shared
            .breakpoints
            .detach_bound_for_path(&shared.jdwp, &path);
    }
}

fn handle_breakpoint(shared: &VmShared, request_id: i32, thread: ThreadId, location: Location) {
    // Worker initialization: happens once per process, before any user
    // breakpoint exists. The worker thread stays suspended forever.
    if shared.worker.is_worker_class(location.class_id) {
        shared.worker.acknowledge(thread);
        return;
    }

    let dwp_id = DwpThreadId(thread);
    shared.suspended.lock().insert(dwp_id);

    if shared
        .stepping
        .remove_if_eq(dwp_id, SteppingState::FinalizingViaAwaitedBreakpoint)
    {
        // The step-completion handler's breakpoint fired: the step is done.
        // The request carried a hit count of 1, so it has auto-expired.
        shared.fire_step_event(dwp_id);
        return;
    }

    // A user breakpoint beat the finalization breakpoint; cancel the step.
    if shared.stepping.remove_if_eq(dwp_id, SteppingState::Stepping) {
        let native = shared.threads.thread_by_dwp_id_or_fail(dwp_id);
        shared.manager.clear_step_request(&native);
    }

    let Some(meta) = shared.breakpoints.meta_for_request(request_id) else {
        // A request we already dropped (cleared mid-flight); nothing to
        // report, but the thread must not stay parked.
        debug!(request_id, thread = %dwp_id, "breakpoint hit for untracked request");
        shared.continue_by_id(dwp_id);
        return;
    };

    if let Some(expr) = &meta.expr {
        let native = shared.threads.thread_by_dwp_id_or_fail(dwp_id);
        if !shared
            .manager
            .evaluate_as_boolean_for_conditional_breakpoint(&native, expr)
        {
            // Condition not met: release the thread, surface nothing.
            shared.continue_by_id(dwp_id);
            return;
        }
    }

    shared.fire_breakpoint_event(dwp_id, meta.id);
}
