//! User-visible stepping without the VM's native step facility.
//!
//! Native wire-protocol stepping drops the target VM into interpreted
//! execution, so a step is instead built from two phases: arm the debug
//! manager's dispatch-edge hook and resume (phase 1), then — on the manager's
//! callback — suspend the thread off-callback, find the topmost CF frame, and
//! plant a one-shot breakpoint right after the invoke that entered the
//! notification machinery (phase 2). The hit of that breakpoint is surfaced
//! as the step event.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc, Weak,
};

use dashmap::DashMap;
use tracing::{debug, trace};

use cfdbg_jdwp::{
    EventModifier, JdwpError, Location, ThreadId, EVENT_KIND_BREAKPOINT,
    SUSPEND_POLICY_EVENT_THREAD,
};

use crate::error::fatal;
use crate::ids::DwpThreadId;
use crate::manager::{CfStepHandler, CfStepKind};
use crate::vm::VmShared;

/// The invoke-interface instruction is five bytes; the finalization
/// breakpoint goes exactly one instruction past the call that left the CF
/// frame.
pub(crate) const SIZEOF_INSTR_INVOKE_INTERFACE: u64 = 5;

/// Where a thread is inside its step cycle. `Stepping` means the manager's
/// hook is armed; `FinalizingViaAwaitedBreakpoint` means the one-shot
/// breakpoint is planted and the next hit on this thread completes the step
/// rather than reporting a user breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SteppingState {
    Stepping,
    FinalizingViaAwaitedBreakpoint,
}

#[derive(Default)]
pub(crate) struct SteppingStates {
    map: DashMap<DwpThreadId, SteppingState>,
}

impl SteppingStates {
    pub(crate) fn contains(&self, thread: DwpThreadId) -> bool {
        self.map.contains_key(&thread)
    }

    pub(crate) fn insert(&self, thread: DwpThreadId, state: SteppingState) {
        self.map.insert(thread, state);
    }

    /// Atomic compare-and-remove; the transitions of a step cycle hinge on
    /// exactly one contender winning this.
    pub(crate) fn remove_if_eq(&self, thread: DwpThreadId, state: SteppingState) -> bool {
        self.map.remove_if(&thread, |_, s| *s == state).is_some()
    }

    #[cfg(test)]
    pub(crate) fn state_of(&self, thread: DwpThreadId) -> Option<SteppingState> {
        self.map.get(&thread).map(|s| *s)
    }
}

/// Phase-2 work order handed to the finalizer executor.
pub(crate) struct FinalizeJob {
    pub(crate) thread_ref: ThreadId,
    pub(crate) dwp_id: DwpThreadId,
    pub(crate) min_frame_offset: usize,
    pub(crate) done: Arc<AtomicBool>,
}

/// Phase 1. Records `stepping` state, arms the manager hook, and resumes the
/// thread. A second step request while a cycle is in flight is a no-op.
pub(crate) fn arm_step(shared: &VmShared, thread: DwpThreadId, kind: CfStepKind) {
    if shared.stepping.contains(thread) {
        return;
    }
    shared.stepping.insert(thread, SteppingState::Stepping);

    let native = shared.threads.thread_by_dwp_id_or_fail(thread);
    let thread_ref = shared.threads.thread_ref_by_native_or_fail(&native);

    let suspend_count = match shared.jdwp.thread_suspend_count(thread_ref) {
        Ok(count) => count,
        Err(err) => fatal(format_args!(
            "couldn't read suspend count for thread {thread}: {err}"
        )),
    };
    if suspend_count == 0 {
        fatal(format_args!(
            "step handler expected thread {thread} to already be suspended, but suspendCount was 0"
        ));
    }

    trace!(%thread, ?kind, "arming step");
    shared.manager.register_step_request(&native, kind);
    shared.continue_thread_ref(thread_ref);
}

/// Builds the callback handed to the debug manager.
///
/// The manager invokes it on the stepping thread itself, which cannot
/// suspend itself over the wire — so the suspend-and-plant work is queued to
/// the single-consumer finalizer and the callback spins until phase 2 has
/// signalled. The spin is short: nearly all of the wait happens while this
/// thread is suspended by the finalizer.
pub(crate) fn make_cf_step_handler(shared: &Arc<VmShared>) -> CfStepHandler {
    let weak: Weak<VmShared> = Arc::downgrade(shared);
    Arc::new(move |native, min_frame_offset| {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let thread_ref = shared.threads.thread_ref_by_native_or_fail(&native);
        let done = Arc::new(AtomicBool::new(false));
        if !shared.submit_finalize(FinalizeJob {
            thread_ref,
            dwp_id: DwpThreadId(thread_ref),
            min_frame_offset,
            done: done.clone(),
        }) {
            // Engine is tearing down; don't wedge the target thread.
            return;
        }
        while !done.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
    })
}

/// Finalizer executor loop: the only actor permitted to issue suspends
/// during phase 2.
pub(crate) fn run_step_finalizer(shared: Arc<VmShared>, jobs: mpsc::Receiver<FinalizeJob>) {
    for job in jobs.iter() {
        if let Err(err) = finalize_step(&shared, &job) {
            fatal(format_args!(
                "step finalization for thread {} failed: {err}",
                job.dwp_id
            ));
        }
    }
    debug!("step finalizer stopped");
}

/// Phase 2. Suspends the thread, walks frames from `min_frame_offset` until
/// the step-notification entry frame, and plants a thread-filtered one-shot
/// breakpoint one instruction past the CF frame's current position.
fn finalize_step(shared: &VmShared, job: &FinalizeJob) -> Result<(), JdwpError> {
    shared.jdwp.thread_suspend(job.thread_ref)?;

    // The exact number of notification frames above the CF frames is not
    // knowable (the target may or may not have entered the wait primitive
    // before being suspended), so scan downward from the supplied minimum.
    // The entry frame is found within a frame or two; walking off the end of
    // the stack means the contract with the manager is broken.
    let mut index = job.min_frame_offset;
    loop {
        let frames = shared.jdwp.thread_frames(job.thread_ref, index as i32, 1)?;
        let Some(frame) = frames.first() else {
            fatal(format_args!(
                "no step-notification entry frame on thread {}",
                job.dwp_id
            ));
        };

        let name = shared
            .classes
            .method_name(&shared.jdwp, frame.location.class_id, frame.location.method_id)?
            .unwrap_or_default();
        if !shared.manager.is_step_notification_entry(&name) {
            index += 1;
            continue;
        }

        // The frame below the entry frame is the topmost CF frame, parked on
        // the invoke that got us here.
        let below = shared
            .jdwp
            .thread_frames(job.thread_ref, (index + 1) as i32, 1)?;
        let Some(cf_frame) = below.first() else {
            fatal(format_args!(
                "step-notification entry frame has no CF frame below it on thread {}",
                job.dwp_id
            ));
        };

        let location = Location {
            index: cf_frame.location.index + SIZEOF_INSTR_INVOKE_INTERFACE,
            ..cf_frame.location
        };
        shared.jdwp.event_request_set(
            EVENT_KIND_BREAKPOINT,
            SUSPEND_POLICY_EVENT_THREAD,
            vec![
                EventModifier::ThreadOnly {
                    thread: job.thread_ref,
                },
                EventModifier::Count { count: 1 },
                EventModifier::LocationOnly { location },
            ],
        )?;

        shared
            .stepping
            .insert(job.dwp_id, SteppingState::FinalizingViaAwaitedBreakpoint);

        // Signal before resuming: the waiting caller is the thread we are
        // about to resume, so it cannot observe the gap, and this order
        // cannot lose the wakeup.
        job.done.store(true, Ordering::Release);
        shared.continue_thread_ref(job.thread_ref);
        return Ok(());
    }
}
