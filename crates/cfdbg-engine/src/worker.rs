//! Worker bootstrap: a perpetually suspended thread inside the target VM.
//!
//! The wire protocol has no inverse of "native thread → wire reference", so
//! the engine parks a helper thread on a breakpoint at the single return
//! instruction of a no-op method and keeps it suspended for the life of the
//! process. Translating a wire reference back to the native thread object is
//! then a synchronous static-method invocation on that parked thread: the
//! helper buffers the passed thread object under a fresh key, and the
//! in-process bridge hands the object out by key.

use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Instant,
};

use parking_lot::Mutex;
use tracing::{debug, trace};

use cfdbg_jdwp::{
    EventModifier, JdwpValue, Location, ReferenceTypeId, ThreadId, EVENT_KIND_BREAKPOINT,
    INVOKE_SINGLE_THREADED, SUSPEND_POLICY_EVENT_THREAD,
};

use crate::config::EngineConfig;
use crate::error::fatal;
use crate::vm::VmShared;

#[derive(Default)]
pub(crate) struct WorkerState {
    /// Zero until bootstrap resolves the helper class.
    class_id: AtomicU64,
    get_thread_method: AtomicU64,
    thread_ref: Mutex<Option<ThreadId>>,
    ack: AtomicBool,
}

impl WorkerState {
    pub(crate) fn is_worker_class(&self, class_id: ReferenceTypeId) -> bool {
        let id = self.class_id.load(Ordering::Acquire);
        id != 0 && id == class_id
    }

    /// Called by the breakpoint handler when the helper thread arrives at
    /// its parking breakpoint. The thread stays suspended.
    pub(crate) fn acknowledge(&self, thread_ref: ThreadId) {
        *self.thread_ref.lock() = Some(thread_ref);
        self.ack.store(true, Ordering::Release);
        debug!(thread = thread_ref, "worker thread parked");
    }

    fn thread_ref_or_fail(&self) -> ThreadId {
        match *self.thread_ref.lock() {
            Some(thread_ref) => thread_ref,
            None => fatal("worker thread used before bootstrap completed"),
        }
    }
}

/// Establishes the worker context. Runs exactly once, before class and
/// thread tracking; the event pump must already be running since it delivers
/// the acknowledgement.
pub(crate) fn boot_worker(shared: &VmShared) {
    let config = &shared.config;
    let signature = EngineConfig::class_signature(&config.worker_class);
    let refs = match shared.jdwp.classes_by_signature(&signature) {
        Ok(refs) => refs,
        Err(err) => fatal(format_args!("couldn't look up worker class: {err}")),
    };
    if refs.len() != 1 {
        fatal(format_args!(
            "expected 1 ref for class {} but got {}",
            config.worker_class,
            refs.len()
        ));
    }
    let type_id = refs[0].type_id;

    let methods = match shared.jdwp.reference_type_methods(type_id) {
        Ok(methods) => methods,
        Err(err) => fatal(format_args!("couldn't list worker class methods: {err}")),
    };
    let park = methods
        .iter()
        .find(|m| m.name == config.worker_park_method)
        .unwrap_or_else(|| {
            fatal(format_args!(
                "couldn't find helper method '{}'",
                config.worker_park_method
            ))
        });
    let get_thread = methods
        .iter()
        .find(|m| m.name == config.worker_get_thread_method)
        .unwrap_or_else(|| {
            fatal(format_args!(
                "couldn't find helper method '{}'",
                config.worker_get_thread_method
            ))
        });

    shared.worker.class_id.store(type_id, Ordering::Release);
    shared
        .worker
        .get_thread_method
        .store(get_thread.method_id, Ordering::Release);

    // Park breakpoint on the method's single return instruction. Exactly one
    // thread will ever arrive here, so the request expires with its hit.
    let location = Location {
        type_tag: 1,
        class_id: type_id,
        method_id: park.method_id,
        index: 0,
    };
    if let Err(err) = shared.jdwp.event_request_set(
        EVENT_KIND_BREAKPOINT,
        SUSPEND_POLICY_EVENT_THREAD,
        vec![
            EventModifier::Count { count: 1 },
            EventModifier::LocationOnly { location },
        ],
    ) {
        fatal(format_args!("couldn't install worker park breakpoint: {err}"));
    }

    // The agent spawns the helper thread, which immediately trips the
    // breakpoint; the event handler captures its reference and acknowledges.
    shared.bridge.spawn_worker_thread();

    let deadline = Instant::now() + config.worker_ack_timeout;
    while !shared.worker.ack.load(Ordering::Acquire) {
        if Instant::now() > deadline {
            fatal("worker thread never reached its parking breakpoint");
        }
        std::hint::spin_loop();
    }
}

/// Resolves the native thread behind `thread_ref` through the worker and
/// registers the pair. Must not block the event pump beyond the synchronous
/// invocation itself.
pub(crate) fn track_thread(shared: &VmShared, thread_ref: ThreadId) {
    let class_id = shared.worker.class_id.load(Ordering::Acquire);
    let method_id = shared.worker.get_thread_method.load(Ordering::Acquire);
    let worker_thread = shared.worker.thread_ref_or_fail();

    match shared.jdwp.class_invoke_method(
        class_id,
        worker_thread,
        method_id,
        &[JdwpValue::thread(thread_ref)],
        INVOKE_SINGLE_THREADED,
    ) {
        Ok((value, exception)) => {
            if exception != 0 {
                fatal(format_args!(
                    "worker get-thread helper threw while buffering thread {thread_ref}"
                ));
            }
            let Some(key) = value.as_long() else {
                fatal(format_args!(
                    "worker get-thread helper returned a non-long: {value:?}"
                ));
            };
            let Some(native) = shared.bridge.take_thread(key) else {
                fatal(format_args!("thread buffer had no entry for key {key}"));
            };
            shared.threads.register(&native, thread_ref);
        }
        Err(err) if err.is_object_collected() => {
            let worker_collected = shared
                .jdwp
                .thread_name(worker_thread)
                .err()
                .is_some_and(|e| e.is_object_collected());
            if worker_collected {
                // The worker must outlive the process.
                fatal("worker thread reference is collected");
            }
            // The freshly started thread is already gone; nothing to track.
            trace!(thread = thread_ref, "thread collected before tracking");
        }
        Err(err) => fatal(format_args!("tracking thread {thread_ref} failed: {err}")),
    }
}
