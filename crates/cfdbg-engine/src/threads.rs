//! Bidirectional thread registry: wire thread id ↔ native thread handle ↔
//! wire thread reference.
//!
//! The native side is held weakly. Once the agent drops a thread (death and
//! collection in the VM), `Weak::upgrade` starts failing and the stale
//! entries are pruned — opportunistically on lookup and wholesale by
//! [`ThreadRegistry::sweep`], which the thread-death handler runs.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::trace;

use cfdbg_jdwp::ThreadId;

use crate::error::fatal;
use crate::ids::DwpThreadId;
use crate::manager::NativeThread;

#[derive(Default)]
pub(crate) struct ThreadRegistry {
    /// dwp thread id → weak native handle.
    by_dwp_id: DashMap<DwpThreadId, Weak<NativeThread>>,
    /// native handle (by buffer key) → wire thread reference.
    ref_by_native: DashMap<i64, ThreadId>,
}

impl ThreadRegistry {
    pub(crate) fn register(&self, native: &Arc<NativeThread>, thread_ref: ThreadId) {
        let id = DwpThreadId(thread_ref);
        self.by_dwp_id.insert(id, Arc::downgrade(native));
        self.ref_by_native.insert(native.buffer_key, thread_ref);
        trace!(thread = %id, key = native.buffer_key, "tracking thread");
    }

    pub(crate) fn unregister(&self, thread_ref: ThreadId) {
        let id = DwpThreadId(thread_ref);
        if let Some((_, weak)) = self.by_dwp_id.remove(&id) {
            if let Some(native) = weak.upgrade() {
                self.ref_by_native.remove(&native.buffer_key);
            }
        }
        // The native handle may already be gone; drop any ref entries still
        // pointing at this wire id.
        self.ref_by_native.retain(|_, r| *r != thread_ref);
    }

    pub(crate) fn thread_by_dwp_id(&self, id: DwpThreadId) -> Option<Arc<NativeThread>> {
        let weak = self.by_dwp_id.get(&id)?.clone();
        match weak.upgrade() {
            Some(native) => Some(native),
            None => {
                // Collected underneath us; prune rather than keep answering
                // with a corpse.
                self.by_dwp_id.remove(&id);
                None
            }
        }
    }

    /// The DAP side referenced a thread we no longer know about; there is no
    /// way to answer correctly, so this is the end of the line.
    pub(crate) fn thread_by_dwp_id_or_fail(&self, id: DwpThreadId) -> Arc<NativeThread> {
        match self.thread_by_dwp_id(id) {
            Some(native) => native,
            None => fatal(format_args!("couldn't find thread with id '{id}'")),
        }
    }

    pub(crate) fn thread_ref_by_native(&self, native: &NativeThread) -> Option<ThreadId> {
        self.ref_by_native.get(&native.buffer_key).map(|r| *r)
    }

    pub(crate) fn thread_ref_by_native_or_fail(&self, native: &NativeThread) -> ThreadId {
        match self.thread_ref_by_native(native) {
            Some(thread_ref) => thread_ref,
            None => fatal(format_args!(
                "couldn't find thread reference for thread with buffer key {}",
                native.buffer_key
            )),
        }
    }

    pub(crate) fn thread_ref_by_dwp_id_or_fail(&self, id: DwpThreadId) -> ThreadId {
        let native = self.thread_by_dwp_id_or_fail(id);
        self.thread_ref_by_native_or_fail(&native)
    }

    /// Every live wire reference currently tracked.
    pub(crate) fn thread_refs(&self) -> Vec<ThreadId> {
        self.ref_by_native.iter().map(|entry| *entry.value()).collect()
    }

    /// Drops entries whose native handle has been collected.
    pub(crate) fn sweep(&self) {
        let mut dead = Vec::new();
        for entry in self.by_dwp_id.iter() {
            if entry.value().strong_count() == 0 {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.by_dwp_id.remove(&id);
            self.ref_by_native.retain(|_, r| *r != id.0);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.by_dwp_id.len()
    }
}
