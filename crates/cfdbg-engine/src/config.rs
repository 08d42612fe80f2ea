use std::time::Duration;

use crate::ids::CanonicalServerPath;

/// Static knobs the engine needs from its host. Loaded elsewhere; the engine
/// only reads it.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Whether the server filesystem distinguishes path case. When it does
    /// not, canonical paths are folded to lowercase so that mirrors and
    /// breakpoints registered under differently-cased spellings collide.
    pub fs_case_sensitive: bool,

    /// Fully qualified name of the base class every compiled CF page derives
    /// from. Class tracking is filtered to this hierarchy.
    pub page_base_class: String,

    /// Fully qualified name of the injected agent's worker helper class.
    pub worker_class: String,

    /// Name of the worker method that parks the helper thread on its single
    /// return instruction.
    pub worker_park_method: String,

    /// Name of the worker's static method that buffers a thread object and
    /// returns the retrieval key.
    pub worker_get_thread_method: String,

    /// Bound on the one-time spin wait for the worker thread to arrive at
    /// its parking breakpoint.
    pub worker_ack_timeout: Duration,

    /// Substring identifying classes from the runtime's ephemeral in-memory
    /// class loader (expression-eval artifacts); mirror build failures for
    /// these are not worth logging.
    pub ephemeral_class_marker: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fs_case_sensitive: cfg!(not(windows)),
            page_base_class: "cfml.runtime.Page".to_string(),
            worker_class: "cfdbg.agent.Worker".to_string(),
            worker_park_method: "parkForDebuggerSuspend".to_string(),
            worker_get_thread_method: "bufferThreadForDebugger".to_string(),
            worker_ack_timeout: Duration::from_secs(10),
            ephemeral_class_marker: "MemoryClassLoader".to_string(),
        }
    }
}

impl EngineConfig {
    /// The only constructor for [`CanonicalServerPath`]: front-ends and the
    /// engine both normalize through here so keys always collide correctly.
    pub fn canonicalize(&self, path: &str) -> CanonicalServerPath {
        if self.fs_case_sensitive {
            CanonicalServerPath::from_canonical(path.to_string())
        } else {
            CanonicalServerPath::from_canonical(path.to_lowercase())
        }
    }

    /// `name.like.this` → `Lname/like/this;`
    pub(crate) fn class_signature(name: &str) -> String {
        format!("L{};", name.replace('.', "/"))
    }
}
