//! Strongly typed identifiers crossing the engine's boundaries.
//!
//! The DAP front-end juggles several integer and string id spaces at once
//! (wire thread ids, breakpoint ids, two flavors of source path); each gets
//! its own opaque wrapper so they cannot be passed for one another.

use std::fmt;

use serde::Serialize;

/// Thread id in the target VM's debug-wire id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DwpThreadId(pub u64);

impl fmt::Display for DwpThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Breakpoint id as reported to the DAP client. Stable for a given
/// (canonical path, line) across rebinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DapBreakpointId(pub i32);

impl fmt::Display for DapBreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Absolute source path as the server sees it, normalized through
/// [`crate::config::EngineConfig::canonicalize`]. This is the key under which
/// class mirrors and replayable breakpoints are registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CanonicalServerPath(String);

impl CanonicalServerPath {
    pub(crate) fn from_canonical(path: String) -> Self {
        Self(path)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalServerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The path string exactly as the IDE sent it, before any server-side
/// mapping. Kept verbatim so breakpoint results can echo the client's view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RawIdePath(String);

impl RawIdePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RawIdePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
