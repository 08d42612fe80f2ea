use std::fmt::Display;

use thiserror::Error;

use cfdbg_jdwp::JdwpError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Jdwp(#[from] JdwpError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// A debugger that keeps running in an inconsistent state lies to the user;
/// invariant violations end the process instead.
pub(crate) fn fatal(msg: impl Display) -> ! {
    tracing::error!(target: "cfdbg", "fatal invariant violation: {msg}");
    std::process::exit(1);
}
