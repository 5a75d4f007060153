//! Error taxonomy for the session controller.
//!
//! Every failure mode a caller can observe is a distinct variant, so the
//! presentation layer can tell "the REPL is slow" (`Timeout`) apart from
//! "the REPL crashed" (`ProcessDied`) without string matching. A session
//! failure is never fatal to the host process: the session can be dropped
//! and restarted.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplError {
    /// The REPL executable could not be spawned.
    #[error("failed to launch REPL executable `{path}`: {source}")]
    Launch {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A read or write against the child's streams failed, typically
    /// because the process already exited.
    #[error("REPL process I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// No response unit arrived within the per-call timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The child exited while a transaction was pending.
    #[error("REPL process exited mid-transaction")]
    ProcessDied,

    /// A transaction is already in flight on this session. Submissions
    /// are rejected, never queued.
    #[error("a transaction is already pending on this session")]
    AlreadyPending,

    /// The pending transaction was cancelled via `interrupt()`.
    #[error("transaction interrupted")]
    Interrupted,

    /// The script cursor has passed the last executable line.
    #[error("script exhausted")]
    EndOfScript,

    /// A step was requested before any script was loaded. Distinct from
    /// `EndOfScript` so a front end can prompt for a script instead of
    /// reporting a finished run.
    #[error("no script is loaded")]
    NoScript,

    /// Startup probing could not establish a prompt sentinel.
    #[error("could not establish a prompt sentinel from the REPL startup output")]
    ProtocolMismatch,

    /// The accumulation buffer grew past its bound without a sentinel,
    /// which usually means the sentinel was miscalibrated.
    #[error("output buffer exceeded {limit} bytes without a prompt sentinel")]
    FramingOverflow { limit: usize },

    /// A facade call that needs a live session was made without one.
    #[error("no REPL session is running")]
    NotRunning,
}
