//! tau-bench — session controller and workbench for an external
//! line-based REPL.
//!
//! The core owns a child interpreter process, frames its unstructured
//! output stream into correlated request/response transactions, and
//! exposes synchronous command submission plus line-by-line stepping of
//! a loaded script. Everything the child prints is opaque text: the
//! controller frames and relays it, it never interprets it.

pub mod bench;
pub mod config;
pub mod error;
pub mod framer;
pub mod log;
pub mod process;
pub mod script;
pub mod session;

pub use bench::Workbench;
pub use error::ReplError;
pub use framer::ResponseUnit;
pub use script::{Script, ScriptState, StepOutcome};
pub use session::{Session, SessionOptions, Submission};
