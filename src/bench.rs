//! Workbench facade — the surface the presentation layer consumes.
//!
//! Bundles one optional live session, one optional loaded script, and
//! the shared transaction log behind the handful of calls a front end
//! needs: start/terminate a session, submit text, load/step/reset a
//! script, and read immutable snapshots of the log and cursor.
//!
//! The script outlives the session on purpose: terminating and
//! restarting the interpreter (say, after pointing the config at a
//! corrected executable path) keeps the loaded script and its cursor,
//! so a run can be replayed against a fresh process.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::ProjectConfig;
use crate::error::ReplError;
use crate::log::{LogEntry, TransactionLog};
use crate::script::{Script, ScriptState, StepOutcome};
use crate::session::{Session, Submission};

pub struct Workbench {
    config: ProjectConfig,
    log: Arc<TransactionLog>,
    session: Option<Arc<Session>>,
    script: Option<Script>,
    last_executable: Option<String>,
}

impl Workbench {
    pub fn new(config: ProjectConfig) -> Self {
        Self {
            config,
            log: Arc::new(TransactionLog::new()),
            session: None,
            script: None,
            last_executable: None,
        }
    }

    /// Start a session against `executable`, replacing any running one.
    pub fn start_session(&mut self, executable: &str) -> Result<(), ReplError> {
        if let Some(old) = self.session.take() {
            old.terminate();
        }
        let session = Session::start(
            executable,
            self.config.session_options(),
            Arc::clone(&self.log),
        )?;
        self.last_executable = Some(executable.to_string());
        self.session = Some(Arc::new(session));
        Ok(())
    }

    /// Terminate and relaunch against the last executable. The loaded
    /// script and the transaction log carry over.
    pub fn restart_session(&mut self) -> Result<(), ReplError> {
        let path = self
            .last_executable
            .clone()
            .ok_or(ReplError::NotRunning)?;
        info!(path = %path, "restarting REPL session");
        self.start_session(&path)
    }

    pub fn is_running(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_alive())
    }

    /// Shared handle to the live session, e.g. for a Ctrl-C handler
    /// that needs to call `interrupt` from another thread.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.clone()
    }

    pub fn submit(&self, text: &str) -> Result<Submission, ReplError> {
        self.require_session()?
            .submit(text, self.config.submit_timeout())
    }

    pub fn load_script(&mut self, path: &Path) -> Result<(), ReplError> {
        self.script = Some(Script::from_file(
            path,
            &self.config.script.comment_marker,
        )?);
        Ok(())
    }

    pub fn load_script_lines(&mut self, lines: Vec<String>) {
        self.script = Some(Script::load(lines, &self.config.script.comment_marker));
    }

    pub fn step_next(&mut self) -> Result<StepOutcome, ReplError> {
        let session = self.session.clone().ok_or(ReplError::NotRunning)?;
        let script = self.script.as_mut().ok_or(ReplError::NoScript)?;
        script.step(session.as_ref(), self.config.step_timeout())
    }

    pub fn reset_script(&mut self) {
        if let Some(script) = self.script.as_mut() {
            script.reset();
        }
    }

    /// Display index of the next script line to execute.
    pub fn script_cursor(&self) -> Option<usize> {
        self.script.as_ref().and_then(|s| s.cursor())
    }

    pub fn script_state(&self) -> Option<ScriptState> {
        self.script.as_ref().map(|s| s.state())
    }

    pub fn script_lines(&self) -> Option<&[String]> {
        self.script.as_ref().map(|s| s.lines())
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.log.entries()
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        &self.log
    }

    /// Shut the session down; idempotent. The script and log remain.
    pub fn terminate(&mut self) {
        if let Some(session) = self.session.take() {
            session.terminate();
        }
    }

    fn require_session(&self) -> Result<&Arc<Session>, ReplError> {
        self.session.as_ref().ok_or(ReplError::NotRunning)
    }
}
