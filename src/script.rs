//! Script stepping — line-by-line execution of a loaded script.
//!
//! A script is an ordered sequence of source lines. Blank lines and
//! comment lines are retained so display indices stay stable, but the
//! cursor only ever rests on executable lines. Each step delegates one
//! line to the session controller and advances the cursor after the
//! transaction resolves — on failure too: like the REPL itself, the
//! stepper tolerates a bad line and moves on. The step outcome carries
//! the failure so the caller can still halt if it wants to.
//!
//! A script is independent of any one session: `reset` rewinds the
//! cursor and the same script can be re-run against a fresh session.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::error::ReplError;
use crate::session::{Executor, Submission};

/// Execution state of a loaded script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    /// Loaded, but holds no executable lines.
    Idle,
    /// Loaded, cursor at the first executable line, nothing run yet.
    Ready,
    /// At least one step taken, more executable lines remain.
    Running,
    /// The cursor has passed the last executable line.
    Completed,
}

/// Result of one step.
#[derive(Debug)]
pub struct StepOutcome {
    /// Zero-based display index of the executed line.
    pub index: usize,
    /// The line that was submitted.
    pub line: String,
    /// How the submission resolved. A failed step is reported here and
    /// the cursor has already advanced past it.
    pub response: Result<Submission, ReplError>,
}

/// An ordered sequence of source lines with a step cursor.
pub struct Script {
    lines: Vec<String>,
    comment_marker: String,
    /// Display index of the next executable line, or `lines.len()` when
    /// exhausted. Invariant: never rests on a blank or comment line.
    cursor: usize,
    state: ScriptState,
}

impl Script {
    pub fn load(lines: Vec<String>, comment_marker: &str) -> Self {
        let mut script = Self {
            lines,
            comment_marker: comment_marker.to_string(),
            cursor: 0,
            state: ScriptState::Idle,
        };
        script.reset();
        script
    }

    /// Load a script file: plain text, one statement per line.
    pub fn from_file(path: &Path, comment_marker: &str) -> Result<Self, ReplError> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::load(
            text.lines().map(str::to_string).collect(),
            comment_marker,
        ))
    }

    /// All lines, including blanks and comments, for display.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn state(&self) -> ScriptState {
        self.state
    }

    /// Display index of the next line to execute, `None` when exhausted.
    pub fn cursor(&self) -> Option<usize> {
        (self.cursor < self.lines.len()).then_some(self.cursor)
    }

    pub fn executable_count(&self) -> usize {
        self.lines.iter().filter(|l| self.is_executable(l)).count()
    }

    /// Rewind the cursor to the first executable line. Does not touch
    /// the session.
    pub fn reset(&mut self) {
        match self.next_executable_from(0) {
            Some(i) => {
                self.cursor = i;
                self.state = ScriptState::Ready;
            }
            None => {
                self.cursor = self.lines.len();
                self.state = ScriptState::Idle;
            }
        }
    }

    /// Execute the line under the cursor and advance past it.
    ///
    /// Fails with `EndOfScript` once the cursor has passed the last
    /// executable line; any submission failure is carried inside the
    /// returned outcome instead.
    pub fn step<E: Executor + ?Sized>(
        &mut self,
        executor: &E,
        timeout: Duration,
    ) -> Result<StepOutcome, ReplError> {
        if self.cursor >= self.lines.len() {
            return Err(ReplError::EndOfScript);
        }

        let index = self.cursor;
        let line = self.lines[index].clone();
        debug!(index, line = %line, "stepping script line");

        let response = executor.submit(&line, timeout);

        self.cursor = self
            .next_executable_from(index + 1)
            .unwrap_or(self.lines.len());
        self.state = if self.cursor < self.lines.len() {
            ScriptState::Running
        } else {
            ScriptState::Completed
        };

        Ok(StepOutcome {
            index,
            line,
            response,
        })
    }

    fn is_executable(&self, line: &str) -> bool {
        let trimmed = line.trim();
        !trimmed.is_empty() && !trimmed.starts_with(&self.comment_marker)
    }

    fn next_executable_from(&self, from: usize) -> Option<usize> {
        (from..self.lines.len()).find(|&i| self.is_executable(&self.lines[i]))
    }
}
