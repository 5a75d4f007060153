//! Session controller — serialized request/response transactions.
//!
//! Owns one [`Supervisor`] and one [`Framer`] and turns the child's
//! asynchronous output stream into correlated transactions. The central
//! invariant: at most one transaction is in flight per session. A
//! concurrent `submit` is rejected with `AlreadyPending`, never queued.
//!
//! ## State machine
//!
//! ```text
//! Idle → Pending (on submit) → {Resolved, TimedOut, Failed} → Idle
//! ```
//!
//! The caller's thread blocks inside `submit` until the framer yields a
//! response unit, the per-call timeout elapses, the process dies, or
//! `interrupt()` fires. All four arrive on the same event channel, so
//! no caller can wait forever. Every resolution, success or failure,
//! appends exactly one transaction-log entry with its wall-clock
//! latency.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::ReplError;
use crate::framer::{Framer, ResponseUnit, detect_sentinel};
use crate::log::{LogEntry, Outcome, TransactionLog};
use crate::process::{SessionEvent, Supervisor};

/// Options governing session startup, framing, and shutdown.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Startup flags passed to the REPL executable.
    pub args: Vec<String>,
    /// Fixed prompt sentinel. When set, startup probing is skipped.
    pub sentinel: Option<String>,
    /// Silence window that ends a calibration read.
    pub probe_quiet: Duration,
    /// Overall cap on sentinel calibration.
    pub probe_deadline: Duration,
    /// Bound on the framer's accumulation buffer.
    pub buffer_limit: usize,
    /// Grace period before a terminate escalates to kill.
    pub terminate_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            args: vec![],
            sentinel: None,
            probe_quiet: Duration::from_millis(300),
            probe_deadline: Duration::from_secs(5),
            buffer_limit: 256 * 1024,
            terminate_grace: Duration::from_secs(2),
        }
    }
}

/// What a submission produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The command reached the REPL and resolved with a response.
    Resolved(ResponseUnit),
    /// A screen-clear pseudo-command (`clear`/`cls`) handled locally.
    /// Nothing was written to the child and no transaction was created.
    Cleared,
}

/// Seam between the script stepper and the session controller, so the
/// stepper can be exercised without a live child process.
pub trait Executor {
    fn submit(&self, command: &str, timeout: Duration) -> Result<Submission, ReplError>;
}

enum TxnState {
    Idle,
    Pending,
}

struct IoState {
    rx: Receiver<SessionEvent>,
    framer: Framer,
    /// Response units still owed by abandoned transactions. A timed-out
    /// or interrupted command's answer may arrive later; it must never
    /// resolve a subsequent transaction.
    stale_units: usize,
}

impl IoState {
    /// Frame a chunk, dropping any units owed to abandoned transactions.
    fn frame(&mut self, chunk: &str, echo: Option<&str>) -> Result<Vec<ResponseUnit>, ReplError> {
        let mut units = self.framer.push(chunk, echo)?;
        let stale = self.stale_units.min(units.len());
        if stale > 0 {
            self.stale_units -= stale;
            debug!(count = stale, "discarded stale units from abandoned transactions");
            units = units.split_off(stale);
        }
        Ok(units)
    }
}

/// One live REPL session.
pub struct Session {
    supervisor: Supervisor,
    tx: Sender<SessionEvent>,
    io: Mutex<IoState>,
    txn: Mutex<TxnState>,
    log: Arc<TransactionLog>,
    options: SessionOptions,
}

impl Session {
    /// Launch the REPL and establish its prompt sentinel.
    ///
    /// Unless `options.sentinel` overrides it, the sentinel is
    /// calibrated by draining the startup banner until output goes
    /// quiet, sending a bare-newline probe, and taking the trailing
    /// fragment the REPL leaves when idle. Calibration failure is
    /// `ProtocolMismatch` and the session never starts.
    pub fn start(
        path: &str,
        options: SessionOptions,
        log: Arc<TransactionLog>,
    ) -> Result<Self, ReplError> {
        let (tx, rx) = mpsc::channel();
        let supervisor = Supervisor::spawn(path, &options.args, tx.clone())?;

        let sentinel = match &options.sentinel {
            Some(s) => s.clone(),
            None => match calibrate(
                &supervisor,
                &rx,
                options.probe_quiet,
                options.probe_deadline,
            ) {
                Ok(s) => s,
                Err(e) => {
                    // A child that failed calibration may well ignore
                    // stdin EOF too; reap it before surfacing the error.
                    supervisor.terminate(options.terminate_grace);
                    return Err(e);
                }
            },
        };
        info!(sentinel = %sentinel, "prompt sentinel established");

        let framer = Framer::new(sentinel, options.buffer_limit);
        Ok(Self {
            supervisor,
            tx,
            io: Mutex::new(IoState {
                rx,
                framer,
                stale_units: 0,
            }),
            txn: Mutex::new(TxnState::Idle),
            log,
            options,
        })
    }

    /// Submit one command and block until it resolves.
    ///
    /// `clear`/`cls` (case-insensitive) are handled locally: no write,
    /// no transaction, no log entry — the caller clears its own display.
    pub fn submit(&self, command: &str, timeout: Duration) -> Result<Submission, ReplError> {
        let command = command.trim();
        if command.eq_ignore_ascii_case("clear") || command.eq_ignore_ascii_case("cls") {
            debug!("screen-clear pseudo-command handled locally");
            return Ok(Submission::Cleared);
        }

        let started = Instant::now();
        {
            let mut txn = self.txn.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*txn, TxnState::Pending) {
                return Err(ReplError::AlreadyPending);
            }
            *txn = TxnState::Pending;
        }

        let result = self.run_transaction(command, timeout, started);

        *self.txn.lock().unwrap_or_else(|e| e.into_inner()) = TxnState::Idle;
        result
    }

    fn run_transaction(
        &self,
        command: &str,
        timeout: Duration,
        started: Instant,
    ) -> Result<Submission, ReplError> {
        let mut io = self.io.lock().unwrap_or_else(|e| e.into_inner());

        // Output that arrived between transactions (banner tails, async
        // warnings) belongs to no transaction. Frame and discard it so
        // it cannot resolve this one.
        while let Ok(event) = io.rx.try_recv() {
            match event {
                SessionEvent::Output(chunk) => match io.frame(&chunk, None) {
                    Ok(units) if !units.is_empty() => {
                        warn!(count = units.len(), "discarding stray response units");
                    }
                    Ok(_) => {}
                    Err(e) => debug!("stray output framing failed: {e}"),
                },
                SessionEvent::Exited => {
                    self.resolve(command, Outcome::Failed("process died".into()), started, None);
                    return Err(ReplError::ProcessDied);
                }
                // A stale interrupt from before this transaction.
                SessionEvent::Interrupted => {}
            }
        }

        debug!(command, "SEND");
        if let Err(e) = self.supervisor.write_line(command) {
            self.resolve(
                command,
                Outcome::Failed(format!("write failed: {e}")),
                started,
                None,
            );
            return Err(e);
        }

        let deadline = started + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                io.stale_units += 1;
                self.resolve(command, Outcome::TimedOut, started, None);
                return Err(ReplError::Timeout(timeout));
            }

            match io.rx.recv_timeout(deadline - now) {
                Ok(SessionEvent::Output(chunk)) => {
                    let units = match io.frame(&chunk, Some(command)) {
                        Ok(units) => units,
                        Err(e) => {
                            self.resolve(command, Outcome::Failed(e.to_string()), started, None);
                            return Err(e);
                        }
                    };
                    if units.len() > 1 {
                        warn!(extra = units.len() - 1, "discarding trailing response units");
                    }
                    if let Some(unit) = units.into_iter().next() {
                        debug!(
                            elapsed_secs = started.elapsed().as_secs_f64(),
                            "RECV"
                        );
                        self.resolve(command, Outcome::Resolved, started, Some(&unit));
                        return Ok(Submission::Resolved(unit));
                    }
                }
                Ok(SessionEvent::Exited) => {
                    self.resolve(command, Outcome::Failed("process died".into()), started, None);
                    return Err(ReplError::ProcessDied);
                }
                Ok(SessionEvent::Interrupted) => {
                    io.stale_units += 1;
                    self.resolve(command, Outcome::Failed("interrupted".into()), started, None);
                    return Err(ReplError::Interrupted);
                }
                Err(RecvTimeoutError::Timeout) => {
                    io.stale_units += 1;
                    self.resolve(command, Outcome::TimedOut, started, None);
                    return Err(ReplError::Timeout(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.resolve(command, Outcome::Failed("process died".into()), started, None);
                    return Err(ReplError::ProcessDied);
                }
            }
        }
    }

    fn resolve(
        &self,
        command: &str,
        outcome: Outcome,
        started: Instant,
        unit: Option<&ResponseUnit>,
    ) {
        let mut entry = LogEntry::new(command, outcome, started.elapsed().as_secs_f64());
        if let Some(unit) = unit {
            entry = entry.with_response(&unit.raw, &unit.cleaned);
        }
        self.log.record(entry);
    }

    /// Best-effort cancellation: signal the child (SIGINT on unix) and
    /// deterministically resolve the pending transaction as failed with
    /// an interruption marker. A no-op beyond the child signal when
    /// nothing is pending.
    pub fn interrupt(&self) {
        self.supervisor.signal_interrupt();
        let pending = matches!(
            *self.txn.lock().unwrap_or_else(|e| e.into_inner()),
            TxnState::Pending
        );
        if pending {
            info!("interrupting pending transaction");
            let _ = self.tx.send(SessionEvent::Interrupted);
        }
    }

    /// Graceful-then-forced shutdown of the child. Idempotent.
    pub fn terminate(&self) {
        self.supervisor.terminate(self.options.terminate_grace);
    }

    pub fn is_alive(&self) -> bool {
        self.supervisor.is_alive()
    }

    pub fn executable(&self) -> &str {
        self.supervisor.path()
    }

    pub fn sentinel(&self) -> String {
        self.io
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .framer
            .sentinel()
            .to_string()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.log.entries()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl Executor for Session {
    fn submit(&self, command: &str, timeout: Duration) -> Result<Submission, ReplError> {
        Session::submit(self, command, timeout)
    }
}

fn calibrate(
    supervisor: &Supervisor,
    rx: &Receiver<SessionEvent>,
    quiet: Duration,
    total: Duration,
) -> Result<String, ReplError> {
    let deadline = Instant::now() + total;
    let mut observed = String::new();

    // Let the banner settle, then poke the REPL with a no-op so it
    // prints a fresh idle prompt as the trailing fragment. Detection
    // runs on the post-probe output alone: a banner that already ends
    // in the prompt, fed to a REPL that consumes the probe without
    // echoing it, would otherwise fuse both prompts into one bogus
    // trailing fragment. The banner is only a fallback, for a REPL
    // that stays quiet after the probe.
    collect_until_quiet(rx, &mut observed, quiet, deadline)?;
    let banner = std::mem::take(&mut observed);
    supervisor.write_line("")?;
    collect_until_quiet(rx, &mut observed, quiet, deadline)?;

    detect_sentinel(&observed)
        .or_else(|| detect_sentinel(&banner))
        .ok_or(ReplError::ProtocolMismatch)
}

fn collect_until_quiet(
    rx: &Receiver<SessionEvent>,
    buf: &mut String,
    quiet: Duration,
    deadline: Instant,
) -> Result<(), ReplError> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        match rx.recv_timeout(quiet.min(deadline - now)) {
            Ok(SessionEvent::Output(chunk)) => buf.push_str(&chunk),
            Ok(SessionEvent::Exited) => return Err(ReplError::ProcessDied),
            Ok(SessionEvent::Interrupted) => {}
            Err(RecvTimeoutError::Timeout) => return Ok(()),
            Err(RecvTimeoutError::Disconnected) => return Err(ReplError::ProcessDied),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::thread;

    /// A well-behaved fake REPL: echoes the command, answers `got:<cmd>`,
    /// and prints a fresh prompt.
    const ECHO_REPL: &str = r#"
printf 'tau> '
while IFS= read -r line; do
  printf '%s\n' "$line"
  printf 'got:%s\n' "$line"
  printf 'tau> '
done
"#;

    /// Calibrates normally, then goes silent forever.
    const SILENT_REPL: &str = r#"
printf 'tau> '
IFS= read -r probe
printf 'tau> '
while IFS= read -r line; do sleep 60; done
"#;

    /// Calibrates normally, then dies on the first real command.
    const DYING_REPL: &str = r#"
printf 'tau> '
IFS= read -r probe
printf 'tau> '
IFS= read -r line
exit 0
"#;

    /// Calibrates normally, then takes ~1s to answer the first command.
    const SLOW_REPL: &str = r#"
printf 'tau> '
IFS= read -r probe
printf 'tau> '
IFS= read -r line
sleep 1
printf '%s\ngot:%s\ntau> ' "$line" "$line"
while IFS= read -r line; do :; done
"#;

    /// Calibrates normally, then answers every command after ~1s.
    const LAGGY_REPL: &str = r#"
printf 'tau> '
IFS= read -r probe
printf 'tau> '
while IFS= read -r line; do
  sleep 1
  printf '%s\ngot:%s\ntau> ' "$line" "$line"
done
"#;

    fn start_fake(script: &str) -> Arc<Session> {
        let options = SessionOptions {
            args: vec!["-c".into(), script.into()],
            probe_quiet: Duration::from_millis(150),
            ..SessionOptions::default()
        };
        let session = Session::start("/bin/sh", options, Arc::new(TransactionLog::new())).unwrap();
        Arc::new(session)
    }

    #[test]
    fn calibration_establishes_sentinel() {
        let session = start_fake(ECHO_REPL);
        assert_eq!(session.sentinel(), "tau>");
    }

    #[test]
    fn calibration_survives_banner_ending_in_prompt() {
        // The probe line is consumed without an echo, so the pre- and
        // post-probe prompts arrive with no newline between them. The
        // fused `tau> tau> ` must not become the sentinel.
        let session = start_fake(SLOW_REPL);
        assert_eq!(session.sentinel(), "tau>");
    }

    #[test]
    fn calibration_fails_on_mute_child() {
        let options = SessionOptions {
            args: vec!["-c".into(), "while IFS= read -r l; do :; done".into()],
            probe_quiet: Duration::from_millis(150),
            probe_deadline: Duration::from_secs(1),
            ..SessionOptions::default()
        };
        let err =
            Session::start("/bin/sh", options, Arc::new(TransactionLog::new())).unwrap_err();
        assert!(matches!(err, ReplError::ProtocolMismatch));
    }

    #[test]
    fn sequential_submits_resolve_in_order() {
        let session = start_fake(ECHO_REPL);

        for cmd in ["alpha;", "beta;", "gamma;"] {
            let submission = session.submit(cmd, Duration::from_secs(5)).unwrap();
            match submission {
                Submission::Resolved(unit) => assert_eq!(unit.cleaned, format!("got:{cmd}")),
                other => panic!("expected resolved unit, got: {other:?}"),
            }
        }

        let entries = session.log_entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].command, "alpha;");
        assert_eq!(entries[1].command, "beta;");
        assert_eq!(entries[2].command, "gamma;");
        assert!(entries.iter().all(|e| e.outcome == Outcome::Resolved));
    }

    #[test]
    fn clear_is_local_and_leaves_no_trace() {
        let session = start_fake(ECHO_REPL);

        assert_eq!(
            session.submit("Clear", Duration::from_secs(1)).unwrap(),
            Submission::Cleared
        );
        assert_eq!(
            session.submit("CLS", Duration::from_secs(1)).unwrap(),
            Submission::Cleared
        );
        assert!(session.log_entries().is_empty());

        // Nothing was written to the child, so framing is unpolluted.
        match session.submit("ping;", Duration::from_secs(5)).unwrap() {
            Submission::Resolved(unit) => assert_eq!(unit.cleaned, "got:ping;"),
            other => panic!("expected resolved unit, got: {other:?}"),
        }
    }

    #[test]
    fn timeout_on_silent_child_is_bounded() {
        let session = start_fake(SILENT_REPL);

        let started = Instant::now();
        let err = session
            .submit("anyone;", Duration::from_millis(100))
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, ReplError::Timeout(_)));
        assert!(elapsed >= Duration::from_millis(100), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "blocked too long: {elapsed:?}");

        let entries = session.log_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, Outcome::TimedOut);
    }

    #[test]
    fn stale_response_cannot_resolve_next_transaction() {
        let session = start_fake(LAGGY_REPL);

        // The first command is abandoned before its ~1s answer lands.
        let err = session
            .submit("first;", Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, ReplError::Timeout(_)));

        // The late answer to `first;` arrives while `second;` is
        // pending; it must be discarded, not returned.
        match session.submit("second;", Duration::from_secs(5)).unwrap() {
            Submission::Resolved(unit) => assert_eq!(unit.cleaned, "got:second;"),
            other => panic!("expected resolved unit, got: {other:?}"),
        }

        let entries = session.log_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].command, "first;");
        assert_eq!(entries[0].outcome, Outcome::TimedOut);
        assert_eq!(entries[1].command, "second;");
        assert_eq!(entries[1].outcome, Outcome::Resolved);
    }

    #[test]
    fn failed_calibration_reaps_the_child() {
        // A heartbeat child that never touches its stdio: calibration
        // cannot succeed, and closing stdin alone would not stop it.
        let tmp = tempfile::tempdir().unwrap();
        let beat = tmp.path().join("beat");
        let script = format!(
            "while :; do echo tick >> {}; sleep 0.1; done",
            beat.display()
        );
        let options = SessionOptions {
            args: vec!["-c".into(), script],
            probe_quiet: Duration::from_millis(150),
            probe_deadline: Duration::from_millis(500),
            terminate_grace: Duration::from_millis(100),
            ..SessionOptions::default()
        };
        let err =
            Session::start("/bin/sh", options, Arc::new(TransactionLog::new())).unwrap_err();
        assert!(matches!(err, ReplError::ProtocolMismatch));

        // The heartbeat stops once the child is killed.
        thread::sleep(Duration::from_millis(300));
        let settled = std::fs::read(&beat).unwrap_or_default().len();
        thread::sleep(Duration::from_millis(400));
        let after = std::fs::read(&beat).unwrap_or_default().len();
        assert_eq!(after, settled, "child kept running after failed calibration");
    }

    #[test]
    fn process_death_resolves_blocked_submit() {
        let session = start_fake(DYING_REPL);

        let err = session.submit("final;", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, ReplError::ProcessDied));
        assert!(!session.is_alive());

        let entries = session.log_entries();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].outcome, Outcome::Failed(_)));
    }

    #[test]
    fn concurrent_submit_is_rejected_not_queued() {
        let session = start_fake(SLOW_REPL);

        let worker = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.submit("slow;", Duration::from_secs(5)))
        };

        // Let the first submit get in flight.
        thread::sleep(Duration::from_millis(200));
        let err = session.submit("eager;", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ReplError::AlreadyPending));

        match worker.join().unwrap().unwrap() {
            Submission::Resolved(unit) => assert_eq!(unit.cleaned, "got:slow;"),
            other => panic!("expected resolved unit, got: {other:?}"),
        }

        // Only the in-flight transaction reached the log.
        assert_eq!(session.log_entries().len(), 1);
    }

    #[test]
    fn interrupt_resolves_pending_transaction() {
        let session = start_fake(SILENT_REPL);

        let worker = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.submit("stuck;", Duration::from_secs(10)))
        };

        thread::sleep(Duration::from_millis(300));
        session.interrupt();

        let err = worker.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            ReplError::Interrupted | ReplError::ProcessDied
        ));

        let entries = session.log_entries();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].outcome, Outcome::Failed(_)));
    }

    #[test]
    fn fixed_sentinel_skips_probing() {
        let options = SessionOptions {
            args: vec!["-c".into(), ECHO_REPL.into()],
            sentinel: Some("tau>".into()),
            ..SessionOptions::default()
        };
        let session =
            Session::start("/bin/sh", options, Arc::new(TransactionLog::new())).unwrap();
        assert_eq!(session.sentinel(), "tau>");

        // The unconsumed banner is discarded as stray output on the
        // first submit; the response still frames correctly.
        thread::sleep(Duration::from_millis(200));
        match session.submit("ping;", Duration::from_secs(5)).unwrap() {
            Submission::Resolved(unit) => assert_eq!(unit.cleaned, "got:ping;"),
            other => panic!("expected resolved unit, got: {other:?}"),
        }
    }
}
