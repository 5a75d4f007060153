//! Child REPL process supervision.
//!
//! Spawns the interpreter with piped stdio, drains stdout and stderr on
//! dedicated reader threads into the session's event channel, and owns
//! liveness and termination. The readers never parse anything — raw
//! chunks go onto the channel and the session's framer does the rest.
//!
//! Liveness moves `Starting → Running → Exited`, forward only. `Exited`
//! is terminal and is also announced on the event channel, so a caller
//! blocked on a transaction observes process death without polling.

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::ReplError;

/// Events delivered to the session controller's channel.
///
/// One channel carries everything a blocked `submit` can be woken by:
/// output to frame, process death, and interrupt injection.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A raw chunk of child output (stdout or stderr, interleaved).
    Output(String),
    /// The child process exited. Terminal; sent exactly once.
    Exited,
    /// `interrupt()` was invoked while a transaction was pending.
    Interrupted,
}

/// Child process liveness. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Starting,
    Running,
    Exited,
}

const LIVENESS_STARTING: u8 = 0;
const LIVENESS_RUNNING: u8 = 1;
const LIVENESS_EXITED: u8 = 2;

fn liveness_from(raw: u8) -> Liveness {
    match raw {
        LIVENESS_STARTING => Liveness::Starting,
        LIVENESS_RUNNING => Liveness::Running,
        _ => Liveness::Exited,
    }
}

/// Owns one child REPL process and its I/O threads.
pub struct Supervisor {
    child: Arc<Mutex<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    liveness: Arc<AtomicU8>,
    pid: u32,
    path: String,
}

impl Supervisor {
    /// Launch the REPL executable with its startup flags and start
    /// draining its output into `tx`.
    pub fn spawn(path: &str, args: &[String], tx: Sender<SessionEvent>) -> Result<Self, ReplError> {
        let liveness = Arc::new(AtomicU8::new(LIVENESS_STARTING));

        let mut child = Command::new(path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ReplError::Launch {
                path: path.to_string(),
                source,
            })?;

        let pid = child.id();
        info!(path, pid, "spawned REPL process");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Arc::new(Mutex::new(child));

        liveness.store(LIVENESS_RUNNING, Ordering::SeqCst);

        // stdout is the primary stream: its EOF marks process death.
        if let Some(stdout) = stdout {
            let tx = tx.clone();
            let liveness = Arc::clone(&liveness);
            let child = Arc::clone(&child);
            thread::spawn(move || {
                drain_stream(stdout, &tx);
                reap(&child);
                liveness.store(LIVENESS_EXITED, Ordering::SeqCst);
                debug!(pid, "REPL process exited");
                let _ = tx.send(SessionEvent::Exited);
            });
        }

        if let Some(stderr) = stderr {
            let tx = tx.clone();
            thread::spawn(move || {
                drain_stream(stderr, &tx);
            });
        }

        Ok(Self {
            child,
            stdin: Mutex::new(stdin),
            liveness,
            pid,
            path: path.to_string(),
        })
    }

    pub fn liveness(&self) -> Liveness {
        liveness_from(self.liveness.load(Ordering::SeqCst))
    }

    pub fn is_alive(&self) -> bool {
        self.liveness() != Liveness::Exited
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Write one textual command to the child's stdin, appending the
    /// line terminator. Fails with `Io` if the process already exited.
    pub fn write_line(&self, text: &str) -> Result<(), ReplError> {
        if !self.is_alive() {
            return Err(dead_process_error());
        }
        let mut guard = self.stdin.lock().unwrap_or_else(|e| e.into_inner());
        let stdin = guard.as_mut().ok_or_else(dead_process_error)?;
        stdin.write_all(text.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()?;
        Ok(())
    }

    /// Best-effort interrupt of the child (SIGINT on unix).
    pub fn signal_interrupt(&self) {
        #[cfg(unix)]
        unsafe {
            if self.is_alive() {
                libc::kill(self.pid as libc::pid_t, libc::SIGINT);
            }
        }
        #[cfg(not(unix))]
        warn!(pid = self.pid, "child interrupt not supported on this platform");
    }

    /// Graceful shutdown: close stdin (the line-based equivalent of an
    /// exit command — the REPL sees EOF and quits), then escalate to a
    /// forced kill if the process outlives the grace period. Idempotent.
    pub fn terminate(&self, grace: Duration) {
        if !self.is_alive() {
            return;
        }
        info!(pid = self.pid, "terminating REPL process");

        // Closing stdin asks the REPL to exit on its own terms.
        self.stdin.lock().unwrap_or_else(|e| e.into_inner()).take();

        let deadline = Instant::now() + grace;
        loop {
            {
                let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(pid = self.pid, ?status, "REPL process exited gracefully");
                        self.liveness.store(LIVENESS_EXITED, Ordering::SeqCst);
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(pid = self.pid, error = %e, "try_wait failed during terminate");
                        return;
                    }
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        warn!(pid = self.pid, "grace period elapsed, killing REPL process");
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        let _ = child.kill();
        let _ = child.wait();
        self.liveness.store(LIVENESS_EXITED, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("pid", &self.pid)
            .field("path", &self.path)
            .field("liveness", &self.liveness())
            .finish_non_exhaustive()
    }
}

fn dead_process_error() -> ReplError {
    ReplError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "REPL process has exited",
    ))
}

fn drain_stream(mut stream: impl Read, tx: &Sender<SessionEvent>) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                if tx.send(SessionEvent::Output(chunk)).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("stream read error (process likely exited): {e}");
                break;
            }
        }
    }
}

/// Reap the child after stdout EOF. Bounded: if the process somehow
/// closed stdout while staying alive, give up rather than block the
/// reader thread on `wait`.
fn reap(child: &Arc<Mutex<Child>>) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        {
            let mut guard = child.lock().unwrap_or_else(|e| e.into_inner());
            match guard.try_wait() {
                Ok(Some(_)) | Err(_) => return,
                Ok(None) => {}
            }
        }
        if Instant::now() >= deadline {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
}
