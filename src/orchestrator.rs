//! Process orchestrator — one child session at a time.
//!
//! `start` allocates a pseudo-terminal session, spawns the child in it, and
//! runs two background threads:
//! 1. the output loop, which reads fixed-size chunks and publishes them as
//!    UTF-8 text on a bounded channel, and
//! 2. the exit waiter, which blocks on the child and fires a single exit
//!    notification.
//!
//! The orchestrator only returns to `Idle` once both threads have finished,
//! so a new session can never overlap the tail of the previous one.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{PtyError, Result};
use crate::session::{ChildProcess, ExitReport, PtySession};

const KILL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lifecycle of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Exited,
    Killed,
}

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Terminal geometry every session is created with.
    pub columns: u16,
    pub rows: u16,
    /// Size of each blocking read on the output stream.
    pub read_chunk_bytes: usize,
    /// Chunks buffered between the output loop and its consumer.
    pub output_channel_capacity: usize,
    /// How long `kill` waits for the exit waiter to confirm termination.
    pub kill_timeout: Duration,
}

impl OrchestratorConfig {
    pub fn default_read_chunk_bytes() -> usize {
        4096
    }

    pub fn default_kill_timeout() -> Duration {
        Duration::from_secs(3)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            columns: 120,
            rows: 30,
            read_chunk_bytes: Self::default_read_chunk_bytes(),
            output_channel_capacity: 256,
            kill_timeout: Self::default_kill_timeout(),
        }
    }
}

/// Receivers for one started session.
pub struct Started {
    /// Process id of the child, for diagnostics.
    pub pid: Option<u32>,
    /// Raw output chunks, escape sequences included. Closes when the output
    /// loop ends.
    pub output: Receiver<String>,
    /// Fires at most once, when the child has exited.
    pub exited: Receiver<ExitReport>,
}

#[derive(Default)]
struct Inner {
    state: RunState,
    session: Option<PtySession>,
    cancel: Option<Arc<AtomicBool>>,
    exited: Option<Arc<AtomicBool>>,
    workers: Vec<JoinHandle<()>>,
    pid: Option<u32>,
}

impl Inner {
    fn child_exited(&self) -> bool {
        self.exited
            .as_ref()
            .is_none_or(|flag| flag.load(Ordering::SeqCst))
    }

    /// Cancel the output loop, stop the child's process tree, and release the
    /// session. Never blocks on the worker threads.
    fn release(&mut self) {
        if let Some(cancel) = &self.cancel {
            cancel.store(true, Ordering::SeqCst);
        }
        if let Some(mut session) = self.session.take() {
            if !self.child_exited() {
                debug!(pid = ?self.pid, "child still running at dispose, terminating");
            }
            // Background processes can outlive the shell that started them.
            session.terminate_tree();
            session.dispose();
        }
        if self.state == RunState::Running {
            self.state = RunState::Killed;
        }
    }

    /// Return to `Idle` once the session is over and both threads are done.
    fn reap(&mut self) {
        if !matches!(self.state, RunState::Exited | RunState::Killed) {
            return;
        }
        if self.workers.iter().any(|w| !w.is_finished()) {
            return;
        }
        self.release();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("session worker thread panicked");
            }
        }
        self.cancel = None;
        self.exited = None;
        self.pid = None;
        self.state = RunState::Idle;
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owns at most one running child session. Cheap to clone; clones share the
/// same session.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Mutex<Inner>>,
    config: Arc<OrchestratorConfig>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            config: Arc::new(config),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Current state. A finished session whose threads have both ended is
    /// reported (and becomes) `Idle`.
    pub fn state(&self) -> RunState {
        let mut inner = self.lock();
        inner.reap();
        inner.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    /// Spawn `command_line` in a fresh pseudo-terminal.
    ///
    /// Fails with `AlreadyRunning` unless idle; the active session is left
    /// untouched in that case. Allocation and spawn failures clean up after
    /// themselves and leave the orchestrator idle.
    pub fn start(&self, command_line: &str) -> Result<Started> {
        let mut inner = self.lock();
        inner.reap();
        if inner.state != RunState::Idle {
            return Err(PtyError::AlreadyRunning { pid: inner.pid });
        }

        let mut session = PtySession::create(self.config.columns, self.config.rows)?;
        let child = match session.spawn_child(command_line) {
            Ok(child) => child,
            Err(e) => {
                session.dispose();
                return Err(e);
            }
        };
        let pid = child.pid();

        let Some(reader) = session.take_output_reader() else {
            session.terminate_tree();
            session.dispose();
            return Err(PtyError::allocation("output stream unavailable"));
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(AtomicBool::new(false));
        let (output_tx, output_rx) = mpsc::sync_channel(self.config.output_channel_capacity.max(1));
        let (exit_tx, exit_rx) = mpsc::sync_channel(1);

        let output_worker = thread::Builder::new()
            .name("ptywatch-output".to_string())
            .spawn({
                let cancel = cancel.clone();
                let chunk = self.config.read_chunk_bytes.max(1);
                move || output_loop(reader, chunk, output_tx, cancel)
            });
        let output_worker = match output_worker {
            Ok(handle) => handle,
            Err(e) => {
                session.terminate_tree();
                session.dispose();
                return Err(PtyError::Io(e));
            }
        };

        let exit_worker = thread::Builder::new()
            .name("ptywatch-exit".to_string())
            .spawn({
                let inner = Arc::downgrade(&self.inner);
                let exited = exited.clone();
                move || exit_wait_loop(child, inner, exited, exit_tx)
            });
        let exit_worker = match exit_worker {
            Ok(handle) => handle,
            Err(e) => {
                cancel.store(true, Ordering::SeqCst);
                session.terminate_tree();
                session.dispose();
                // The output loop sees EOF once the child is gone.
                let _ = output_worker.join();
                return Err(PtyError::Io(e));
            }
        };

        inner.session = Some(session);
        inner.cancel = Some(cancel);
        inner.exited = Some(exited);
        inner.workers = vec![output_worker, exit_worker];
        inner.pid = pid;
        inner.state = RunState::Running;

        info!(pid = ?pid, command = command_line, "session started");

        Ok(Started {
            pid,
            output: output_rx,
            exited: exit_rx,
        })
    }

    /// Write `text` to the child's input. A no-op when no session is active.
    pub fn send_input(&self, text: &str) -> Result<()> {
        let writer = match self.lock().session.as_ref() {
            Some(session) => session.input_writer(),
            None => {
                debug!("send_input without an active session, ignoring");
                return Ok(());
            }
        };
        // Write outside the state lock so a slow child cannot stall `kill`.
        writer.write_all(text.as_bytes())?;
        debug!(bytes = text.len(), "input sent to child");
        Ok(())
    }

    /// Terminate the child and all of its descendants, wait briefly for the
    /// exit to be observed, then dispose. A no-op before `start`.
    pub fn kill(&self) {
        let exited = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let Some(session) = inner.session.as_mut() else {
                debug!("kill without an active session, ignoring");
                return;
            };
            info!(pid = ?inner.pid, state = ?inner.state, "killing child process tree");
            session.terminate_tree();
            if inner.state == RunState::Running {
                inner.state = RunState::Killed;
            }
            inner.exited.clone()
        };

        if let Some(exited) = exited {
            let deadline = Instant::now() + self.config.kill_timeout;
            while !exited.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(KILL_POLL_INTERVAL);
            }
            if !exited.load(Ordering::SeqCst) {
                warn!(
                    timeout_ms = self.config.kill_timeout.as_millis() as u64,
                    "child did not confirm exit after kill"
                );
            }
        }

        self.dispose();
    }

    /// Cancel the output loop, close input, and release every handle. Safe to
    /// call repeatedly and from any thread, including a consumer reacting to
    /// the exit notification.
    pub fn dispose(&self) {
        self.lock().release();
    }

    /// Poll until the orchestrator is idle again. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state() == RunState::Idle {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(KILL_POLL_INTERVAL);
        }
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(OrchestratorConfig::default())
    }
}

fn output_loop(
    mut reader: Box<dyn Read + Send>,
    chunk_bytes: usize,
    tx: SyncSender<String>,
    cancel: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; chunk_bytes];
    let mut decoder = Utf8Decoder::default();

    loop {
        if cancel.load(Ordering::SeqCst) {
            debug!("output loop cancelled");
            break;
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break, // EOF — child exited or session torn down
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("output read ended (process likely exited): {e}");
                break;
            }
        };

        let text = decoder.decode(&buf[..n]);
        if text.is_empty() {
            continue;
        }
        if tx.send(text).is_err() {
            debug!("output consumer gone, stopping output loop");
            break;
        }
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        let _ = tx.send(tail);
    }
    debug!("output loop finished");
}

fn exit_wait_loop(
    mut child: ChildProcess,
    inner: Weak<Mutex<Inner>>,
    exited: Arc<AtomicBool>,
    tx: SyncSender<ExitReport>,
) {
    let pid = child.pid();
    let mut report = match child.wait() {
        Ok(report) => report,
        Err(e) => {
            warn!(pid = ?pid, error = %e, "failed to wait for child");
            ExitReport {
                code: 1,
                success: false,
                killed: false,
            }
        }
    };
    exited.store(true, Ordering::SeqCst);

    if let Some(inner) = inner.upgrade() {
        let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.state {
            RunState::Running => inner.state = RunState::Exited,
            RunState::Killed => report.killed = true,
            RunState::Idle | RunState::Exited => {}
        }
    }

    info!(pid = ?pid, code = report.code, killed = report.killed, "child exited");
    match tx.try_send(report) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
        Err(TrySendError::Full(_)) => warn!("exit notification already delivered"),
    }
}

/// Decodes a byte stream as UTF-8 across read boundaries.
///
/// An incomplete multi-byte sequence at the end of a read is held back for
/// the next one; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(bytes);

        let mut out = String::with_capacity(data.len());
        let mut rest: &[u8] = &data;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push('\u{FFFD}');
                            rest = &tail[len..];
                        }
                        None => {
                            rest = tail;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        out
    }

    /// Flush whatever is held back, lossily.
    pub(crate) fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_carries_split_multibyte_chars() {
        let mut d = Utf8Decoder::default();
        let bytes = "héllo €".as_bytes();
        let (a, b) = bytes.split_at(2); // splits inside 'é'
        assert_eq!(d.decode(a), "h");
        assert_eq!(d.decode(b), "éllo €");
        assert!(d.finish().is_empty());
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut d = Utf8Decoder::default();
        assert_eq!(d.decode(b"ok\xffok"), "ok\u{FFFD}ok");
    }

    #[test]
    fn decoder_finish_flushes_truncated_tail() {
        let mut d = Utf8Decoder::default();
        assert_eq!(d.decode(&[b'a', 0xE2, 0x82]), "a");
        assert_eq!(d.finish(), "\u{FFFD}");
    }

    #[test]
    fn default_config_values() {
        let c = OrchestratorConfig::default();
        assert_eq!(c.read_chunk_bytes, 4096);
        assert_eq!(c.kill_timeout, Duration::from_secs(3));
        assert_eq!((c.columns, c.rows), (120, 30));
    }

    #[test]
    fn kill_before_start_is_noop() {
        let o = Orchestrator::default();
        o.kill();
        o.dispose();
        assert_eq!(o.state(), RunState::Idle);
    }

    #[test]
    fn send_input_without_session_is_noop() {
        let o = Orchestrator::default();
        assert!(o.send_input("y\r").is_ok());
    }

    #[cfg(unix)]
    fn drain(started: &Started) -> String {
        started.output.iter().collect()
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn start_streams_output_and_reports_exit() {
        let o = Orchestrator::default();
        let started = o.start("printf 'PASS one\\nPASS two\\n'; exit 4").unwrap();
        assert!(started.pid.is_some());

        let output = drain(&started);
        assert!(output.contains("PASS one"), "got: {output:?}");
        assert!(output.contains("PASS two"));

        let report = started.exited.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(report.code, 4);
        assert!(!report.killed);

        o.dispose();
        assert!(o.wait_idle(Duration::from_secs(5)));
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn second_start_is_rejected_while_running() {
        let o = Orchestrator::default();
        let first = o.start("sleep 30").unwrap();
        let pid = first.pid;

        let err = o.start("echo second").err().unwrap();
        assert!(matches!(err, PtyError::AlreadyRunning { .. }));
        assert_eq!(o.state(), RunState::Running);
        assert_eq!(o.pid(), pid);

        o.kill();
        let report = first.exited.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(report.killed);
        assert!(o.wait_idle(Duration::from_secs(5)));
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn kill_takes_down_descendants() {
        let o = Orchestrator::default();
        // The grandchild would keep the pty open if it survived the kill.
        let Started { output, exited, .. } = o.start("sleep 60 & sleep 60; wait").unwrap();
        let (closed_tx, closed_rx) = mpsc::channel();
        thread::spawn(move || {
            for _ in output.iter() {}
            let _ = closed_tx.send(());
        });
        thread::sleep(Duration::from_millis(200));
        o.kill();

        let report = exited.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(report.killed);
        // Output closes only when every holder of the pty slave is gone.
        assert!(closed_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(o.wait_idle(Duration::from_secs(5)));
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn kill_after_exit_takes_down_background_children() {
        let o = Orchestrator::default();
        let Started { output, exited, .. } = o
            .start("(trap '' HUP; exec sleep 20) & echo bg started; exit 0")
            .unwrap();
        let (closed_tx, closed_rx) = mpsc::channel();
        thread::spawn(move || {
            for _ in output.iter() {}
            let _ = closed_tx.send(());
        });

        let report = exited.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(report.code, 0);
        // The background sleep still holds the pty open.
        assert!(closed_rx.recv_timeout(Duration::from_millis(300)).is_err());

        o.kill();
        assert!(closed_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(o.wait_idle(Duration::from_secs(5)));
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn kill_from_exit_notification_thread() {
        let o = Orchestrator::default();
        let Started { output, exited, .. } = o.start("exit 3").unwrap();
        drop(output);

        let (done_tx, done_rx) = mpsc::channel();
        let handle = o.clone();
        thread::spawn(move || {
            let report = exited.recv_timeout(Duration::from_secs(5));
            handle.kill();
            let _ = done_tx.send(report.map(|r| r.code));
        });

        let code = done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(code.ok(), Some(3));
        assert!(o.wait_idle(Duration::from_secs(5)));
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn send_input_reaches_child() {
        let o = Orchestrator::default();
        let started = o.start("read line; echo \"got:$line\"").unwrap();
        thread::sleep(Duration::from_millis(200));
        o.send_input("hello\r").unwrap();

        let output = drain(&started);
        assert!(output.contains("got:hello"), "got: {output:?}");
        started.exited.recv_timeout(Duration::from_secs(5)).unwrap();
        o.dispose();
        assert!(o.wait_idle(Duration::from_secs(5)));
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn restart_after_exit() {
        let o = Orchestrator::default();
        let first = o.start("true").unwrap();
        let _ = drain(&first);
        first.exited.recv_timeout(Duration::from_secs(5)).unwrap();
        o.dispose();
        assert!(o.wait_idle(Duration::from_secs(5)));

        let second = o.start("echo again").unwrap();
        assert!(drain(&second).contains("again"));
        o.dispose();
    }
}
