//! Pseudo-terminal session.
//!
//! Owns every native resource of one run: the pseudo-console (master side),
//! the host-writable input stream, the host-readable output stream, and the
//! handle used to terminate the child. Nothing outside this module touches
//! the raw handles. Release is explicit (`dispose`), idempotent, and also
//! happens on drop.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use portable_pty::{
    Child, ChildKiller, CommandBuilder, MasterPty, PtySize, SlavePty, native_pty_system,
};
use tracing::{debug, info};

use crate::error::{PtyError, Result};

/// Exit information for a finished child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: u32,
    pub success: bool,
    /// The child was terminated through `kill` rather than exiting on its own.
    pub killed: bool,
}

/// Shared, serialized writer for the child's input.
///
/// Cloning is cheap; all clones write to the same stream under one lock so
/// concurrent callers never interleave partial writes.
#[derive(Clone)]
pub struct InputWriter {
    inner: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
}

impl InputWriter {
    fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(writer))),
        }
    }

    /// Write and flush. Writing after `close` is a silent no-op.
    pub fn write_all(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(writer) => {
                writer.write_all(bytes)?;
                writer.flush()
            }
            None => Ok(()),
        }
    }

    /// Close the stream. Idempotent.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// The spawned child. Owned by whoever waits on it; termination goes through
/// the session instead so a blocked `wait` never holds up a kill.
pub struct ChildProcess {
    inner: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
}

impl ChildProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Block until the child exits.
    pub fn wait(&mut self) -> std::io::Result<ExitReport> {
        let status = self.inner.wait()?;
        Ok(ExitReport {
            code: status.exit_code(),
            success: status.success(),
            killed: false,
        })
    }
}

pub struct PtySession {
    master: Option<Box<dyn MasterPty + Send>>,
    slave: Option<Box<dyn SlavePty + Send>>,
    input: InputWriter,
    output: Option<Box<dyn Read + Send>>,
    killer: Option<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    size: PtySize,
}

impl PtySession {
    /// Allocate a pseudo-console of `columns` x `rows` with its two pipes.
    ///
    /// If any step fails, everything acquired before it is released by the
    /// time this returns.
    pub fn create(columns: u16, rows: u16) -> Result<Self> {
        let size = PtySize {
            rows,
            cols: columns,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = native_pty_system()
            .openpty(size)
            .map_err(PtyError::allocation)?;

        let output = pair
            .master
            .try_clone_reader()
            .map_err(PtyError::allocation)?;
        let writer = pair.master.take_writer().map_err(PtyError::allocation)?;

        debug!(columns, rows, "pseudo-terminal allocated");

        Ok(Self {
            master: Some(pair.master),
            slave: Some(pair.slave),
            input: InputWriter::new(writer),
            output: Some(output),
            killer: None,
            pid: None,
            size,
        })
    }

    pub fn size(&self) -> (u16, u16) {
        (self.size.cols, self.size.rows)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Handle for writing to the child's input; valid until `dispose`.
    pub fn input_writer(&self) -> InputWriter {
        self.input.clone()
    }

    /// Hand the output stream to its single reader. Returns `None` once taken
    /// or after disposal.
    pub fn take_output_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.output.take()
    }

    /// Launch `command_line` attached to this pseudo-console.
    ///
    /// The command goes through the platform shell so relative script paths
    /// and arguments resolve exactly as if typed by a user. All standard
    /// streams flow through the pseudo-console. On failure the session stays
    /// valid and must still be disposed.
    pub fn spawn_child(&mut self, command_line: &str) -> Result<ChildProcess> {
        let Some(slave) = self.slave.as_ref() else {
            return Err(PtyError::Spawn {
                command: command_line.to_string(),
                code: None,
                detail: "session already has a child or was disposed".to_string(),
            });
        };

        let mut cmd = shell_command(command_line);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", "xterm-256color");

        let child = slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::spawn(command_line, e))?;

        // Only the child keeps the slave side open; our copy would hold off
        // EOF on the output stream after the child exits.
        self.slave.take();

        let pid = child.process_id();
        self.pid = pid;
        self.killer = Some(child.clone_killer());
        info!(pid = ?pid, command = command_line, "child spawned in pseudo-terminal");

        Ok(ChildProcess { inner: child, pid })
    }

    /// Terminate the child and every process it started. Failures are
    /// expected when the child already exited and are only logged.
    pub fn terminate_tree(&mut self) {
        if let Some(pid) = self.pid {
            kill_process_tree(pid);
        }
        if let Some(killer) = self.killer.as_mut() {
            if let Err(e) = killer.kill() {
                debug!(error = %e, "child kill request failed (likely already exited)");
            }
        }
    }

    /// Release all native resources. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if self.master.is_none() && self.output.is_none() && self.input.is_closed() {
            return;
        }
        self.input.close();
        self.output.take();
        self.killer.take();
        self.slave.take();
        self.master.take();
        debug!(pid = ?self.pid, "pseudo-terminal released");
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new("/bin/sh");
    cmd.arg("-c");
    cmd.arg(command_line);
    cmd
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new("cmd.exe");
    cmd.arg("/c");
    cmd.arg(command_line);
    cmd
}

/// The child is a session leader (the pty layer calls `setsid`), so its pid
/// doubles as the process group of everything it launched.
#[cfg(unix)]
fn kill_process_tree(pid: u32) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        debug!(pid, error = %err, "process group kill failed");
    }
}

#[cfg(windows)]
fn kill_process_tree(pid: u32) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    match std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .creation_flags(CREATE_NO_WINDOW)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
    {
        Ok(status) if !status.success() => {
            debug!(pid, code = ?status.code(), "taskkill reported failure");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(pid, error = %e, "failed to run taskkill"),
    }
}
