//! Error taxonomy for the pseudo-terminal layer.
//!
//! Only failures that callers must act on are represented here. Broken pipes
//! on the output stream and "process already gone" on kill are expected at the
//! end of every session and never reach this type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtyError {
    /// Pseudo-console or pipe creation failed. Everything acquired so far has
    /// already been released.
    #[error("failed to allocate pseudo-terminal: {detail}")]
    Allocation { detail: String },

    /// The child process could not be created. The session is still valid and
    /// must be disposed by the caller.
    #[error("failed to spawn `{command}` (os error {code:?}): {detail}")]
    Spawn {
        command: String,
        code: Option<i32>,
        detail: String,
    },

    /// `start` was called while a session is still active.
    #[error("a session is already running (pid {pid:?}); stop it before starting another")]
    AlreadyRunning { pid: Option<u32> },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PtyError {
    pub(crate) fn allocation(err: impl std::fmt::Display) -> Self {
        Self::Allocation {
            detail: err.to_string(),
        }
    }

    /// Build a spawn error, recovering the native error code when the
    /// underlying failure carries an `io::Error`.
    pub(crate) fn spawn(command: &str, err: anyhow::Error) -> Self {
        let code = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<std::io::Error>())
            .and_then(std::io::Error::raw_os_error);
        Self::Spawn {
            command: command.to_string(),
            code,
            detail: format!("{err:#}"),
        }
    }
}

pub type Result<T, E = PtyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_error_recovers_os_code() {
        let io = std::io::Error::from_raw_os_error(2);
        let err = PtyError::spawn("missing.sh", anyhow::Error::new(io).context("spawn failed"));
        match err {
            PtyError::Spawn { code, ref command, .. } => {
                assert_eq!(code, Some(2));
                assert_eq!(command, "missing.sh");
            }
            other => panic!("expected Spawn, got {other:?}"),
        }
    }

    #[test]
    fn spawn_error_without_io_cause_has_no_code() {
        let err = PtyError::spawn("x", anyhow::anyhow!("not an io error"));
        assert!(matches!(err, PtyError::Spawn { code: None, .. }));
    }

    #[test]
    fn already_running_message_mentions_pid() {
        let err = PtyError::AlreadyRunning { pid: Some(42) };
        assert!(err.to_string().contains("42"));
    }
}
