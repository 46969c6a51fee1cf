use thiserror::Error;

/// Crate-wide result alias.
pub type SudockerResult<T> = std::result::Result<T, SudockerError>;

/// Closed error taxonomy for sudocker.
///
/// Every variant maps to one of the kinds a caller needs to branch on
/// (retry, surface to the user, or treat as a bug); the wrapped syscall
/// variants always keep the syscall name and its argument summary so
/// `SystemCall` errors are diagnosable without re-running with `--debug`.
#[derive(Error, Debug)]
pub enum SudockerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("{syscall} failed ({detail})")]
    SystemCall { syscall: &'static str, detail: String },

    /// Teardown failed after the main operation already succeeded. Callers
    /// log these (`tracing::warn!`) rather than propagate them — the
    /// command itself already succeeded and should report success.
    #[error("cleanup failed after success: {0}")]
    PartialFailure(String),

    #[error("internal invariant broken: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SudockerError {
    /// Builds a [`SudockerError::SystemCall`] tagging the syscall name and a
    /// `errno`/args detail string, giving callers a uniform wrapping point
    /// instead of hand-rolling the message at every `nix`/`libc` call site.
    pub fn syscall(name: &'static str, detail: impl std::fmt::Display) -> Self {
        SudockerError::SystemCall {
            syscall: name,
            detail: detail.to_string(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        SudockerError::NotFound { kind, id: id.into() }
    }

    pub fn already_exists(kind: &'static str, id: impl Into<String>) -> Self {
        SudockerError::AlreadyExists { kind, id: id.into() }
    }

    /// Maps an error surfacing from `sudocker run` to the 125/126/127 exit
    /// code convention shared by common container runtimes. Falls back to
    /// 125 (generic runtime error) when no substring matches.
    pub fn exit_code(&self) -> i32 {
        let msg = self.to_string();
        if msg.contains("executable file not found") || msg.contains("no such file or directory") {
            127
        } else if msg.contains("permission denied") || msg.contains("is a directory") {
            126
        } else {
            125
        }
    }
}

/// Wraps a `nix::Error` (or any errno-like type) into a [`SudockerError::SystemCall`].
///
/// Usage: `unshare(flags).map_err(syscall_err!("unshare"))?;`
#[macro_export]
macro_rules! syscall_err {
    ($name:literal) => {
        |e| $crate::SudockerError::syscall($name, e)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_maps_missing_executable_to_127() {
        let err = SudockerError::SystemCall {
            syscall: "execve",
            detail: "executable file not found in $PATH".to_string(),
        };
        assert_eq!(err.exit_code(), 127);
    }

    #[test]
    fn exit_code_maps_permission_to_126() {
        let err = SudockerError::SystemCall {
            syscall: "execve",
            detail: "permission denied".to_string(),
        };
        assert_eq!(err.exit_code(), 126);
    }

    #[test]
    fn exit_code_defaults_to_125() {
        let err = SudockerError::Internal("unreachable state".to_string());
        assert_eq!(err.exit_code(), 125);
    }

    #[test]
    fn not_found_formats_with_kind_and_id() {
        let err = SudockerError::not_found("container", "c1");
        assert_eq!(err.to_string(), "container not found: c1");
    }
}
