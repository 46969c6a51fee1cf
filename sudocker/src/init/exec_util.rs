//! `PATH` resolution and `execve` shared by the container init entrypoint
//! and the `exec` re-entry path.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use sudocker_shared::{SudockerError, SudockerResult};

pub fn resolve_in_path(program: &str) -> SudockerResult<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return if path.is_file() {
            Ok(path)
        } else {
            Err(SudockerError::not_found("executable file", program))
        };
    }

    let path_var = std::env::var("PATH")
        .unwrap_or_else(|_| "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into());
    for dir in path_var.split(':') {
        let candidate = Path::new(dir).join(program);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(SudockerError::not_found("executable file", program))
}

/// Replaces the current process image. Only returns on failure.
pub fn exec(path: &Path, argv: &[String]) -> SudockerResult<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| SudockerError::InvalidArgument(e.to_string()))?;
    let c_argv: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_bytes()).map_err(|e| SudockerError::InvalidArgument(e.to_string())))
        .collect::<SudockerResult<_>>()?;

    nix::unistd::execv(&c_path, &c_argv).map_err(|e| SudockerError::syscall("execve", e))?;
    unreachable!("execve replaces the process image on success");
}
