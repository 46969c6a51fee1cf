//! Container process staging: the clone/cgroup/sync handshake between
//! the orchestrator and the containerized init process, plus the
//! `setns`-based re-entry used by `exec`.

mod child;
mod exec;
mod exec_util;
mod parent;
mod sync;

pub use child::run_container_init_process;
pub use exec::{maybe_reexec, spawn_exec_reentry};
pub use parent::{spawn, ChildLifecycleState, ChildStdio, SpawnedChild};
pub use sync::{SyncChannel, SyncMessage};
