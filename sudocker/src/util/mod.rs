mod atomic;
mod process;
mod terminal;

pub use atomic::atomic_write;
pub use process::{is_process_alive, is_same_container_process, kill_process, terminate_then_kill};
pub use terminal::terminal_size;
