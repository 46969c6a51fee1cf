//! cgroup v1/v2 resource manager.

mod convert;
mod manager;
mod v1;
mod v2;

pub use manager::{detect, Manager};
