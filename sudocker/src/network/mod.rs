//! Bridge-based container networking and the thin network service layer
//! over it.

mod bridge;
mod netns;
mod service;

pub use bridge::BridgeDriver;
pub use service::NetworkService;
