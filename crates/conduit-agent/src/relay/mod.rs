//! Relay module: pipes one accepted connection to the local backend.
//!
//! - `copy`: one direction of byte forwarding
//! - `task`: the per-connection relay and its lifecycle
//! - `tracker`: registry of relays currently in flight

mod copy;
mod task;
mod tracker;

pub use copy::{DirectionEnd, copy_direction};
pub use task::{ConnectionRelay, RelayConfig, RelayReport, RelayState, RelayStats};
pub use tracker::{RelaySnapshot, RelayTracker};
