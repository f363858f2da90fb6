//! Device memory owned by a compute context.

pub mod arena;
pub mod variates;

pub use arena::{DeviceArena, Generation};
pub use variates::VariatePool;
