//! Device buffers grouped by the graph generation that owns them.
//!
//! Every compiled chain allocates its working buffers (spill values, partial sums, reduction
//! results, regression basis/design/target and coefficients) under the generation of the slot
//! that compiled it. Changing the slot's version or disposing the slot releases the whole
//! generation in one call, so no individual buffer can outlive its chain.
//!
//! ```text
//! DeviceArena
//!   |
//!   +-- Generation { slot: 1, version: 3 } -> [values, partials, results, ...]
//!   |
//!   +-- Generation { slot: 2, version: 1 } -> [basis, design, target, coeffs]
//! ```
//!
//! Releases are best effort: a buffer the device refuses to free is logged and forgotten.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::device::{BufferId, Device, DeviceResult};

/// Identity of one compiled graph: slot id plus version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation {
    pub slot: usize,
    pub version: usize,
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    buffer: BufferId,
    label: &'static str,
    len: usize,
}

#[derive(Debug, Default)]
pub struct DeviceArena {
    generations: HashMap<Generation, Vec<Allocation>>,
}

impl DeviceArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(
        &mut self,
        device: &dyn Device,
        generation: Generation,
        label: &'static str,
        len: usize,
    ) -> DeviceResult<BufferId> {
        let buffer = device.allocate(len)?;
        self.generations
            .entry(generation)
            .or_default()
            .push(Allocation { buffer, label, len });
        Ok(buffer)
    }

    /// Buffers currently owned by `generation`.
    pub fn live_buffers(&self, generation: Generation) -> usize {
        self.generations.get(&generation).map_or(0, Vec::len)
    }

    /// Releases every buffer of `generation`; returns how many were freed without error.
    pub fn release_generation(&mut self, device: &dyn Device, generation: Generation) -> usize {
        let Some(allocations) = self.generations.remove(&generation) else {
            return 0;
        };
        let mut released = 0;
        for allocation in allocations {
            match device.release(allocation.buffer) {
                Ok(()) => released += 1,
                Err(err) => warn!(
                    slot = generation.slot,
                    version = generation.version,
                    buffer = %allocation.buffer,
                    label = allocation.label,
                    len = allocation.len,
                    error = %err,
                    "failed to release device buffer"
                ),
            }
        }
        debug!(
            slot = generation.slot,
            version = generation.version,
            released,
            "released generation"
        );
        released
    }

    pub fn release_all(&mut self, device: &dyn Device) {
        let mut generations: Vec<Generation> = self.generations.keys().copied().collect();
        generations.sort_unstable();
        for generation in generations {
            self.release_generation(device, generation);
        }
    }
}
