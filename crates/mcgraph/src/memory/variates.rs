use tracing::{debug, warn};

use crate::device::{BufferId, Device, DeviceResult};
use crate::rng::{NormalGenerator, MT_BLOCK};

/// Context-wide pool of standard-normal draws.
///
/// The pool only grows. Growing copies the existing draws device-to-device and generates the
/// tail from the same generator, so draws handed out earlier never change.
#[derive(Clone, Default)]
pub struct VariatePool {
    buffer: Option<BufferId>,
    capacity: usize,
    generator: Option<NormalGenerator>,
}

impl VariatePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Makes at least `required` draws available and returns how many were generated.
    ///
    /// `seed` is only used the first time the pool generates anything.
    pub fn ensure(&mut self, device: &dyn Device, required: usize, seed: u32) -> DeviceResult<usize> {
        if required <= self.capacity {
            return Ok(0);
        }
        let capacity = required.div_ceil(MT_BLOCK) * MT_BLOCK;
        let mut generator = self
            .generator
            .clone()
            .unwrap_or_else(|| NormalGenerator::new(seed));

        let mut tail = vec![0.0; capacity - self.capacity];
        for block in tail.chunks_exact_mut(MT_BLOCK) {
            generator.next_normal_block(block);
        }

        let buffer = device.allocate(capacity)?;
        let filled = match self.buffer {
            Some(old) => device.copy(old, 0, buffer, 0, self.capacity),
            None => Ok(()),
        }
        .and_then(|()| device.upload(buffer, self.capacity, &tail));
        if let Err(err) = filled {
            if let Err(release) = device.release(buffer) {
                warn!(buffer = %buffer, error = %release, "failed to release variate buffer");
            }
            return Err(err);
        }

        if let Some(old) = self.buffer.replace(buffer) {
            if let Err(err) = device.release(old) {
                warn!(buffer = %old, error = %err, "failed to release previous variate buffer");
            }
        }
        debug!(
            previous = self.capacity,
            capacity,
            "grew variate pool"
        );
        let generated = capacity - self.capacity;
        self.capacity = capacity;
        self.generator = Some(generator);
        Ok(generated)
    }

    pub fn release(&mut self, device: &dyn Device) {
        if let Some(buffer) = self.buffer.take() {
            if let Err(err) = device.release(buffer) {
                warn!(buffer = %buffer, error = %err, "failed to release variate buffer");
            }
        }
        self.capacity = 0;
        self.generator = None;
    }
}
