//! Host-memory buffer heap shared by the in-process devices.

use std::collections::HashMap;

use super::{BindingRole, BufferId, DeviceError, DeviceResult, KernelBindings};

/// Buffers backed by plain vectors.
///
/// Interpreting devices take buffers out for the duration of a launch (so several can be
/// borrowed mutably at once) and restore them afterwards.
#[derive(Debug, Default)]
pub struct HostHeap {
    next_id: u64,
    buffers: HashMap<BufferId, Vec<f64>>,
    taken: HashMap<BufferId, usize>,
}

impl HostHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, len: usize) -> BufferId {
        self.next_id += 1;
        let id = BufferId(self.next_id);
        self.buffers.insert(id, vec![0.0; len]);
        id
    }

    pub fn release(&mut self, id: BufferId) -> DeviceResult<()> {
        self.buffers
            .remove(&id)
            .map(|_| ())
            .ok_or(DeviceError::UnknownBuffer(id))
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len() + self.taken.len()
    }

    pub fn get(&self, id: BufferId) -> DeviceResult<&[f64]> {
        self.buffers
            .get(&id)
            .map(Vec::as_slice)
            .ok_or(DeviceError::UnknownBuffer(id))
    }

    pub fn get_mut(&mut self, id: BufferId) -> DeviceResult<&mut [f64]> {
        self.buffers
            .get_mut(&id)
            .map(Vec::as_mut_slice)
            .ok_or(DeviceError::UnknownBuffer(id))
    }

    pub fn upload(&mut self, id: BufferId, offset: usize, data: &[f64]) -> DeviceResult<()> {
        let buffer = self.get_mut(id)?;
        let range = checked_range(id, buffer.len(), offset, data.len())?;
        buffer[range].copy_from_slice(data);
        Ok(())
    }

    pub fn download(&self, id: BufferId, offset: usize, out: &mut [f64]) -> DeviceResult<()> {
        let buffer = self.get(id)?;
        let range = checked_range(id, buffer.len(), offset, out.len())?;
        out.copy_from_slice(&buffer[range]);
        Ok(())
    }

    pub fn copy(
        &mut self,
        src: BufferId,
        src_offset: usize,
        dst: BufferId,
        dst_offset: usize,
        len: usize,
    ) -> DeviceResult<()> {
        if src == dst {
            let buffer = self.get_mut(src)?;
            let from = checked_range(src, buffer.len(), src_offset, len)?;
            checked_range(dst, buffer.len(), dst_offset, len)?;
            buffer.copy_within(from, dst_offset);
            return Ok(());
        }
        let source = self.take(src)?;
        let result = checked_range(src, source.len(), src_offset, len)
            .and_then(|from| self.upload(dst, dst_offset, &source[from]));
        self.restore(src, source);
        result
    }

    /// Moves a buffer out of the heap until [`HostHeap::restore`] puts it back.
    pub fn take(&mut self, id: BufferId) -> DeviceResult<Vec<f64>> {
        let buffer = self
            .buffers
            .remove(&id)
            .ok_or(DeviceError::UnknownBuffer(id))?;
        self.taken.insert(id, buffer.len());
        Ok(buffer)
    }

    pub fn restore(&mut self, id: BufferId, buffer: Vec<f64>) {
        self.taken.remove(&id);
        self.buffers.insert(id, buffer);
    }

    /// Takes every bound buffer of a launch. On failure nothing stays taken.
    pub fn bind(&mut self, bindings: &KernelBindings) -> DeviceResult<BoundBuffers> {
        let mut bound = BoundBuffers {
            slots: Vec::with_capacity(BindingRole::ALL.len()),
        };
        for role in BindingRole::ALL {
            let slot = match bindings.get(role) {
                Some(id) => match self.take(id) {
                    Ok(data) => Some((id, data)),
                    Err(err) => {
                        self.unbind(bound);
                        return Err(err);
                    }
                },
                None => None,
            };
            bound.slots.push(slot);
        }
        Ok(bound)
    }

    pub fn unbind(&mut self, bound: BoundBuffers) {
        for (id, data) in bound.slots.into_iter().flatten() {
            self.restore(id, data);
        }
    }
}

/// Buffers moved out of a [`HostHeap`] for one launch, indexed by [`BindingRole`].
#[derive(Debug)]
pub struct BoundBuffers {
    slots: Vec<Option<(BufferId, Vec<f64>)>>,
}

impl BoundBuffers {
    pub fn get(&self, role: BindingRole) -> DeviceResult<&[f64]> {
        match &self.slots[role as usize] {
            Some((_, data)) => Ok(data.as_slice()),
            None => Err(unbound(role)),
        }
    }

    pub fn get_mut(&mut self, role: BindingRole) -> DeviceResult<&mut [f64]> {
        match &mut self.slots[role as usize] {
            Some((_, data)) => Ok(data.as_mut_slice()),
            None => Err(unbound(role)),
        }
    }

    /// Bound length of `role`, `None` when unbound.
    pub fn len(&self, role: BindingRole) -> Option<usize> {
        self.slots[role as usize].as_ref().map(|(_, data)| data.len())
    }

    /// Fails unless `role` is bound with at least `required` elements.
    pub fn require(&self, role: BindingRole, required: usize) -> DeviceResult<()> {
        match &self.slots[role as usize] {
            Some((buffer, data)) if data.len() < required => Err(DeviceError::OutOfBounds {
                buffer: *buffer,
                len: data.len(),
                required,
            }),
            Some(_) => Ok(()),
            None => Err(unbound(role)),
        }
    }

    pub fn read(&self, role: BindingRole, index: usize) -> DeviceResult<f64> {
        let data = self.get(role)?;
        data.get(index)
            .copied()
            .ok_or_else(|| self.out_of_bounds(role, data.len(), index))
    }

    pub fn write(&mut self, role: BindingRole, index: usize, value: f64) -> DeviceResult<()> {
        let data = self.get_mut(role)?;
        let len = data.len();
        match data.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(self.out_of_bounds(role, len, index)),
        }
    }

    /// Raw base pointer of `role`, null when unbound.
    pub fn as_mut_ptr(&mut self, role: BindingRole) -> *mut f64 {
        match &mut self.slots[role as usize] {
            Some((_, data)) => data.as_mut_ptr(),
            None => std::ptr::null_mut(),
        }
    }

    fn out_of_bounds(&self, role: BindingRole, len: usize, index: usize) -> DeviceError {
        match &self.slots[role as usize] {
            Some((buffer, _)) => DeviceError::OutOfBounds {
                buffer: *buffer,
                len,
                required: index + 1,
            },
            None => unbound(role),
        }
    }
}

fn unbound(role: BindingRole) -> DeviceError {
    DeviceError::execution(format!("{} buffer is not bound", role.name()))
}

fn checked_range(
    buffer: BufferId,
    len: usize,
    offset: usize,
    count: usize,
) -> DeviceResult<std::ops::Range<usize>> {
    let end = offset.checked_add(count).unwrap_or(usize::MAX);
    if end > len {
        return Err(DeviceError::OutOfBounds {
            buffer,
            len,
            required: end,
        });
    }
    Ok(offset..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_download_and_copy() {
        let mut heap = HostHeap::new();
        let a = heap.allocate(4);
        let b = heap.allocate(6);
        heap.upload(a, 0, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        heap.copy(a, 1, b, 2, 3).unwrap();
        let mut out = [0.0; 6];
        heap.download(b, 0, &mut out).unwrap();
        assert_eq!(out, [0.0, 0.0, 2.0, 3.0, 4.0, 0.0]);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mut heap = HostHeap::new();
        let a = heap.allocate(2);
        let err = heap.upload(a, 1, &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfBounds { required: 3, .. }));
    }

    #[test]
    fn released_buffers_are_unknown() {
        let mut heap = HostHeap::new();
        let a = heap.allocate(1);
        heap.release(a).unwrap();
        assert!(matches!(heap.release(a), Err(DeviceError::UnknownBuffer(_))));
        assert_eq!(heap.live_buffers(), 0);
    }

    #[test]
    fn taken_buffers_still_count_as_live() {
        let mut heap = HostHeap::new();
        let a = heap.allocate(3);
        let data = heap.take(a).unwrap();
        assert_eq!(heap.live_buffers(), 1);
        assert!(heap.get(a).is_err());
        heap.restore(a, data);
        assert_eq!(heap.get(a).unwrap().len(), 3);
    }

    #[test]
    fn failed_bind_restores_taken_buffers() {
        let mut heap = HostHeap::new();
        let input = heap.allocate(2);
        let bindings = KernelBindings {
            input: Some(input),
            output: Some(BufferId(99)),
            ..KernelBindings::default()
        };
        assert!(matches!(heap.bind(&bindings), Err(DeviceError::UnknownBuffer(_))));
        assert!(heap.get(input).is_ok());
    }

    #[test]
    fn bound_buffers_check_roles_and_bounds() {
        let mut heap = HostHeap::new();
        let partials = heap.allocate(2);
        let bindings = KernelBindings {
            partials: Some(partials),
            ..KernelBindings::default()
        };
        let mut bound = heap.bind(&bindings).unwrap();
        bound.write(BindingRole::Partials, 1, 4.0).unwrap();
        assert_eq!(bound.read(BindingRole::Partials, 1).unwrap(), 4.0);
        assert!(bound.require(BindingRole::Partials, 3).is_err());
        assert!(bound.as_mut_ptr(BindingRole::Output).is_null());
        let err = bound.read(BindingRole::Output, 0).unwrap_err();
        assert_eq!(err.to_string(), "device execution failure: output buffer is not bound");
        heap.unbind(bound);
        let mut out = [0.0; 2];
        heap.download(partials, 0, &mut out).unwrap();
        assert_eq!(out, [0.0, 4.0]);
    }
}
