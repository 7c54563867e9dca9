//! Sparse host-backed device address space.
//!
//! Every allocation gets its own zeroed host block, mapped at a
//! page-aligned device address. Addresses are never reused and a guard page
//! separates neighbouring allocations, so stale pointers fail validation
//! instead of aliasing newer memory.

use std::collections::BTreeMap;

use flowrt_device::driver::{DevicePointer, Platform};
use flowrt_device::error::{DeviceError, DeviceResult};
use parking_lot::Mutex;

/// Granularity of the simulated address space.
pub const PAGE_SIZE: usize = 4096;

struct AddressSpace {
    blocks: BTreeMap<usize, Vec<u8>>,
    next_addr: usize,
    allocated_bytes: usize,
}

pub(crate) struct DeviceMemory {
    space: Mutex<AddressSpace>,
}

impl DeviceMemory {
    pub(crate) fn new(base_address: usize) -> Self {
        Self {
            space: Mutex::new(AddressSpace {
                blocks: BTreeMap::new(),
                next_addr: base_address,
                allocated_bytes: 0,
            }),
        }
    }

    pub(crate) fn alloc(&self, size: usize) -> DeviceResult<DevicePointer> {
        let mut space = self.space.lock();
        let span = size
            .max(1)
            .checked_next_multiple_of(PAGE_SIZE)
            .and_then(|span| span.checked_add(PAGE_SIZE))
            .ok_or(DeviceError::OutOfMemory { requested: size })?;
        let addr = space.next_addr;
        space.next_addr = addr
            .checked_add(span)
            .ok_or(DeviceError::OutOfMemory { requested: size })?;

        let mut block = Vec::new();
        block
            .try_reserve_exact(size)
            .map_err(|_| DeviceError::OutOfMemory { requested: size })?;
        block.resize(size, 0);

        space.blocks.insert(addr, block);
        space.allocated_bytes += size;
        Ok(DevicePointer::new(addr, Platform::Simulated))
    }

    pub(crate) fn free(&self, ptr: DevicePointer) -> DeviceResult<()> {
        let mut space = self.space.lock();
        match space.blocks.remove(&ptr.addr()) {
            Some(block) => {
                space.allocated_bytes -= block.len();
                Ok(())
            }
            None => Err(DeviceError::InvalidPointer {
                addr: ptr.addr(),
                len: 0,
            }),
        }
    }

    /// Check that `[ptr, ptr + len)` lies inside one live allocation.
    pub(crate) fn validate(&self, ptr: DevicePointer, len: usize) -> DeviceResult<()> {
        let space = self.space.lock();
        locate(&space.blocks, ptr, len).map(|_| ())
    }

    /// Copy out of device memory into `dst`.
    pub(crate) fn read(&self, ptr: DevicePointer, dst: &mut [u8]) -> DeviceResult<()> {
        let space = self.space.lock();
        let (base, block) = locate(&space.blocks, ptr, dst.len())?;
        let offset = ptr.addr() - base;
        dst.copy_from_slice(&block[offset..offset + dst.len()]);
        Ok(())
    }

    /// Copy `src` into device memory.
    pub(crate) fn write(&self, ptr: DevicePointer, src: &[u8]) -> DeviceResult<()> {
        let mut space = self.space.lock();
        let (base, _) = locate(&space.blocks, ptr, src.len())?;
        let offset = ptr.addr() - base;
        if let Some(block) = space.blocks.get_mut(&base) {
            block[offset..offset + src.len()].copy_from_slice(src);
        }
        Ok(())
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.space.lock().blocks.len()
    }

    pub(crate) fn allocated_bytes(&self) -> usize {
        self.space.lock().allocated_bytes
    }
}

fn locate(
    blocks: &BTreeMap<usize, Vec<u8>>,
    ptr: DevicePointer,
    len: usize,
) -> DeviceResult<(usize, &Vec<u8>)> {
    let invalid = || DeviceError::InvalidPointer {
        addr: ptr.addr(),
        len,
    };
    if ptr.platform() != Platform::Simulated {
        return Err(invalid());
    }
    let (&base, block) = blocks.range(..=ptr.addr()).next_back().ok_or_else(invalid)?;
    let offset = ptr.addr() - base;
    match offset.checked_add(len) {
        Some(end) if end <= block.len() => Ok((base, block)),
        _ => Err(invalid()),
    }
}
