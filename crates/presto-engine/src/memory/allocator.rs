use std::ptr::NonNull;

use bytemuck::Pod;

use crate::driver::{
    Driver, DriverError, GpuAddress, GpuRegion, MemBlockType, MemBlockUid, MemoryAttribs,
    UsseRegion,
};

/// Alignment and granularity of micro-code blocks.
const USSE_GRANULARITY: usize = 4 * 1024;

/// How an allocation is mapped for the GPU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocationKind {
    Gpu(MemoryAttribs),
    VertexUsse { offset: u32 },
    FragmentUsse { offset: u32 },
}

/// A mapped memory block.
///
/// Owns the block until it is handed back to [`GpuMemory::free`]. The bytes
/// stay valid for as long as the value exists.
#[derive(Debug)]
pub struct GpuAllocation {
    uid: MemBlockUid,
    base: NonNull<u8>,
    size: usize,
    kind: AllocationKind,
}

impl GpuAllocation {
    #[inline]
    pub fn uid(&self) -> MemBlockUid {
        self.uid
    }

    /// Size of the block after rounding to its type's granularity.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn kind(&self) -> AllocationKind {
        self.kind
    }

    #[inline]
    pub fn address(&self) -> GpuAddress {
        GpuAddress::from_ptr(self.base)
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn region(&self) -> GpuRegion {
        GpuRegion {
            base: self.address(),
            size: self.size,
        }
    }

    /// Region plus offset for micro-code blocks.
    pub fn usse_region(&self) -> Option<UsseRegion> {
        match self.kind {
            AllocationKind::VertexUsse { offset } | AllocationKind::FragmentUsse { offset } => {
                Some(UsseRegion {
                    region: self.region(),
                    offset,
                })
            }
            AllocationKind::Gpu(_) => None,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the driver keeps `size` bytes at `base` alive and mapped
        // until this allocation is freed, which consumes it.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.size) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `bytes`; `&mut self` makes the borrow exclusive on
        // the CPU side.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.size) }
    }

    /// Copies `items` into the block starting at byte `offset`.
    pub fn write<T: Pod>(&mut self, offset: usize, items: &[T]) -> Result<(), DriverError> {
        let src: &[u8] = bytemuck::cast_slice(items);
        let end = offset
            .checked_add(src.len())
            .filter(|end| *end <= self.size)
            .ok_or(DriverError::InvalidArgument("write past the end of an allocation"))?;
        self.bytes_mut()[offset..end].copy_from_slice(src);
        Ok(())
    }
}

/// One entry of a batched allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocRequest {
    Gpu {
        ty: MemBlockType,
        size: usize,
        alignment: usize,
        attribs: MemoryAttribs,
    },
    VertexUsse {
        size: usize,
    },
    FragmentUsse {
        size: usize,
    },
}

/// Allocation counters, used to check that every block is handed back.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub allocs: u64,
    pub frees: u64,
    pub live_bytes: usize,
}

impl AllocStats {
    #[inline]
    pub fn outstanding(&self) -> u64 {
        self.allocs - self.frees
    }
}

/// Uniform front-end over the driver's memory-block, GPU-mapping and
/// micro-code-mapping primitives.
#[derive(Debug, Default)]
pub struct GpuMemory {
    stats: AllocStats,
}

impl GpuMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> AllocStats {
        self.stats
    }

    /// Allocates and maps a block for GPU access.
    ///
    /// `size` is rounded up to the granularity of `ty`; the base address must
    /// honor `alignment`.
    pub fn alloc_gpu<D: Driver>(
        &mut self,
        driver: &mut D,
        ty: MemBlockType,
        size: usize,
        alignment: usize,
        attribs: MemoryAttribs,
    ) -> Result<GpuAllocation, DriverError> {
        let size = align_up(size.max(1), ty.size_granularity());
        let (uid, base) = self.acquire(driver, "gpu_mem", ty, size, alignment)?;

        if let Err(err) = driver.map_memory(GpuAddress::from_ptr(base), size, attribs) {
            release_block(driver, uid);
            return Err(err);
        }

        Ok(self.track(GpuAllocation {
            uid,
            base,
            size,
            kind: AllocationKind::Gpu(attribs),
        }))
    }

    /// Allocates and maps a block of vertex micro-code memory.
    pub fn alloc_vertex_usse<D: Driver>(
        &mut self,
        driver: &mut D,
        size: usize,
    ) -> Result<GpuAllocation, DriverError> {
        let size = align_up(size.max(1), USSE_GRANULARITY);
        let (uid, base) = self.acquire(
            driver,
            "gpu_vertex_usse",
            MemBlockType::UserRwUncache,
            size,
            USSE_GRANULARITY,
        )?;

        let offset = match driver.map_vertex_usse_memory(GpuAddress::from_ptr(base), size) {
            Ok(offset) => offset,
            Err(err) => {
                release_block(driver, uid);
                return Err(err);
            }
        };

        Ok(self.track(GpuAllocation {
            uid,
            base,
            size,
            kind: AllocationKind::VertexUsse { offset },
        }))
    }

    /// Allocates and maps a block of fragment micro-code memory.
    pub fn alloc_fragment_usse<D: Driver>(
        &mut self,
        driver: &mut D,
        size: usize,
    ) -> Result<GpuAllocation, DriverError> {
        let size = align_up(size.max(1), USSE_GRANULARITY);
        let (uid, base) = self.acquire(
            driver,
            "gpu_fragment_usse",
            MemBlockType::UserRwUncache,
            size,
            USSE_GRANULARITY,
        )?;

        let offset = match driver.map_fragment_usse_memory(GpuAddress::from_ptr(base), size) {
            Ok(offset) => offset,
            Err(err) => {
                release_block(driver, uid);
                return Err(err);
            }
        };

        Ok(self.track(GpuAllocation {
            uid,
            base,
            size,
            kind: AllocationKind::FragmentUsse { offset },
        }))
    }

    pub fn alloc<D: Driver>(
        &mut self,
        driver: &mut D,
        request: AllocRequest,
    ) -> Result<GpuAllocation, DriverError> {
        match request {
            AllocRequest::Gpu {
                ty,
                size,
                alignment,
                attribs,
            } => self.alloc_gpu(driver, ty, size, alignment, attribs),
            AllocRequest::VertexUsse { size } => self.alloc_vertex_usse(driver, size),
            AllocRequest::FragmentUsse { size } => self.alloc_fragment_usse(driver, size),
        }
    }

    /// Performs every request or none of them.
    ///
    /// On failure the allocations already made are freed in reverse order.
    pub fn alloc_batch<D: Driver, const N: usize>(
        &mut self,
        driver: &mut D,
        requests: [AllocRequest; N],
    ) -> Result<[GpuAllocation; N], DriverError> {
        let mut done = Vec::with_capacity(N);
        for request in requests {
            match self.alloc(driver, request) {
                Ok(allocation) => done.push(allocation),
                Err(err) => {
                    self.free_all(driver, done);
                    return Err(err);
                }
            }
        }
        Ok(done
            .try_into()
            .unwrap_or_else(|_| unreachable!("{N} successful requests yield {N} allocations")))
    }

    /// Unmaps and frees a block.
    ///
    /// Teardown cannot be retried, so driver errors are logged rather than
    /// returned.
    pub fn free<D: Driver>(&mut self, driver: &mut D, allocation: GpuAllocation) {
        let base = allocation.address();
        let unmapped = match allocation.kind {
            AllocationKind::Gpu(_) => driver.unmap_memory(base),
            AllocationKind::VertexUsse { .. } => driver.unmap_vertex_usse_memory(base),
            AllocationKind::FragmentUsse { .. } => driver.unmap_fragment_usse_memory(base),
        };
        if let Err(err) = unmapped {
            log::warn!("failed to unmap memory block {:?}: {err}", allocation.uid);
        }
        release_block(driver, allocation.uid);

        self.stats.frees += 1;
        self.stats.live_bytes = self.stats.live_bytes.saturating_sub(allocation.size);
    }

    /// Frees `allocations` last-to-first.
    pub fn free_all<D: Driver>(&mut self, driver: &mut D, allocations: Vec<GpuAllocation>) {
        for allocation in allocations.into_iter().rev() {
            self.free(driver, allocation);
        }
    }

    fn acquire<D: Driver>(
        &mut self,
        driver: &mut D,
        name: &str,
        ty: MemBlockType,
        size: usize,
        alignment: usize,
    ) -> Result<(MemBlockUid, NonNull<u8>), DriverError> {
        let uid = driver.alloc_mem_block(name, ty, size)?;
        let base = match driver.mem_block_base(uid) {
            Ok(base) => base,
            Err(err) => {
                release_block(driver, uid);
                return Err(err);
            }
        };

        let address = GpuAddress::from_ptr(base);
        if !address.is_aligned(alignment) {
            release_block(driver, uid);
            return Err(DriverError::Misaligned {
                address: address.0,
                alignment,
            });
        }

        Ok((uid, base))
    }

    fn track(&mut self, allocation: GpuAllocation) -> GpuAllocation {
        self.stats.allocs += 1;
        self.stats.live_bytes += allocation.size;
        log::trace!(
            "mapped block {:?}: {} bytes at {:#x} ({:?})",
            allocation.uid,
            allocation.size,
            allocation.address().0,
            allocation.kind
        );
        allocation
    }
}

fn release_block<D: Driver>(driver: &mut D, uid: MemBlockUid) {
    if let Err(err) = driver.free_mem_block(uid) {
        log::warn!("failed to free memory block {uid:?}: {err}");
    }
}

#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::headless::{HeadlessConfig, HeadlessDriver};

    fn driver() -> HeadlessDriver {
        HeadlessDriver::new(HeadlessConfig::for_tests())
    }

    #[test]
    fn align_up_rounds_to_multiples() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(5, 0), 5);
    }

    #[test]
    fn cdram_blocks_round_to_256k() {
        let mut driver = driver();
        let mut memory = GpuMemory::new();

        let a = memory
            .alloc_gpu(&mut driver, MemBlockType::UserCdramRw, 100, 16, MemoryAttribs::ReadWrite)
            .unwrap();
        assert_eq!(a.size(), 256 * 1024);

        let b = memory
            .alloc_gpu(&mut driver, MemBlockType::UserRwUncache, 5000, 4, MemoryAttribs::Read)
            .unwrap();
        assert_eq!(b.size(), 8 * 1024);

        memory.free(&mut driver, a);
        memory.free(&mut driver, b);
        assert_eq!(memory.stats().outstanding(), 0);
        assert_eq!(memory.stats().live_bytes, 0);
        assert_eq!(driver.live_mem_blocks(), 0);
    }

    #[test]
    fn usse_blocks_report_offsets() {
        let mut driver = driver();
        let mut memory = GpuMemory::new();

        let v = memory.alloc_vertex_usse(&mut driver, 1024).unwrap();
        let f = memory.alloc_fragment_usse(&mut driver, 1024).unwrap();
        assert!(matches!(v.kind(), AllocationKind::VertexUsse { .. }));
        assert!(matches!(f.kind(), AllocationKind::FragmentUsse { .. }));
        assert_eq!(v.usse_region().unwrap().region.size, 4096);

        memory.free(&mut driver, f);
        memory.free(&mut driver, v);
        assert_eq!(driver.live_mem_blocks(), 0);
    }

    #[test]
    fn write_stays_inside_the_block() {
        let mut driver = driver();
        let mut memory = GpuMemory::new();
        let mut a = memory
            .alloc_gpu(&mut driver, MemBlockType::UserRw, 8, 4, MemoryAttribs::Read)
            .unwrap();

        a.write(0, &[1u16, 2, 3, 4]).unwrap();
        assert_eq!(&a.bytes()[..8], &[1, 0, 2, 0, 3, 0, 4, 0]);
        assert!(a.write(a.size() - 1, &[0u16]).is_err());

        memory.free(&mut driver, a);
    }

    #[test]
    fn failed_batch_leaves_nothing_behind() {
        let mut driver = driver();
        let mut memory = GpuMemory::new();
        driver.fail_allocation_after(2);

        let result = memory.alloc_batch(
            &mut driver,
            [
                AllocRequest::VertexUsse { size: 64 },
                AllocRequest::FragmentUsse { size: 64 },
                AllocRequest::Gpu {
                    ty: MemBlockType::UserRw,
                    size: 64,
                    alignment: 4,
                    attribs: MemoryAttribs::Read,
                },
            ],
        );

        assert_eq!(result.err(), Some(DriverError::OutOfMemory));
        assert_eq!(memory.stats().outstanding(), 0);
        assert_eq!(driver.live_mem_blocks(), 0);
    }
}
