use crate::driver::{
    ContextParams, Driver, DriverError, MemBlockType, MemoryAttribs, UsseRegion,
};
use crate::memory::{AllocRequest, GpuAllocation, GpuMemory};

use super::init::RingBufferSizes;

/// Command ring buffers a context streams into.
#[derive(Debug)]
pub(crate) struct RingBuffers {
    vdm: GpuAllocation,
    vertex: GpuAllocation,
    fragment: GpuAllocation,
    fragment_usse: GpuAllocation,
    fragment_usse_region: UsseRegion,
}

impl RingBuffers {
    pub(crate) fn create<D: Driver>(
        driver: &mut D,
        memory: &mut GpuMemory,
        sizes: &RingBufferSizes,
    ) -> Result<Self, DriverError> {
        let ring = |size| AllocRequest::Gpu {
            ty: MemBlockType::UserRwUncache,
            size,
            alignment: 4,
            attribs: MemoryAttribs::Read,
        };

        let [vdm, vertex, fragment, fragment_usse] = memory.alloc_batch(
            driver,
            [
                ring(sizes.vdm),
                ring(sizes.vertex),
                ring(sizes.fragment),
                AllocRequest::FragmentUsse {
                    size: sizes.fragment_usse,
                },
            ],
        )?;
        let Some(fragment_usse_region) = fragment_usse.usse_region() else {
            unreachable!("a fragment micro-code request yields a micro-code allocation")
        };

        Ok(Self {
            vdm,
            vertex,
            fragment,
            fragment_usse,
            fragment_usse_region,
        })
    }

    pub(crate) fn context_params(&self, host_mem_size: usize) -> ContextParams {
        ContextParams {
            host_mem_size,
            vdm_ring: self.vdm.region(),
            vertex_ring: self.vertex.region(),
            fragment_ring: self.fragment.region(),
            fragment_usse_ring: self.fragment_usse_region,
        }
    }

    /// Frees fragment micro-code, fragment, vertex, then VDM.
    ///
    /// The context using them must already be destroyed.
    pub(crate) fn destroy<D: Driver>(self, driver: &mut D, memory: &mut GpuMemory) {
        memory.free_all(
            driver,
            vec![self.vdm, self.vertex, self.fragment, self.fragment_usse],
        );
    }
}
