use crate::driver::{
    Driver, DriverError, MemBlockType, MemoryAttribs, PatcherHandle, ShaderPatcherParams,
};
use crate::memory::{AllocRequest, GpuAllocation, GpuMemory};

/// Sizes of the three memory regions a shader patcher works in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PatcherSizes {
    pub buffer: usize,
    pub vertex_usse: usize,
    pub fragment_usse: usize,
}

impl Default for PatcherSizes {
    fn default() -> Self {
        Self {
            buffer: 64 * 1024,
            vertex_usse: 64 * 1024,
            fragment_usse: 64 * 1024,
        }
    }
}

/// A shader patcher together with the memory it owns.
#[derive(Debug)]
pub struct ShaderPatcher {
    handle: PatcherHandle,
    buffer: GpuAllocation,
    vertex_usse: GpuAllocation,
    fragment_usse: GpuAllocation,
}

impl ShaderPatcher {
    pub fn create<D: Driver>(
        driver: &mut D,
        memory: &mut GpuMemory,
        sizes: &PatcherSizes,
    ) -> Result<Self, DriverError> {
        let [buffer, vertex_usse, fragment_usse] = memory.alloc_batch(
            driver,
            [
                AllocRequest::Gpu {
                    ty: MemBlockType::UserRwUncache,
                    size: sizes.buffer,
                    alignment: 4,
                    attribs: MemoryAttribs::ReadWrite,
                },
                AllocRequest::VertexUsse {
                    size: sizes.vertex_usse,
                },
                AllocRequest::FragmentUsse {
                    size: sizes.fragment_usse,
                },
            ],
        )?;

        let params = match (vertex_usse.usse_region(), fragment_usse.usse_region()) {
            (Some(vertex), Some(fragment)) => ShaderPatcherParams {
                buffer: buffer.region(),
                vertex_usse: vertex,
                fragment_usse: fragment,
            },
            _ => unreachable!("micro-code requests yield micro-code allocations"),
        };

        match driver.create_shader_patcher(&params) {
            Ok(handle) => {
                log::debug!("shader patcher created");
                Ok(Self {
                    handle,
                    buffer,
                    vertex_usse,
                    fragment_usse,
                })
            }
            Err(err) => {
                memory.free_all(driver, vec![buffer, vertex_usse, fragment_usse]);
                Err(err)
            }
        }
    }

    #[inline]
    pub fn handle(&self) -> PatcherHandle {
        self.handle
    }

    /// Destroys the patcher, then frees fragment micro-code, vertex
    /// micro-code and the buffer.
    ///
    /// Every program registered with it must be unregistered first.
    pub fn destroy<D: Driver>(self, driver: &mut D, memory: &mut GpuMemory) {
        if let Err(err) = driver.destroy_shader_patcher(self.handle) {
            log::warn!("failed to destroy shader patcher: {err}");
        }
        memory.free_all(driver, vec![self.buffer, self.vertex_usse, self.fragment_usse]);
    }
}
