use crate::driver::MemBlockType;
use crate::shader::PatcherSizes;

/// Resolution and row pitch of the display buffers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DisplayGeometry {
    pub width: u32,
    pub height: u32,
    /// Row pitch in pixels.
    pub stride: u32,
}

impl DisplayGeometry {
    /// Bytes of one A8B8G8R8 display buffer.
    #[inline]
    pub const fn buffer_size(&self) -> usize {
        4 * self.stride as usize * self.height as usize
    }
}

impl Default for DisplayGeometry {
    fn default() -> Self {
        Self {
            width: 960,
            height: 544,
            stride: 960,
        }
    }
}

/// Sizes of the command ring buffers handed to the context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingBufferSizes {
    /// Control stream ring.
    pub vdm: usize,
    pub vertex: usize,
    pub fragment: usize,
    /// Fragment micro-code ring.
    pub fragment_usse: usize,
}

impl Default for RingBufferSizes {
    fn default() -> Self {
        Self {
            vdm: 128 * 1024,
            vertex: 2 * 1024 * 1024,
            fragment: 512 * 1024,
            fragment_usse: 16 * 1024,
        }
    }
}

/// Initialization parameters for the render context.
///
/// Every field has a working default for the stock 960x544 display; override
/// only what a concrete deployment needs.
#[derive(Debug, Clone)]
pub struct RenderInit {
    pub display: DisplayGeometry,

    /// Block `present` until the display callback for the new buffer ran.
    ///
    /// Prevents tearing and bounds latency. Can be toggled at runtime.
    pub vblank_wait: bool,

    /// Wait for the GPU to drain completely before every present.
    ///
    /// Trades throughput for outputs that show corruption under heavy
    /// pipelining. Can be toggled at runtime.
    pub full_drain_on_present: bool,

    /// Memory type new textures are allocated from.
    pub texture_memblock: MemBlockType,

    pub rings: RingBufferSizes,

    pub patcher: PatcherSizes,

    /// Size of the driver's parameter buffer.
    pub parameter_buffer_size: usize,

    /// Host memory reserved for the context.
    pub host_mem_size: usize,

    /// Flips the display queue holds before `present` blocks.
    pub max_pending_swaps: u32,
}

impl Default for RenderInit {
    fn default() -> Self {
        Self {
            display: DisplayGeometry::default(),
            vblank_wait: true,
            full_drain_on_present: true,
            texture_memblock: MemBlockType::UserCdramRw,
            rings: RingBufferSizes::default(),
            patcher: PatcherSizes::default(),
            parameter_buffer_size: 16 * 1024 * 1024,
            host_mem_size: 2 * 1024,
            max_pending_swaps: 2,
        }
    }
}
