use std::ptr::NonNull;

use crate::texture::TextureFormat;

/// CPU-visible address of GPU-mapped memory.
///
/// Addresses cross the driver boundary as plain integers so that they can be
/// captured by display callbacks running on another thread.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuAddress(pub usize);

impl GpuAddress {
    #[inline]
    pub fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self(ptr.as_ptr() as usize)
    }

    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    #[inline]
    pub const fn is_aligned(self, alignment: usize) -> bool {
        alignment == 0 || self.0 % alignment == 0
    }
}

/// Kernel memory-block types used for GPU allocations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemBlockType {
    /// Cached main memory.
    UserRw,
    /// Uncached main memory (ring buffers, micro-code, index data).
    UserRwUncache,
    /// Video memory.
    UserCdramRw,
}

impl MemBlockType {
    /// Sizes of blocks of this type are rounded up to this many bytes.
    pub const fn size_granularity(self) -> usize {
        match self {
            MemBlockType::UserCdramRw => 256 * 1024,
            MemBlockType::UserRw | MemBlockType::UserRwUncache => 4 * 1024,
        }
    }
}

/// Access granted to the GPU when mapping a block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryAttribs {
    Read,
    ReadWrite,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InitializeParams {
    pub display_queue_max_pending: u32,
    pub parameter_buffer_size: usize,
}

/// A contiguous GPU-mapped region handed to the driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GpuRegion {
    pub base: GpuAddress,
    pub size: usize,
}

impl GpuRegion {
    #[inline]
    pub fn contains(&self, addr: GpuAddress) -> bool {
        addr >= self.base && addr.0 < self.base.0 + self.size
    }
}

/// A micro-code region together with the offset the driver assigned to it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UsseRegion {
    pub region: GpuRegion,
    pub offset: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ContextParams {
    pub host_mem_size: usize,
    pub vdm_ring: GpuRegion,
    pub vertex_ring: GpuRegion,
    pub fragment_ring: GpuRegion,
    pub fragment_usse_ring: UsseRegion,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum MultisampleMode {
    #[default]
    None,
    X2,
    X4,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RenderTargetParams {
    pub width: u32,
    pub height: u32,
    pub scenes_per_frame: u32,
    pub multisample: MultisampleMode,
}

impl RenderTargetParams {
    pub fn single_scene(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            scenes_per_frame: 1,
            multisample: MultisampleMode::None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ColorFormat {
    A8B8G8R8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SurfaceLayout {
    Linear,
    Tiled,
}

/// Color render surface over a block of pixel memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ColorSurface {
    pub format: ColorFormat,
    pub layout: SurfaceLayout,
    pub width: u32,
    pub height: u32,
    /// Row pitch in pixels.
    pub stride: u32,
    pub data: GpuAddress,
}

impl ColorSurface {
    pub fn linear(format: ColorFormat, width: u32, height: u32, stride: u32, data: GpuAddress) -> Self {
        Self {
            format,
            layout: SurfaceLayout::Linear,
            width,
            height,
            stride,
            data,
        }
    }

    pub const fn bytes_per_pixel(&self) -> u32 {
        match self.format {
            ColorFormat::A8B8G8R8 => 4,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DepthStencilFormat {
    S8D24,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DepthStencilSurface {
    pub format: DepthStencilFormat,
    pub layout: SurfaceLayout,
    pub stride_in_samples: u32,
    pub depth: GpuAddress,
    pub stencil: Option<GpuAddress>,
}

impl DepthStencilSurface {
    pub fn tiled(stride_in_samples: u32, depth: GpuAddress, stencil: Option<GpuAddress>) -> Self {
        Self {
            format: DepthStencilFormat::S8D24,
            layout: SurfaceLayout::Tiled,
            stride_in_samples,
            depth,
            stencil,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StencilFunc {
    Never,
    Less,
    Equal,
    NotEqual,
    Always,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    Increment,
    Decrement,
    Invert,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StencilState {
    pub func: StencilFunc,
    pub stencil_fail: StencilOp,
    pub depth_fail: StencilOp,
    pub depth_pass: StencilOp,
    pub compare_mask: u8,
    pub write_mask: u8,
    pub reference: u8,
}

impl StencilState {
    /// Always passes, never writes, reference 1.
    pub const PASSTHROUGH: Self = Self {
        func: StencilFunc::Always,
        stencil_fail: StencilOp::Keep,
        depth_fail: StencilOp::Keep,
        depth_pass: StencilOp::Keep,
        compare_mask: 0xFF,
        write_mask: 0xFF,
        reference: 1,
    };
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ShaderPatcherParams {
    pub buffer: GpuRegion,
    pub vertex_usse: UsseRegion,
    pub fragment_usse: UsseRegion,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttributeFormat {
    U8,
    U16,
    F32,
}

impl AttributeFormat {
    pub const fn size(self) -> usize {
        match self {
            AttributeFormat::U8 => 1,
            AttributeFormat::U16 => 2,
            AttributeFormat::F32 => 4,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VertexAttribute {
    pub stream_index: u16,
    pub offset: u16,
    pub format: AttributeFormat,
    pub component_count: u8,
    pub reg_index: u32,
}

impl VertexAttribute {
    pub const fn byte_len(&self) -> usize {
        self.format.size() * self.component_count as usize
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IndexSource {
    Index16Bit,
    Index32Bit,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VertexStream {
    pub stride: u16,
    pub index_source: IndexSource,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OutputRegisterFormat {
    Uchar4,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlendFunc {
    None,
    Add,
    Subtract,
    ReverseSubtract,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ColorMask(pub u8);

impl ColorMask {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0xF);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlendInfo {
    pub color_func: BlendFunc,
    pub alpha_func: BlendFunc,
    pub color_src: BlendFactor,
    pub color_dst: BlendFactor,
    pub alpha_src: BlendFactor,
    pub alpha_dst: BlendFactor,
    pub color_mask: ColorMask,
}

impl BlendInfo {
    /// Blending off, every channel written.
    pub const DISABLED: Self = Self {
        color_func: BlendFunc::None,
        alpha_func: BlendFunc::None,
        color_src: BlendFactor::Zero,
        color_dst: BlendFactor::Zero,
        alpha_src: BlendFactor::Zero,
        alpha_dst: BlendFactor::Zero,
        color_mask: ColorMask::ALL,
    };
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Primitive {
    Triangles,
    TriangleStrip,
    TriangleFan,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub const fn size(self) -> usize {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum TextureFilter {
    #[default]
    Point,
    Linear,
}

/// Linear texture descriptor.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TextureDesc {
    pub data: GpuAddress,
    pub palette: Option<GpuAddress>,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub mip_count: u32,
    pub min_filter: TextureFilter,
    pub mag_filter: TextureFilter,
}

impl TextureDesc {
    pub fn linear(data: GpuAddress, format: TextureFormat, width: u32, height: u32) -> Self {
        Self {
            data,
            palette: None,
            format,
            width,
            height,
            mip_count: 0,
            min_filter: TextureFilter::Point,
            mag_filter: TextureFilter::Point,
        }
    }

    /// Row pitch in bytes of the linear layout.
    pub fn stride(&self) -> u32 {
        self.format.stride(self.width)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DisplayPixelFormat {
    A8B8G8R8,
}

/// Frame buffer description handed to the display controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameBuf {
    pub base: GpuAddress,
    /// Row pitch in pixels.
    pub pitch: u32,
    pub pixel_format: DisplayPixelFormat,
    pub width: u32,
    pub height: u32,
}

/// When a new frame buffer takes effect.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SetBufSync {
    Immediate,
    NextFrame,
}

/// Payload carried by a display-queue entry to the display callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DisplayData {
    pub address: GpuAddress,
}
