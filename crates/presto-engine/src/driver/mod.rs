//! Platform seam.
//!
//! This module is responsible for:
//! - the `Driver` trait: the primitive GPU operations the subsystem relies on
//! - the `Display` trait: the display controller reached from the display callback
//! - plain-data descriptors and handle types passed across that seam
//!
//! `headless` is an in-process implementation backed by host memory and a
//! software rasterizer.

pub mod headless;
mod types;

use std::ptr::NonNull;

use crate::shader::{Program, ProgramParameter};

pub use types::{
    AttributeFormat, BlendFactor, BlendFunc, BlendInfo, ColorFormat, ColorMask, ColorSurface,
    ContextParams, DepthStencilFormat, DepthStencilSurface, DisplayData, DisplayPixelFormat,
    FrameBuf, GpuAddress, GpuRegion, IndexFormat, IndexSource, InitializeParams, MemBlockType,
    MemoryAttribs, MultisampleMode, OutputRegisterFormat, Primitive, RenderTargetParams,
    SetBufSync, ShaderPatcherParams, StencilFunc, StencilOp, StencilState, SurfaceLayout,
    TextureDesc, TextureFilter, UsseRegion, VertexAttribute, VertexStream,
};

/// Failure reported by a driver call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("native call failed with code {0:#010x}")]
    Native(i32),
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("resource still in use: {0}")]
    InUse(&'static str),
    #[error("address {address:#x} is not aligned to {alignment} bytes")]
    Misaligned { address: usize, alignment: usize },
    #[error("driver is not initialized")]
    Uninitialized,
    #[error("display queue is closed")]
    DisplayQueueClosed,
}

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub struct $name(pub u32);
    };
}

handle!(
    /// Kernel memory-block identifier.
    MemBlockUid
);
handle!(ContextHandle);
handle!(RenderTargetHandle);
handle!(
    /// GPU/display synchronization primitive.
    SyncObject
);
handle!(PatcherHandle);
handle!(
    /// A program registered with a shader patcher.
    ProgramId
);
handle!(VertexProgramHandle);
handle!(FragmentProgramHandle);
handle!(
    /// Default vertex uniform buffer reserved for the next draw.
    UniformBuffer
);

/// Called by the display queue once per entry, on the display thread.
pub type DisplayCallback = Box<dyn FnMut(&DisplayData) + Send + 'static>;

/// The display controller as seen from the display callback.
pub trait Display: Send + Sync + 'static {
    fn set_frame_buf(&self, frame: &FrameBuf, sync: SetBufSync) -> Result<(), DriverError>;

    /// Blocks until the next vertical blank starts.
    fn wait_vblank_start(&self);
}

/// Primitive GPU operations used by the presentation subsystem.
///
/// All calls come from a single thread. Only the display callback runs
/// elsewhere, and it only ever touches the [`Display`].
pub trait Driver {
    type Display: Display + Clone;

    fn initialize(
        &mut self,
        params: &InitializeParams,
        on_display: DisplayCallback,
    ) -> Result<(), DriverError>;

    /// Stops the display queue and shuts the library down.
    fn terminate(&mut self);

    fn display(&self) -> Self::Display;

    // ── memory ────────────────────────────────────────────────────────────

    fn alloc_mem_block(
        &mut self,
        name: &str,
        ty: MemBlockType,
        size: usize,
    ) -> Result<MemBlockUid, DriverError>;

    fn mem_block_base(&self, uid: MemBlockUid) -> Result<NonNull<u8>, DriverError>;

    fn free_mem_block(&mut self, uid: MemBlockUid) -> Result<(), DriverError>;

    fn map_memory(
        &mut self,
        base: GpuAddress,
        size: usize,
        attribs: MemoryAttribs,
    ) -> Result<(), DriverError>;

    fn unmap_memory(&mut self, base: GpuAddress) -> Result<(), DriverError>;

    /// Maps a block as vertex micro-code memory and returns its offset.
    fn map_vertex_usse_memory(&mut self, base: GpuAddress, size: usize) -> Result<u32, DriverError>;

    fn unmap_vertex_usse_memory(&mut self, base: GpuAddress) -> Result<(), DriverError>;

    /// Maps a block as fragment micro-code memory and returns its offset.
    fn map_fragment_usse_memory(
        &mut self,
        base: GpuAddress,
        size: usize,
    ) -> Result<u32, DriverError>;

    fn unmap_fragment_usse_memory(&mut self, base: GpuAddress) -> Result<(), DriverError>;

    // ── context objects ───────────────────────────────────────────────────

    fn create_context(&mut self, params: &ContextParams) -> Result<ContextHandle, DriverError>;

    fn destroy_context(&mut self, ctx: ContextHandle) -> Result<(), DriverError>;

    fn create_render_target(
        &mut self,
        params: &RenderTargetParams,
    ) -> Result<RenderTargetHandle, DriverError>;

    fn destroy_render_target(&mut self, target: RenderTargetHandle) -> Result<(), DriverError>;

    fn create_sync_object(&mut self) -> Result<SyncObject, DriverError>;

    fn destroy_sync_object(&mut self, sync: SyncObject) -> Result<(), DriverError>;

    fn set_front_stencil(&mut self, ctx: ContextHandle, state: &StencilState);

    // ── shader patcher ────────────────────────────────────────────────────

    fn create_shader_patcher(
        &mut self,
        params: &ShaderPatcherParams,
    ) -> Result<PatcherHandle, DriverError>;

    fn destroy_shader_patcher(&mut self, patcher: PatcherHandle) -> Result<(), DriverError>;

    fn register_program(
        &mut self,
        patcher: PatcherHandle,
        program: &Program<'static>,
    ) -> Result<ProgramId, DriverError>;

    fn unregister_program(
        &mut self,
        patcher: PatcherHandle,
        program: ProgramId,
    ) -> Result<(), DriverError>;

    fn create_vertex_program(
        &mut self,
        patcher: PatcherHandle,
        program: ProgramId,
        attributes: &[VertexAttribute],
        streams: &[VertexStream],
    ) -> Result<VertexProgramHandle, DriverError>;

    fn create_fragment_program(
        &mut self,
        patcher: PatcherHandle,
        program: ProgramId,
        output: OutputRegisterFormat,
        multisample: MultisampleMode,
        blend: Option<&BlendInfo>,
        vertex_program: ProgramId,
    ) -> Result<FragmentProgramHandle, DriverError>;

    fn release_vertex_program(
        &mut self,
        patcher: PatcherHandle,
        program: VertexProgramHandle,
    ) -> Result<(), DriverError>;

    fn release_fragment_program(
        &mut self,
        patcher: PatcherHandle,
        program: FragmentProgramHandle,
    ) -> Result<(), DriverError>;

    // ── command recording ─────────────────────────────────────────────────

    fn set_vertex_program(&mut self, ctx: ContextHandle, program: VertexProgramHandle);

    fn set_fragment_program(&mut self, ctx: ContextHandle, program: FragmentProgramHandle);

    fn begin_scene(
        &mut self,
        ctx: ContextHandle,
        target: RenderTargetHandle,
        fragment_sync: Option<SyncObject>,
        color: &ColorSurface,
        depth_stencil: &DepthStencilSurface,
    ) -> Result<(), DriverError>;

    fn end_scene(&mut self, ctx: ContextHandle) -> Result<(), DriverError>;

    fn set_fragment_texture(
        &mut self,
        ctx: ContextHandle,
        unit: u32,
        texture: &TextureDesc,
    ) -> Result<(), DriverError>;

    fn set_vertex_stream(
        &mut self,
        ctx: ContextHandle,
        stream: u32,
        data: GpuAddress,
    ) -> Result<(), DriverError>;

    fn reserve_vertex_default_uniform_buffer(
        &mut self,
        ctx: ContextHandle,
    ) -> Result<UniformBuffer, DriverError>;

    fn set_uniform_data_f(
        &mut self,
        buffer: UniformBuffer,
        param: &ProgramParameter<'_>,
        component_offset: u32,
        data: &[f32],
    ) -> Result<(), DriverError>;

    fn draw(
        &mut self,
        ctx: ContextHandle,
        primitive: Primitive,
        index_format: IndexFormat,
        indices: GpuAddress,
        index_count: u32,
    ) -> Result<(), DriverError>;

    /// Blocks until the GPU has finished every submitted scene.
    fn finish(&mut self, ctx: ContextHandle);

    /// Queues a flip to the buffer described by `data`.
    ///
    /// The display waits on `new_sync` before showing the buffer and signals
    /// `old_sync` once the previous buffer is no longer scanned out.
    fn display_queue_add_entry(
        &mut self,
        old_sync: SyncObject,
        new_sync: SyncObject,
        data: DisplayData,
    ) -> Result<(), DriverError>;

    /// Blocks until every queued flip has been processed.
    fn display_queue_finish(&mut self);
}
