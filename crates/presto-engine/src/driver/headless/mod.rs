//! In-process driver.
//!
//! Memory blocks are real host allocations, the display controller is a
//! thread consuming a bounded queue, and draws are executed by a small
//! software rasterizer. Every object is tracked so that leaks and
//! out-of-order teardown are reported as errors instead of going unnoticed.

mod display;
mod raster;

use std::alloc::Layout;
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::time::Duration;

pub use display::HeadlessDisplay;

use display::DisplayQueue;
use raster::{Sampler, ScreenVertex, Target};

use super::{
    AttributeFormat, BlendInfo, ColorSurface, ContextHandle, ContextParams, DepthStencilSurface,
    DisplayCallback, DisplayData, Driver, DriverError, FragmentProgramHandle, GpuAddress,
    GpuRegion, IndexFormat, InitializeParams, MemBlockType, MemBlockUid, MemoryAttribs, MultisampleMode,
    OutputRegisterFormat, PatcherHandle, Primitive, ProgramId, RenderTargetHandle,
    RenderTargetParams, ShaderPatcherParams, StencilState, SyncObject, TextureDesc, UniformBuffer,
    UsseRegion, VertexAttribute, VertexProgramHandle, VertexStream,
};
use crate::shader::{ParameterCategory, Program, ProgramParameter, ProgramType};

/// Host blocks are page aligned, like kernel memory blocks.
const BLOCK_ALIGNMENT: usize = 4096;

/// Floats in a context's default vertex uniform buffer.
const DEFAULT_UNIFORM_FLOATS: usize = 256;

/// Container index of the default uniform buffer.
const DEFAULT_UNIFORM_CONTAINER: u8 = 14;

const TEXTURE_UNITS: u32 = 16;

#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Time `wait_vblank_start` blocks for.
    pub vblank_interval: Duration,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            vblank_interval: Duration::from_micros(16_667),
        }
    }
}

impl HeadlessConfig {
    /// No simulated vblank delay.
    pub fn for_tests() -> Self {
        Self {
            vblank_interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Mapping {
    Gpu(MemoryAttribs),
    VertexUsse,
    FragmentUsse,
}

/// Zeroed, page-aligned host memory standing in for a kernel block.
struct HostBlock {
    name: String,
    ty: MemBlockType,
    ptr: NonNull<u8>,
    layout: Layout,
    mapping: Option<Mapping>,
}

impl HostBlock {
    fn new(name: &str, ty: MemBlockType, size: usize) -> Result<Self, DriverError> {
        let layout = Layout::from_size_align(size, BLOCK_ALIGNMENT)
            .map_err(|_| DriverError::InvalidArgument("memory block size"))?;
        // SAFETY: `layout` has a non-zero size, checked by the caller.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(DriverError::OutOfMemory)?;
        Ok(Self {
            name: name.to_owned(),
            ty,
            ptr,
            layout,
            mapping: None,
        })
    }

    fn base(&self) -> GpuAddress {
        GpuAddress::from_ptr(self.ptr)
    }

    fn size(&self) -> usize {
        self.layout.size()
    }

    fn contains(&self, addr: GpuAddress, len: usize) -> bool {
        let base = self.base().0;
        addr.0 >= base && addr.0.saturating_add(len) <= base + self.size()
    }

    fn slice(&self, addr: GpuAddress, len: usize) -> &[u8] {
        let start = addr.0 - self.base().0;
        // SAFETY: the block owns `size` initialized bytes and callers check
        // `contains(addr, len)` first.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(start), len) }
    }

    fn slice_mut(&mut self, addr: GpuAddress, len: usize) -> &mut [u8] {
        let start = addr.0 - self.base().0;
        // SAFETY: as in `slice`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(start), len) }
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[derive(Debug, Clone)]
struct Scene {
    target: RenderTargetHandle,
    color: ColorSurface,
}

struct ContextState {
    params: ContextParams,
    scene: Option<Scene>,
    vertex_program: Option<VertexProgramHandle>,
    fragment_program: Option<FragmentProgramHandle>,
    stencil: StencilState,
    textures: [Option<TextureDesc>; TEXTURE_UNITS as usize],
    stream: Option<GpuAddress>,
    uniforms: Vec<f32>,
    uniform_reserved: bool,
}

struct PatcherState {
    params: ShaderPatcherParams,
}

struct RegisteredProgram {
    patcher: PatcherHandle,
    program: Program<'static>,
}

struct VertexProgramState {
    patcher: PatcherHandle,
    program: ProgramId,
    attributes: Vec<VertexAttribute>,
    streams: Vec<VertexStream>,
}

struct FragmentProgramState {
    patcher: PatcherHandle,
    program: ProgramId,
}

/// A [`Driver`] that runs entirely on the host.
pub struct HeadlessDriver {
    config: HeadlessConfig,
    display: HeadlessDisplay,
    queue: Option<DisplayQueue>,
    next_id: u32,
    next_usse_offset: u32,
    fail_alloc_in: Option<u32>,

    blocks: HashMap<u32, HostBlock>,
    contexts: HashMap<u32, ContextState>,
    render_targets: HashMap<u32, RenderTargetParams>,
    syncs: HashSet<u32>,
    patchers: HashMap<u32, PatcherState>,
    programs: HashMap<u32, RegisteredProgram>,
    vertex_programs: HashMap<u32, VertexProgramState>,
    fragment_programs: HashMap<u32, FragmentProgramState>,

    scenes_completed: u64,
    draws: u64,
    pixels_filled: u64,
    finishes: u64,
}

impl HeadlessDriver {
    pub fn new(config: HeadlessConfig) -> Self {
        Self {
            display: HeadlessDisplay::new(config.vblank_interval),
            config,
            queue: None,
            next_id: 1,
            next_usse_offset: 0,
            fail_alloc_in: None,
            blocks: HashMap::new(),
            contexts: HashMap::new(),
            render_targets: HashMap::new(),
            syncs: HashSet::new(),
            patchers: HashMap::new(),
            programs: HashMap::new(),
            vertex_programs: HashMap::new(),
            fragment_programs: HashMap::new(),
            scenes_completed: 0,
            draws: 0,
            pixels_filled: 0,
            finishes: 0,
        }
    }

    pub fn config(&self) -> &HeadlessConfig {
        &self.config
    }

    /// Lets `successes` more memory blocks be allocated, then fails the next
    /// one with [`DriverError::OutOfMemory`].
    pub fn fail_allocation_after(&mut self, successes: u32) {
        self.fail_alloc_in = Some(successes);
    }

    pub fn is_initialized(&self) -> bool {
        self.queue.is_some()
    }

    pub fn live_mem_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn live_mapped_blocks(&self) -> usize {
        self.blocks.values().filter(|b| b.mapping.is_some()).count()
    }

    pub fn live_contexts(&self) -> usize {
        self.contexts.len()
    }

    pub fn live_render_targets(&self) -> usize {
        self.render_targets.len()
    }

    pub fn live_sync_objects(&self) -> usize {
        self.syncs.len()
    }

    pub fn live_patchers(&self) -> usize {
        self.patchers.len()
    }

    /// Registered (not linked) programs.
    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn live_linked_programs(&self) -> usize {
        self.vertex_programs.len() + self.fragment_programs.len()
    }

    /// Every object created through the driver that is still alive.
    pub fn live_objects(&self) -> usize {
        self.live_mem_blocks()
            + self.live_contexts()
            + self.live_render_targets()
            + self.live_sync_objects()
            + self.live_patchers()
            + self.live_programs()
            + self.live_linked_programs()
    }

    pub fn scenes_completed(&self) -> u64 {
        self.scenes_completed
    }

    pub fn draw_count(&self) -> u64 {
        self.draws
    }

    /// Pixels written by the rasterizer so far.
    pub fn pixels_filled(&self) -> u64 {
        self.pixels_filled
    }

    /// Number of `finish` calls, i.e. full GPU drains.
    pub fn finish_count(&self) -> u64 {
        self.finishes
    }

    pub fn pending_display_entries(&self) -> usize {
        self.queue.as_ref().map_or(0, DisplayQueue::pending)
    }

    pub fn current_stencil(&self, ctx: ContextHandle) -> Option<StencilState> {
        self.contexts.get(&ctx.0).map(|c| c.stencil)
    }

    /// Bytes of a live memory block.
    pub fn read_bytes(&self, addr: GpuAddress, len: usize) -> Option<&[u8]> {
        self.block_containing(addr, len).map(|b| b.slice(addr, len))
    }

    /// Reads one A8B8G8R8 pixel of a color surface as R, G, B, A.
    pub fn read_pixel(&self, surface: &ColorSurface, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= surface.width || y >= surface.height {
            return None;
        }
        let at = surface
            .data
            .offset((y as usize * surface.stride as usize + x as usize) * 4);
        let px = self.read_bytes(at, 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    fn next_handle(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn block_containing(&self, addr: GpuAddress, len: usize) -> Option<&HostBlock> {
        self.blocks.values().find(|b| b.contains(addr, len))
    }

    fn block_containing_mut(&mut self, addr: GpuAddress, len: usize) -> Option<&mut HostBlock> {
        self.blocks.values_mut().find(|b| b.contains(addr, len))
    }

    fn block_at_mut(&mut self, base: GpuAddress) -> Result<&mut HostBlock, DriverError> {
        self.blocks
            .values_mut()
            .find(|b| b.base() == base)
            .ok_or(DriverError::InvalidArgument("address is not the base of a memory block"))
    }

    /// Mapped memory of at least `len` bytes at `addr`.
    fn mapped(&self, addr: GpuAddress, len: usize) -> Result<&[u8], DriverError> {
        match self.block_containing(addr, len) {
            Some(block) if block.mapping.is_some() => Ok(block.slice(addr, len)),
            Some(_) => Err(DriverError::InvalidArgument("memory is not mapped for the GPU")),
            None => Err(DriverError::InvalidArgument("address outside any memory block")),
        }
    }

    /// Whether a live context or patcher still points into the block at
    /// `base`.
    fn referenced_by(&self, base: GpuAddress) -> Option<&'static str> {
        let touches = |region: &GpuRegion| {
            self.blocks
                .values()
                .find(|b| b.base() == base)
                .is_some_and(|b| b.contains(region.base, 1))
        };

        if self.contexts.values().any(|c| {
            touches(&c.params.vdm_ring)
                || touches(&c.params.vertex_ring)
                || touches(&c.params.fragment_ring)
                || touches(&c.params.fragment_usse_ring.region)
        }) {
            return Some("memory block is used by a live context");
        }
        if self.patchers.values().any(|p| {
            touches(&p.params.buffer)
                || touches(&p.params.vertex_usse.region)
                || touches(&p.params.fragment_usse.region)
        }) {
            return Some("memory block is used by a live shader patcher");
        }
        None
    }

    fn map_as(&mut self, base: GpuAddress, size: usize, mapping: Mapping) -> Result<(), DriverError> {
        let block = self.block_at_mut(base)?;
        if size > block.size() {
            return Err(DriverError::InvalidArgument("mapping larger than its block"));
        }
        if block.mapping.is_some() {
            return Err(DriverError::InvalidArgument("memory block is already mapped"));
        }
        block.mapping = Some(mapping);
        Ok(())
    }

    fn unmap_as(&mut self, base: GpuAddress, expected: fn(Mapping) -> bool) -> Result<(), DriverError> {
        if let Some(reason) = self.referenced_by(base) {
            return Err(DriverError::InUse(reason));
        }
        let block = self.block_at_mut(base)?;
        match block.mapping {
            Some(mapping) if expected(mapping) => {
                block.mapping = None;
                Ok(())
            }
            Some(_) => Err(DriverError::InvalidArgument("memory block is mapped differently")),
            None => Err(DriverError::InvalidArgument("memory block is not mapped")),
        }
    }

    fn next_usse_offset(&mut self, size: usize) -> u32 {
        let offset = self.next_usse_offset;
        self.next_usse_offset = self.next_usse_offset.wrapping_add(size as u32);
        offset
    }

    fn context_mut(&mut self, ctx: ContextHandle) -> Result<&mut ContextState, DriverError> {
        self.contexts.get_mut(&ctx.0).ok_or(DriverError::InvalidHandle)
    }

    fn check_patcher(&self, patcher: PatcherHandle) -> Result<(), DriverError> {
        if self.patchers.contains_key(&patcher.0) {
            Ok(())
        } else {
            Err(DriverError::InvalidHandle)
        }
    }

    /// Executes one draw against the context's current state.
    fn rasterize(
        &mut self,
        ctx: ContextHandle,
        primitive: Primitive,
        indices: &[u32],
    ) -> Result<u64, DriverError> {
        let state = self.contexts.get(&ctx.0).ok_or(DriverError::InvalidHandle)?;
        let scene = state
            .scene
            .clone()
            .ok_or(DriverError::InvalidArgument("draw outside of a scene"))?;
        let vertex_handle = state
            .vertex_program
            .ok_or(DriverError::InvalidArgument("no vertex program set"))?;
        if state.fragment_program.is_none() {
            return Err(DriverError::InvalidArgument("no fragment program set"));
        }
        let texture = state.textures[0].ok_or(DriverError::InvalidArgument("no texture on unit 0"))?;
        let stream = state
            .stream
            .ok_or(DriverError::InvalidArgument("no vertex stream bound"))?;

        let linked = self
            .vertex_programs
            .get(&vertex_handle.0)
            .ok_or(DriverError::InvalidHandle)?;
        let program = &self
            .programs
            .get(&linked.program.0)
            .ok_or(DriverError::InvalidHandle)?
            .program;

        let attribute = |name: &str| -> Result<VertexAttribute, DriverError> {
            let param = program
                .find_parameter(name)
                .filter(|p| p.category == ParameterCategory::Attribute)
                .ok_or(DriverError::InvalidArgument("vertex program lacks an attribute"))?;
            linked
                .attributes
                .iter()
                .find(|a| a.reg_index == param.resource_index)
                .copied()
                .ok_or(DriverError::InvalidArgument("attribute is not bound to a register"))
        };
        let position = attribute("aPosition")?;
        let texcoord = attribute("aTexcoord")?;
        let stride = linked
            .streams
            .first()
            .ok_or(DriverError::InvalidArgument("vertex program has no stream"))?
            .stride as usize;

        let wvp_param = program
            .find_parameter("wvp")
            .ok_or(DriverError::InvalidArgument("vertex program lacks wvp"))?;
        let base = wvp_param.resource_index as usize;
        let wvp: [f32; 16] = state
            .uniforms
            .get(base..base + 16)
            .and_then(|m| m.try_into().ok())
            .ok_or(DriverError::InvalidArgument("wvp outside the uniform buffer"))?;

        let read_floats = |addr: GpuAddress, attr: &VertexAttribute| -> Result<[f32; 3], DriverError> {
            if attr.format != AttributeFormat::F32 {
                return Err(DriverError::InvalidArgument("only f32 attributes are supported"));
            }
            let bytes = self.mapped(addr.offset(attr.offset as usize), attr.byte_len())?;
            let mut out = [0.0; 3];
            for (o, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
                *o = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            Ok(out)
        };

        let mut vertices = HashMap::new();
        for &index in indices {
            if vertices.contains_key(&index) {
                continue;
            }
            let at = stream.offset(index as usize * stride);
            let p = read_floats(at, &position)?;
            let t = read_floats(at, &texcoord)?;
            let (x, y) = raster::to_screen(raster::transform(&wvp, p), scene.color.width, scene.color.height);
            vertices.insert(index, ScreenVertex { x, y, u: t[0], v: t[1] });
        }

        let texels = self
            .mapped(texture.data, texture.format.footprint(texture.width, texture.height))?
            .to_vec();
        let palette = match texture.palette {
            Some(addr) => Some(self.mapped(addr, 256 * 4)?.to_vec()),
            None => None,
        };
        let sampler = Sampler {
            texels: &texels,
            palette: palette.as_deref(),
            format: texture.format,
            width: texture.width,
            height: texture.height,
            stride: texture.stride() as usize,
        };

        let color = scene.color;
        let len = color.stride as usize * color.height as usize * color.bytes_per_pixel() as usize;
        let block = self
            .block_containing_mut(color.data, len)
            .ok_or(DriverError::InvalidArgument("color surface outside any memory block"))?;
        let mut target = Target {
            pixels: block.slice_mut(color.data, len),
            width: color.width,
            height: color.height,
            stride: color.stride,
        };

        let mut filled = 0;
        for [a, b, c] in raster::assemble(primitive, indices) {
            let tri = [vertices[&a], vertices[&b], vertices[&c]];
            filled += raster::fill_triangle(
                &mut target,
                tri,
                &sampler,
                texture.min_filter,
                texture.mag_filter,
            );
        }
        log::trace!("draw into target {:?}: {filled} pixels", scene.target);
        Ok(filled)
    }
}

impl Driver for HeadlessDriver {
    type Display = HeadlessDisplay;

    fn initialize(
        &mut self,
        params: &InitializeParams,
        on_display: DisplayCallback,
    ) -> Result<(), DriverError> {
        if self.queue.is_some() {
            return Err(DriverError::InvalidArgument("driver is already initialized"));
        }
        if params.parameter_buffer_size == 0 {
            return Err(DriverError::InvalidArgument("parameter buffer size"));
        }
        self.queue = Some(DisplayQueue::spawn(params.display_queue_max_pending, on_display)?);
        log::debug!(
            "headless driver initialized (max pending {}, vblank {:?})",
            params.display_queue_max_pending,
            self.config.vblank_interval
        );
        Ok(())
    }

    fn terminate(&mut self) {
        if let Some(mut queue) = self.queue.take() {
            queue.shutdown();
        }
        let live = self.live_objects();
        if live > 0 {
            log::warn!("headless driver terminated with {live} live objects");
        }
    }

    fn display(&self) -> HeadlessDisplay {
        self.display.clone()
    }

    fn alloc_mem_block(
        &mut self,
        name: &str,
        ty: MemBlockType,
        size: usize,
    ) -> Result<MemBlockUid, DriverError> {
        if size == 0 || size % ty.size_granularity() != 0 {
            return Err(DriverError::InvalidArgument("block size is not a multiple of its granularity"));
        }
        match self.fail_alloc_in {
            Some(0) => {
                self.fail_alloc_in = None;
                return Err(DriverError::OutOfMemory);
            }
            Some(n) => self.fail_alloc_in = Some(n - 1),
            None => {}
        }

        let block = HostBlock::new(name, ty, size)?;
        let uid = self.next_handle();
        log::trace!("memblock {uid} `{}` {:?}: {size} bytes", block.name, block.ty);
        self.blocks.insert(uid, block);
        Ok(MemBlockUid(uid))
    }

    fn mem_block_base(&self, uid: MemBlockUid) -> Result<NonNull<u8>, DriverError> {
        self.blocks
            .get(&uid.0)
            .map(|b| b.ptr)
            .ok_or(DriverError::InvalidHandle)
    }

    fn free_mem_block(&mut self, uid: MemBlockUid) -> Result<(), DriverError> {
        let block = self.blocks.get(&uid.0).ok_or(DriverError::InvalidHandle)?;
        if block.mapping.is_some() {
            return Err(DriverError::InUse("memory block is still mapped"));
        }
        self.blocks.remove(&uid.0);
        Ok(())
    }

    fn map_memory(
        &mut self,
        base: GpuAddress,
        size: usize,
        attribs: MemoryAttribs,
    ) -> Result<(), DriverError> {
        self.map_as(base, size, Mapping::Gpu(attribs))
    }

    fn unmap_memory(&mut self, base: GpuAddress) -> Result<(), DriverError> {
        self.unmap_as(base, |m| matches!(m, Mapping::Gpu(_)))
    }

    fn map_vertex_usse_memory(&mut self, base: GpuAddress, size: usize) -> Result<u32, DriverError> {
        self.map_as(base, size, Mapping::VertexUsse)?;
        Ok(self.next_usse_offset(size))
    }

    fn unmap_vertex_usse_memory(&mut self, base: GpuAddress) -> Result<(), DriverError> {
        self.unmap_as(base, |m| m == Mapping::VertexUsse)
    }

    fn map_fragment_usse_memory(
        &mut self,
        base: GpuAddress,
        size: usize,
    ) -> Result<u32, DriverError> {
        self.map_as(base, size, Mapping::FragmentUsse)?;
        Ok(self.next_usse_offset(size))
    }

    fn unmap_fragment_usse_memory(&mut self, base: GpuAddress) -> Result<(), DriverError> {
        self.unmap_as(base, |m| m == Mapping::FragmentUsse)
    }

    fn create_context(&mut self, params: &ContextParams) -> Result<ContextHandle, DriverError> {
        if self.queue.is_none() {
            return Err(DriverError::Uninitialized);
        }
        for region in [
            &params.vdm_ring,
            &params.vertex_ring,
            &params.fragment_ring,
            &params.fragment_usse_ring.region,
        ] {
            self.mapped(region.base, region.size)?;
        }

        let id = self.next_handle();
        self.contexts.insert(
            id,
            ContextState {
                params: *params,
                scene: None,
                vertex_program: None,
                fragment_program: None,
                stencil: StencilState::PASSTHROUGH,
                textures: [None; TEXTURE_UNITS as usize],
                stream: None,
                uniforms: vec![0.0; DEFAULT_UNIFORM_FLOATS],
                uniform_reserved: false,
            },
        );
        Ok(ContextHandle(id))
    }

    fn destroy_context(&mut self, ctx: ContextHandle) -> Result<(), DriverError> {
        let state = self.contexts.get(&ctx.0).ok_or(DriverError::InvalidHandle)?;
        if state.scene.is_some() {
            return Err(DriverError::InUse("context has a scene in progress"));
        }
        self.contexts.remove(&ctx.0);
        Ok(())
    }

    fn create_render_target(
        &mut self,
        params: &RenderTargetParams,
    ) -> Result<RenderTargetHandle, DriverError> {
        if params.width == 0 || params.height == 0 || params.scenes_per_frame == 0 {
            return Err(DriverError::InvalidArgument("render target geometry"));
        }
        if params.multisample != MultisampleMode::None {
            return Err(DriverError::InvalidArgument("multisampling is not supported"));
        }
        let id = self.next_handle();
        self.render_targets.insert(id, *params);
        Ok(RenderTargetHandle(id))
    }

    fn destroy_render_target(&mut self, target: RenderTargetHandle) -> Result<(), DriverError> {
        if self
            .contexts
            .values()
            .any(|c| c.scene.as_ref().is_some_and(|s| s.target == target))
        {
            return Err(DriverError::InUse("render target has a scene in progress"));
        }
        self.render_targets
            .remove(&target.0)
            .map(|_| ())
            .ok_or(DriverError::InvalidHandle)
    }

    fn create_sync_object(&mut self) -> Result<SyncObject, DriverError> {
        let id = self.next_handle();
        self.syncs.insert(id);
        Ok(SyncObject(id))
    }

    fn destroy_sync_object(&mut self, sync: SyncObject) -> Result<(), DriverError> {
        if self.pending_display_entries() > 0 {
            return Err(DriverError::InUse("display queue still has entries"));
        }
        if self.syncs.remove(&sync.0) {
            Ok(())
        } else {
            Err(DriverError::InvalidHandle)
        }
    }

    fn set_front_stencil(&mut self, ctx: ContextHandle, state: &StencilState) {
        if let Ok(context) = self.context_mut(ctx) {
            context.stencil = *state;
        }
    }

    fn create_shader_patcher(
        &mut self,
        params: &ShaderPatcherParams,
    ) -> Result<PatcherHandle, DriverError> {
        for region in [
            &params.buffer,
            &params.vertex_usse.region,
            &params.fragment_usse.region,
        ] {
            self.mapped(region.base, region.size)?;
        }
        let id = self.next_handle();
        self.patchers.insert(id, PatcherState { params: *params });
        Ok(PatcherHandle(id))
    }

    fn destroy_shader_patcher(&mut self, patcher: PatcherHandle) -> Result<(), DriverError> {
        self.check_patcher(patcher)?;
        if self.programs.values().any(|p| p.patcher == patcher)
            || self.vertex_programs.values().any(|p| p.patcher == patcher)
            || self.fragment_programs.values().any(|p| p.patcher == patcher)
        {
            return Err(DriverError::InUse("shader patcher still has programs"));
        }
        self.patchers.remove(&patcher.0);
        Ok(())
    }

    fn register_program(
        &mut self,
        patcher: PatcherHandle,
        program: &Program<'static>,
    ) -> Result<ProgramId, DriverError> {
        self.check_patcher(patcher)?;
        let id = self.next_handle();
        self.programs.insert(
            id,
            RegisteredProgram {
                patcher,
                program: program.clone(),
            },
        );
        Ok(ProgramId(id))
    }

    fn unregister_program(
        &mut self,
        patcher: PatcherHandle,
        program: ProgramId,
    ) -> Result<(), DriverError> {
        match self.programs.get(&program.0) {
            Some(registered) if registered.patcher == patcher => {}
            _ => return Err(DriverError::InvalidHandle),
        }
        if self.vertex_programs.values().any(|p| p.program == program)
            || self.fragment_programs.values().any(|p| p.program == program)
        {
            return Err(DriverError::InUse("program still has linked instances"));
        }
        self.programs.remove(&program.0);
        Ok(())
    }

    fn create_vertex_program(
        &mut self,
        patcher: PatcherHandle,
        program: ProgramId,
        attributes: &[VertexAttribute],
        streams: &[VertexStream],
    ) -> Result<VertexProgramHandle, DriverError> {
        let registered = self.programs.get(&program.0).ok_or(DriverError::InvalidHandle)?;
        if registered.patcher != patcher {
            return Err(DriverError::InvalidHandle);
        }
        if registered.program.program_type() != ProgramType::Vertex {
            return Err(DriverError::InvalidArgument("not a vertex program"));
        }
        if streams.is_empty() {
            return Err(DriverError::InvalidArgument("vertex program needs a stream"));
        }
        for attr in attributes {
            let stream = streams
                .get(attr.stream_index as usize)
                .ok_or(DriverError::InvalidArgument("attribute refers to a missing stream"))?;
            if attr.offset as usize + attr.byte_len() > stream.stride as usize {
                return Err(DriverError::InvalidArgument("attribute exceeds its stream stride"));
            }
        }

        let id = self.next_handle();
        self.vertex_programs.insert(
            id,
            VertexProgramState {
                patcher,
                program,
                attributes: attributes.to_vec(),
                streams: streams.to_vec(),
            },
        );
        Ok(VertexProgramHandle(id))
    }

    fn create_fragment_program(
        &mut self,
        patcher: PatcherHandle,
        program: ProgramId,
        _output: OutputRegisterFormat,
        multisample: MultisampleMode,
        blend: Option<&BlendInfo>,
        vertex_program: ProgramId,
    ) -> Result<FragmentProgramHandle, DriverError> {
        let registered = self.programs.get(&program.0).ok_or(DriverError::InvalidHandle)?;
        if registered.patcher != patcher {
            return Err(DriverError::InvalidHandle);
        }
        if registered.program.program_type() != ProgramType::Fragment {
            return Err(DriverError::InvalidArgument("not a fragment program"));
        }
        if !self.programs.contains_key(&vertex_program.0) {
            return Err(DriverError::InvalidHandle);
        }
        if multisample != MultisampleMode::None {
            return Err(DriverError::InvalidArgument("multisampling is not supported"));
        }
        if blend.is_some_and(|b| *b != BlendInfo::DISABLED) {
            return Err(DriverError::InvalidArgument("blending is not supported"));
        }

        let id = self.next_handle();
        self.fragment_programs
            .insert(id, FragmentProgramState { patcher, program });
        Ok(FragmentProgramHandle(id))
    }

    fn release_vertex_program(
        &mut self,
        patcher: PatcherHandle,
        program: VertexProgramHandle,
    ) -> Result<(), DriverError> {
        match self.vertex_programs.get(&program.0) {
            Some(state) if state.patcher == patcher => {
                self.vertex_programs.remove(&program.0);
                for ctx in self.contexts.values_mut() {
                    if ctx.vertex_program == Some(program) {
                        ctx.vertex_program = None;
                    }
                }
                Ok(())
            }
            _ => Err(DriverError::InvalidHandle),
        }
    }

    fn release_fragment_program(
        &mut self,
        patcher: PatcherHandle,
        program: FragmentProgramHandle,
    ) -> Result<(), DriverError> {
        match self.fragment_programs.get(&program.0) {
            Some(state) if state.patcher == patcher => {
                self.fragment_programs.remove(&program.0);
                for ctx in self.contexts.values_mut() {
                    if ctx.fragment_program == Some(program) {
                        ctx.fragment_program = None;
                    }
                }
                Ok(())
            }
            _ => Err(DriverError::InvalidHandle),
        }
    }

    fn set_vertex_program(&mut self, ctx: ContextHandle, program: VertexProgramHandle) {
        if let Ok(context) = self.context_mut(ctx) {
            context.vertex_program = Some(program);
        }
    }

    fn set_fragment_program(&mut self, ctx: ContextHandle, program: FragmentProgramHandle) {
        if let Ok(context) = self.context_mut(ctx) {
            context.fragment_program = Some(program);
        }
    }

    fn begin_scene(
        &mut self,
        ctx: ContextHandle,
        target: RenderTargetHandle,
        fragment_sync: Option<SyncObject>,
        color: &ColorSurface,
        depth_stencil: &DepthStencilSurface,
    ) -> Result<(), DriverError> {
        let target_params = *self
            .render_targets
            .get(&target.0)
            .ok_or(DriverError::InvalidHandle)?;
        if color.width > target_params.width || color.height > target_params.height {
            return Err(DriverError::InvalidArgument("color surface larger than render target"));
        }
        if let Some(sync) = fragment_sync {
            if !self.syncs.contains(&sync.0) {
                return Err(DriverError::InvalidHandle);
            }
        }
        let color_len = color.stride as usize * color.height as usize * color.bytes_per_pixel() as usize;
        self.mapped(color.data, color_len)?;
        self.mapped(depth_stencil.depth, 4)?;
        if let Some(stencil) = depth_stencil.stencil {
            self.mapped(stencil, 4)?;
        }

        let context = self.context_mut(ctx)?;
        if context.scene.is_some() {
            return Err(DriverError::InUse("a scene is already in progress"));
        }
        context.scene = Some(Scene {
            target,
            color: *color,
        });
        Ok(())
    }

    fn end_scene(&mut self, ctx: ContextHandle) -> Result<(), DriverError> {
        let context = self.context_mut(ctx)?;
        if context.scene.take().is_none() {
            return Err(DriverError::InvalidArgument("no scene in progress"));
        }
        self.scenes_completed += 1;
        Ok(())
    }

    fn set_fragment_texture(
        &mut self,
        ctx: ContextHandle,
        unit: u32,
        texture: &TextureDesc,
    ) -> Result<(), DriverError> {
        if unit >= TEXTURE_UNITS {
            return Err(DriverError::InvalidArgument("texture unit"));
        }
        self.mapped(texture.data, texture.format.footprint(texture.width, texture.height))?;
        if texture.format.is_paletted() != texture.palette.is_some() {
            return Err(DriverError::InvalidArgument("palette does not match texture format"));
        }
        self.context_mut(ctx)?.textures[unit as usize] = Some(*texture);
        Ok(())
    }

    fn set_vertex_stream(
        &mut self,
        ctx: ContextHandle,
        stream: u32,
        data: GpuAddress,
    ) -> Result<(), DriverError> {
        if stream != 0 {
            return Err(DriverError::InvalidArgument("only stream 0 is supported"));
        }
        self.mapped(data, 1)?;
        self.context_mut(ctx)?.stream = Some(data);
        Ok(())
    }

    fn reserve_vertex_default_uniform_buffer(
        &mut self,
        ctx: ContextHandle,
    ) -> Result<UniformBuffer, DriverError> {
        let context = self.context_mut(ctx)?;
        if context.scene.is_none() {
            return Err(DriverError::InvalidArgument("uniform reservation outside of a scene"));
        }
        context.uniform_reserved = true;
        Ok(UniformBuffer(ctx.0))
    }

    fn set_uniform_data_f(
        &mut self,
        buffer: UniformBuffer,
        param: &ProgramParameter<'_>,
        component_offset: u32,
        data: &[f32],
    ) -> Result<(), DriverError> {
        if param.category != ParameterCategory::Uniform
            || param.container_index != DEFAULT_UNIFORM_CONTAINER
        {
            return Err(DriverError::InvalidArgument("not a default-buffer uniform"));
        }
        if component_offset as usize + data.len() > param.float_count() {
            return Err(DriverError::InvalidArgument("uniform data exceeds the parameter"));
        }
        let context = self
            .contexts
            .get_mut(&buffer.0)
            .filter(|c| c.uniform_reserved)
            .ok_or(DriverError::InvalidHandle)?;

        let start = param.resource_index as usize + component_offset as usize;
        let slot = context
            .uniforms
            .get_mut(start..start + data.len())
            .ok_or(DriverError::InvalidArgument("uniform outside the default buffer"))?;
        slot.copy_from_slice(data);
        Ok(())
    }

    fn draw(
        &mut self,
        ctx: ContextHandle,
        primitive: Primitive,
        index_format: IndexFormat,
        indices: GpuAddress,
        index_count: u32,
    ) -> Result<(), DriverError> {
        let bytes = self.mapped(indices, index_count as usize * index_format.size())?;
        let decoded: Vec<u32> = match index_format {
            IndexFormat::U16 => bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]) as u32)
                .collect(),
            IndexFormat::U32 => bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        };

        if !self
            .contexts
            .get(&ctx.0)
            .ok_or(DriverError::InvalidHandle)?
            .uniform_reserved
        {
            return Err(DriverError::InvalidArgument("no uniform buffer reserved for the draw"));
        }

        let filled = self.rasterize(ctx, primitive, &decoded)?;
        self.context_mut(ctx)?.uniform_reserved = false;
        self.draws += 1;
        self.pixels_filled += filled;
        Ok(())
    }

    fn finish(&mut self, ctx: ContextHandle) {
        if self.contexts.contains_key(&ctx.0) {
            self.finishes += 1;
        }
    }

    fn display_queue_add_entry(
        &mut self,
        old_sync: SyncObject,
        new_sync: SyncObject,
        data: DisplayData,
    ) -> Result<(), DriverError> {
        if !self.syncs.contains(&old_sync.0) || !self.syncs.contains(&new_sync.0) {
            return Err(DriverError::InvalidHandle);
        }
        self.queue
            .as_ref()
            .ok_or(DriverError::Uninitialized)?
            .push(data)
    }

    fn display_queue_finish(&mut self) {
        if let Some(queue) = &self.queue {
            queue.drain();
        }
    }
}

impl Drop for HeadlessDriver {
    fn drop(&mut self) {
        if let Some(mut queue) = self.queue.take() {
            queue.shutdown();
        }
        if !self.blocks.is_empty() {
            log::debug!("releasing {} leftover memory blocks", self.blocks.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ColorFormat, SurfaceLayout};

    fn initialized() -> HeadlessDriver {
        let mut driver = HeadlessDriver::new(HeadlessConfig::for_tests());
        let params = InitializeParams {
            display_queue_max_pending: 2,
            parameter_buffer_size: 16 * 1024 * 1024,
        };
        driver.initialize(&params, Box::new(|_: &DisplayData| {})).unwrap();
        driver
    }

    fn mapped_block(driver: &mut HeadlessDriver, size: usize) -> (MemBlockUid, GpuAddress) {
        let uid = driver.alloc_mem_block("test", MemBlockType::UserRw, size).unwrap();
        let base = GpuAddress::from_ptr(driver.mem_block_base(uid).unwrap());
        driver.map_memory(base, size, MemoryAttribs::ReadWrite).unwrap();
        (uid, base)
    }

    #[test]
    fn blocks_are_zeroed_and_page_aligned() {
        let mut driver = HeadlessDriver::new(HeadlessConfig::for_tests());
        let uid = driver.alloc_mem_block("a", MemBlockType::UserCdramRw, 256 * 1024).unwrap();
        let base = GpuAddress::from_ptr(driver.mem_block_base(uid).unwrap());

        assert!(base.is_aligned(BLOCK_ALIGNMENT));
        assert!(driver.read_bytes(base, 256 * 1024).unwrap().iter().all(|b| *b == 0));

        driver.free_mem_block(uid).unwrap();
        assert_eq!(driver.live_mem_blocks(), 0);
    }

    #[test]
    fn rejects_sizes_off_granularity() {
        let mut driver = HeadlessDriver::new(HeadlessConfig::for_tests());
        assert!(driver.alloc_mem_block("a", MemBlockType::UserCdramRw, 4096).is_err());
        assert!(driver.alloc_mem_block("b", MemBlockType::UserRw, 100).is_err());
    }

    #[test]
    fn mapped_blocks_cannot_be_freed() {
        let mut driver = HeadlessDriver::new(HeadlessConfig::for_tests());
        let (uid, base) = mapped_block(&mut driver, 4096);

        assert_eq!(
            driver.free_mem_block(uid),
            Err(DriverError::InUse("memory block is still mapped"))
        );
        driver.unmap_memory(base).unwrap();
        driver.free_mem_block(uid).unwrap();
    }

    #[test]
    fn context_rings_pin_their_memory() {
        let mut driver = initialized();
        let (uid, base) = mapped_block(&mut driver, 64 * 1024);
        let region = |offset: usize| GpuRegion {
            base: base.offset(offset),
            size: 4096,
        };
        let params = ContextParams {
            host_mem_size: 2048,
            vdm_ring: region(0),
            vertex_ring: region(4096),
            fragment_ring: region(8192),
            fragment_usse_ring: UsseRegion {
                region: region(12288),
                offset: 0,
            },
        };
        let ctx = driver.create_context(&params).unwrap();

        assert!(matches!(driver.unmap_memory(base), Err(DriverError::InUse(_))));
        driver.destroy_context(ctx).unwrap();
        driver.unmap_memory(base).unwrap();
        driver.free_mem_block(uid).unwrap();
        driver.terminate();
    }

    #[test]
    fn context_requires_initialization() {
        let mut driver = HeadlessDriver::new(HeadlessConfig::for_tests());
        let (_, base) = mapped_block(&mut driver, 4096);
        let region = GpuRegion { base, size: 4096 };
        let params = ContextParams {
            host_mem_size: 2048,
            vdm_ring: region,
            vertex_ring: region,
            fragment_ring: region,
            fragment_usse_ring: UsseRegion { region, offset: 0 },
        };
        assert_eq!(driver.create_context(&params), Err(DriverError::Uninitialized));
    }

    #[test]
    fn allocation_failure_is_one_shot() {
        let mut driver = HeadlessDriver::new(HeadlessConfig::for_tests());
        driver.fail_allocation_after(0);
        assert_eq!(
            driver.alloc_mem_block("a", MemBlockType::UserRw, 4096),
            Err(DriverError::OutOfMemory)
        );
        assert!(driver.alloc_mem_block("b", MemBlockType::UserRw, 4096).is_ok());
    }

    #[test]
    fn double_initialize_is_rejected() {
        let mut driver = initialized();
        let params = InitializeParams {
            display_queue_max_pending: 2,
            parameter_buffer_size: 1,
        };
        assert!(driver.initialize(&params, Box::new(|_: &DisplayData| {})).is_err());
        driver.terminate();
        assert!(!driver.is_initialized());
    }

    #[test]
    fn read_pixel_respects_surface_bounds() {
        let mut driver = HeadlessDriver::new(HeadlessConfig::for_tests());
        let (_, base) = mapped_block(&mut driver, 4096);
        let surface = ColorSurface {
            format: ColorFormat::A8B8G8R8,
            layout: SurfaceLayout::Linear,
            width: 4,
            height: 4,
            stride: 8,
            data: base,
        };
        assert_eq!(driver.read_pixel(&surface, 3, 3), Some([0, 0, 0, 0]));
        assert_eq!(driver.read_pixel(&surface, 4, 0), None);
    }
}
