use std::ptr::NonNull;

use slotmap::SlotMap;

use crate::coords::{Rect, Vec2};
use crate::driver::headless::HeadlessDriver;
use crate::driver::{
    ColorSurface, ContextHandle, Driver, InitializeParams, MemBlockType, RenderTargetHandle,
    RenderTargetParams, StencilState, TextureFilter,
};
use crate::memory::{AllocStats, GpuMemory};
use crate::render::{QuadRect, QuadRenderer, pixel_projection};
use crate::shader::{ShaderPatcher, ShaderPipeline};
use crate::texture::{Placement, Texture, TextureFormat};

use super::error::{Error, InitStage};
use super::extents::PresentedExtents;
use super::init::{DisplayGeometry, RenderInit};
use super::rings::RingBuffers;
use super::swapchain::{DisplayLink, SwapChain};

slotmap::new_key_type! {
    /// Handle to a texture owned by a [`RenderContext`].
    pub struct TextureId;
}

/// What the current scene renders into.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SceneTarget {
    /// The back display buffer.
    Display,
    /// A render-target texture.
    Texture(TextureId),
}

#[derive(Debug, Copy, Clone)]
enum SceneState {
    Idle,
    Drawing { target: SceneTarget, wvp: [f32; 16] },
}

/// Warns when a context goes away without [`RenderContext::finish`].
#[derive(Debug)]
struct FinishGuard {
    armed: bool,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if self.armed {
            log::warn!("render context dropped without finish(); GPU resources were not released");
        }
    }
}

/// Everything created so far during initialization.
///
/// Teardown runs in the reverse dependency order regardless of how far
/// initialization got, so the same path serves failed init and `finish`.
#[derive(Default)]
struct Staged {
    initialized: bool,
    rings: Option<RingBuffers>,
    ctx: Option<ContextHandle>,
    render_target: Option<RenderTargetHandle>,
    swapchain: Option<SwapChain>,
    patcher: Option<ShaderPatcher>,
    pipeline: Option<ShaderPipeline>,
    quad: Option<QuadRenderer>,
}

impl Staged {
    fn build<D: Driver>(
        &mut self,
        driver: &mut D,
        memory: &mut GpuMemory,
        init: &RenderInit,
        link: &DisplayLink,
    ) -> Result<(), Error> {
        let geometry = init.display;

        let on_display = link.callback(driver.display(), geometry);
        driver
            .initialize(
                &InitializeParams {
                    display_queue_max_pending: init.max_pending_swaps,
                    parameter_buffer_size: init.parameter_buffer_size,
                },
                on_display,
            )
            .map_err(Error::unavailable(InitStage::Initialize))?;
        self.initialized = true;

        let rings = self.rings.insert(
            RingBuffers::create(driver, memory, &init.rings)
                .map_err(Error::unavailable(InitStage::RingBuffers))?,
        );

        let ctx = driver
            .create_context(&rings.context_params(init.host_mem_size))
            .map_err(Error::unavailable(InitStage::Context))?;
        self.ctx = Some(ctx);

        self.render_target = Some(
            driver
                .create_render_target(&RenderTargetParams::single_scene(
                    geometry.width,
                    geometry.height,
                ))
                .map_err(Error::unavailable(InitStage::RenderTarget))?,
        );

        self.swapchain = Some(SwapChain::create(driver, memory, geometry, link.clone())?);
        driver.set_front_stencil(ctx, &StencilState::PASSTHROUGH);

        let patcher = self.patcher.insert(
            ShaderPatcher::create(driver, memory, &init.patcher)
                .map_err(Error::unavailable(InitStage::ShaderPatcher))?,
        );

        let pipeline = self.pipeline.insert(
            ShaderPipeline::register_and_link(driver, patcher)
                .map_err(Error::unavailable(InitStage::ShaderPipeline))?,
        );

        self.quad = Some(
            QuadRenderer::create(driver, memory)
                .map_err(Error::unavailable(InitStage::QuadBuffers))?,
        );

        pipeline.bind(driver, ctx);
        Ok(())
    }

    /// Waits for the GPU, then releases programs, quad buffers, display
    /// buffers, program registrations, the patcher, the render target, the
    /// context and the rings, and finally shuts the driver down.
    fn teardown<D: Driver>(self, driver: &mut D, memory: &mut GpuMemory) {
        if let Some(ctx) = self.ctx {
            driver.finish(ctx);
        }
        if let (Some(pipeline), Some(patcher)) = (&self.pipeline, &self.patcher) {
            pipeline.release_programs(driver, patcher);
        }
        if let Some(quad) = self.quad {
            quad.destroy(driver, memory);
        }
        if let Some(swapchain) = self.swapchain {
            swapchain.destroy(driver, memory);
        }
        if let Some(patcher) = self.patcher {
            if let Some(pipeline) = self.pipeline {
                pipeline.unregister(driver, &patcher);
            }
            patcher.destroy(driver, memory);
        }
        if let Some(target) = self.render_target {
            if let Err(err) = driver.destroy_render_target(target) {
                log::warn!("failed to destroy render target: {err}");
            }
        }
        if let Some(ctx) = self.ctx {
            if let Err(err) = driver.destroy_context(ctx) {
                log::warn!("failed to destroy context: {err}");
            }
        }
        if let Some(rings) = self.rings {
            rings.destroy(driver, memory);
        }
        if self.initialized {
            driver.terminate();
        }
    }
}

/// The render/present subsystem.
///
/// Owns the driver and every GPU resource: command rings, context, render
/// target, swap chain, shader patcher and pipeline, quad buffers and all
/// textures. Construction is initialization; [`RenderContext::finish`] is
/// the mirror teardown and hands the driver back.
///
/// All calls come from one thread. Scenes follow
/// `begin_scene → draw_texture* → end_scene → present`.
pub struct RenderContext<D: Driver> {
    driver: D,
    memory: GpuMemory,
    ctx: ContextHandle,
    rings: RingBuffers,
    render_target: RenderTargetHandle,
    swapchain: SwapChain,
    patcher: ShaderPatcher,
    pipeline: ShaderPipeline,
    quad: QuadRenderer,

    /// Maps display pixels to clip space.
    display_wvp: [f32; 16],
    scene: SceneState,
    textures: SlotMap<TextureId, Texture>,
    texture_memblock: MemBlockType,
    full_drain_on_present: bool,
    guard: FinishGuard,
}

impl<D: Driver> RenderContext<D> {
    /// Initializes the driver and builds every resource rendering needs.
    ///
    /// Any failure is fatal: everything created so far is released and
    /// [`Error::Unavailable`] is returned.
    pub fn new(driver: D, init: RenderInit) -> Result<Self, Error> {
        Self::create(driver, init).map_err(|(err, _)| err)
    }

    /// Like [`RenderContext::new`], but hands the driver back on failure.
    pub fn create(mut driver: D, init: RenderInit) -> Result<Self, (Error, D)> {
        let mut memory = GpuMemory::new();
        let link = DisplayLink::new(init.vblank_wait);
        let mut staged = Staged::default();

        if let Err(err) = staged.build(&mut driver, &mut memory, &init, &link) {
            log::error!("render context initialization failed: {err}");
            staged.teardown(&mut driver, &mut memory);
            return Err((err, driver));
        }

        let Staged {
            initialized: true,
            rings: Some(rings),
            ctx: Some(ctx),
            render_target: Some(render_target),
            swapchain: Some(swapchain),
            patcher: Some(patcher),
            pipeline: Some(pipeline),
            quad: Some(quad),
        } = staged
        else {
            unreachable!("a successful build completes every stage")
        };

        let geometry = init.display;
        log::info!(
            "render context ready ({}x{}, vblank wait {}, full drain {})",
            geometry.width,
            geometry.height,
            init.vblank_wait,
            init.full_drain_on_present
        );

        Ok(Self {
            driver,
            memory,
            ctx,
            rings,
            render_target,
            swapchain,
            patcher,
            pipeline,
            quad,
            display_wvp: pixel_projection(geometry.width, geometry.height),
            scene: SceneState::Idle,
            textures: SlotMap::with_key(),
            texture_memblock: init.texture_memblock,
            full_drain_on_present: init.full_drain_on_present,
            guard: FinishGuard { armed: true },
        })
    }

    /// Tears everything down and returns the driver.
    ///
    /// An open scene is ended and textures still alive are released first.
    pub fn finish(self) -> D {
        let RenderContext {
            mut driver,
            mut memory,
            ctx,
            rings,
            render_target,
            swapchain,
            patcher,
            pipeline,
            quad,
            scene,
            textures,
            mut guard,
            ..
        } = self;
        guard.armed = false;

        if let SceneState::Drawing { target, .. } = scene {
            log::warn!("finishing with a scene in progress on {target:?}");
            if let Err(err) = driver.end_scene(ctx) {
                log::warn!("failed to end scene: {err}");
            }
        }

        driver.finish(ctx);
        if !textures.is_empty() {
            log::warn!("releasing {} textures still alive at finish", textures.len());
        }
        for (_, texture) in textures {
            texture.destroy(&mut driver, &mut memory);
        }

        Staged {
            initialized: true,
            rings: Some(rings),
            ctx: Some(ctx),
            render_target: Some(render_target),
            swapchain: Some(swapchain),
            patcher: Some(patcher),
            pipeline: Some(pipeline),
            quad: Some(quad),
        }
        .teardown(&mut driver, &mut memory);

        let stats = memory.stats();
        if stats.outstanding() != 0 {
            log::warn!("{} GPU allocations outstanding after finish", stats.outstanding());
        }
        log::info!(
            "render context finished ({} allocations, {} frees)",
            stats.allocs,
            stats.frees
        );
        driver
    }

    // ── textures ──────────────────────────────────────────────────────────

    /// Allocates a zeroed texture from the current texture memory type.
    pub fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<TextureId, Error> {
        let texture = Texture::create(
            &mut self.driver,
            &mut self.memory,
            self.texture_memblock,
            width,
            height,
            format,
        )?;
        let id = self.textures.insert(texture);
        log::debug!("created {width}x{height} {format:?} texture {id:?}");
        Ok(id)
    }

    /// Allocates a texture that scenes can render into.
    pub fn create_render_target_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<TextureId, Error> {
        let texture = Texture::create_render_target(
            &mut self.driver,
            &mut self.memory,
            self.texture_memblock,
            width,
            height,
            format,
        )?;
        let id = self.textures.insert(texture);
        log::debug!("created {width}x{height} render target texture {id:?}");
        Ok(id)
    }

    /// Waits for the GPU, then releases the texture and all its memory.
    ///
    /// Unknown ids are ignored. Nothing can be destroyed while a scene is
    /// open: draws recorded into it are not submitted until `end_scene`, so
    /// `finish` cannot wait for them.
    pub fn destroy_texture(&mut self, id: TextureId) -> Result<(), Error> {
        if self.is_drawing() {
            return Err(Error::SceneInProgress);
        }
        let Some(texture) = self.textures.remove(id) else {
            return Ok(());
        };
        self.driver.finish(self.ctx);
        texture.destroy(&mut self.driver, &mut self.memory);
        Ok(())
    }

    pub fn texture(&self, id: TextureId) -> Result<&Texture, Error> {
        self.textures.get(id).ok_or(Error::UnknownTexture)
    }

    fn texture_mut(&mut self, id: TextureId) -> Result<&mut Texture, Error> {
        self.textures.get_mut(id).ok_or(Error::UnknownTexture)
    }

    pub fn texture_format(&self, id: TextureId) -> Result<TextureFormat, Error> {
        self.texture(id).map(Texture::format)
    }

    pub fn texture_width(&self, id: TextureId) -> Result<u32, Error> {
        self.texture(id).map(Texture::width)
    }

    pub fn texture_height(&self, id: TextureId) -> Result<u32, Error> {
        self.texture(id).map(Texture::height)
    }

    /// Row pitch in bytes.
    pub fn texture_stride(&self, id: TextureId) -> Result<u32, Error> {
        self.texture(id).map(Texture::stride)
    }

    pub fn texture_data_ptr(&self, id: TextureId) -> Result<NonNull<u8>, Error> {
        self.texture(id).map(Texture::data_ptr)
    }

    /// CPU view of the pixels, `stride * height` bytes.
    pub fn texture_pixels_mut(&mut self, id: TextureId) -> Result<&mut [u8], Error> {
        self.texture_mut(id).map(Texture::pixels_mut)
    }

    /// Palette entries of a paletted texture, `None` for other formats.
    pub fn texture_palette_mut(&mut self, id: TextureId) -> Result<Option<&mut [u32]>, Error> {
        self.texture_mut(id).map(Texture::palette_mut)
    }

    /// Places the texture's top-left corner at `(x, y)` display pixels and
    /// scales it by `(scale_x, scale_y)` when drawn.
    pub fn set_scale(
        &mut self,
        id: TextureId,
        x: f32,
        y: f32,
        scale_x: f32,
        scale_y: f32,
    ) -> Result<(), Error> {
        let texture = self.textures.get_mut(id).ok_or(Error::UnknownTexture)?;
        texture.set_placement(Placement {
            x,
            y,
            scale_x,
            scale_y,
        });
        let rect = QuadRect::from_placement(texture.placement(), texture.width(), texture.height());
        self.quad
            .place(rect)
            .map_err(Error::driver("update quad vertices"))?;
        Ok(())
    }

    pub fn set_texture_filter(
        &mut self,
        id: TextureId,
        min: TextureFilter,
        mag: TextureFilter,
    ) -> Result<(), Error> {
        self.texture_mut(id)?.set_filters(min, mag);
        Ok(())
    }

    /// Logical and on-display rectangles of a texture drawn at its current
    /// placement.
    pub fn presented_extents(&self, id: TextureId) -> Result<PresentedExtents, Error> {
        let texture = self.texture(id)?;
        let rect = QuadRect::from_placement(texture.placement(), texture.width(), texture.height());
        let geometry = self.swapchain.geometry();
        Ok(PresentedExtents {
            logical: Rect::from_size(texture.width(), texture.height()),
            scaled: Rect::new(rect.x, rect.y, rect.width, rect.height),
            display: Vec2::from_size(geometry.width, geometry.height),
        })
    }

    // ── scenes ────────────────────────────────────────────────────────────

    /// Starts a scene on the back display buffer. Does nothing if a scene is
    /// already open.
    pub fn begin_scene(&mut self) -> Result<(), Error> {
        if let SceneState::Drawing { .. } = self.scene {
            return Ok(());
        }
        self.driver
            .begin_scene(
                self.ctx,
                self.render_target,
                Some(self.swapchain.back_sync()),
                self.swapchain.back_surface(),
                self.swapchain.depth_stencil(),
            )
            .map_err(Error::driver("begin scene"))?;
        self.scene = SceneState::Drawing {
            target: SceneTarget::Display,
            wvp: self.display_wvp,
        };
        Ok(())
    }

    /// Starts a scene rendering into a render-target texture, with a
    /// projection matching the texture's size.
    pub fn begin_texture_scene(&mut self, id: TextureId) -> Result<(), Error> {
        if let SceneState::Drawing { .. } = self.scene {
            return Err(Error::SceneInProgress);
        }
        let texture = self.textures.get(id).ok_or(Error::UnknownTexture)?;
        let rt = texture.render_target().ok_or(Error::NotRenderTarget)?;
        self.driver
            .begin_scene(self.ctx, rt.target, None, &rt.color, &rt.depth_stencil)
            .map_err(Error::driver("begin texture scene"))?;
        self.scene = SceneState::Drawing {
            target: SceneTarget::Texture(id),
            wvp: pixel_projection(texture.width(), texture.height()),
        };
        Ok(())
    }

    /// Draws one textured quad at the texture's placement.
    pub fn draw_texture(&mut self, id: TextureId) -> Result<(), Error> {
        let SceneState::Drawing { wvp, .. } = self.scene else {
            return Err(Error::SceneNotActive);
        };
        let texture = self.textures.get(id).ok_or(Error::UnknownTexture)?;
        self.quad
            .draw(&mut self.driver, self.ctx, &self.pipeline, texture, &wvp)
            .map_err(Error::driver("draw texture"))
    }

    pub fn end_scene(&mut self) -> Result<(), Error> {
        if let SceneState::Idle = self.scene {
            return Err(Error::SceneNotActive);
        }
        self.driver
            .end_scene(self.ctx)
            .map_err(Error::driver("end scene"))?;
        self.scene = SceneState::Idle;
        Ok(())
    }

    /// Queues the back buffer for display and advances the buffer indices.
    ///
    /// Drains the GPU first when full drain is enabled; blocks until the
    /// buffer is shown when vblank waiting is enabled.
    pub fn present(&mut self) -> Result<(), Error> {
        if let SceneState::Drawing { .. } = self.scene {
            return Err(Error::SceneInProgress);
        }
        if self.full_drain_on_present {
            self.driver.finish(self.ctx);
        }
        self.swapchain
            .present(&mut self.driver)
            .map_err(Error::driver("present"))
    }

    /// Blocks until the GPU has finished every submitted scene.
    pub fn wait_rendering_done(&mut self) {
        self.driver.finish(self.ctx);
    }

    // ── settings ──────────────────────────────────────────────────────────

    pub fn set_vblank_wait(&mut self, enable: bool) {
        self.swapchain.set_vblank_wait(enable);
    }

    pub fn vblank_wait(&self) -> bool {
        self.swapchain.vblank_wait()
    }

    pub fn set_full_drain_on_present(&mut self, enable: bool) {
        self.full_drain_on_present = enable;
    }

    pub fn full_drain_on_present(&self) -> bool {
        self.full_drain_on_present
    }

    /// Memory type for textures created from now on.
    pub fn set_texture_memblock_type(&mut self, ty: MemBlockType) {
        self.texture_memblock = ty;
    }

    pub fn texture_memblock_type(&self) -> MemBlockType {
        self.texture_memblock
    }

    // ── inspection ────────────────────────────────────────────────────────

    #[inline]
    pub fn display_geometry(&self) -> DisplayGeometry {
        self.swapchain.geometry()
    }

    #[inline]
    pub fn back_buffer_index(&self) -> usize {
        self.swapchain.back_index()
    }

    #[inline]
    pub fn front_buffer_index(&self) -> usize {
        self.swapchain.front_index()
    }

    #[inline]
    pub fn present_count(&self) -> u64 {
        self.swapchain.present_count()
    }

    /// Color surface of display buffer `index`.
    pub fn display_surface(&self, index: usize) -> Option<&ColorSurface> {
        self.swapchain.surface(index)
    }

    pub fn is_drawing(&self) -> bool {
        matches!(self.scene, SceneState::Drawing { .. })
    }

    pub fn scene_target(&self) -> Option<SceneTarget> {
        match self.scene {
            SceneState::Idle => None,
            SceneState::Drawing { target, .. } => Some(target),
        }
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn alloc_stats(&self) -> AllocStats {
        self.memory.stats()
    }

    /// The projection used for scenes on the display.
    pub fn display_projection(&self) -> &[f32; 16] {
        &self.display_wvp
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

}

impl RenderContext<HeadlessDriver> {
    /// Makes the driver fail the allocation after `successes` more succeed.
    pub fn fail_allocation_after(&mut self, successes: u32) {
        self.driver.fail_allocation_after(successes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DISPLAY_BUFFER_COUNT;
    use crate::driver::headless::HeadlessConfig;
    use crate::texture::TextureError;

    fn small_init() -> RenderInit {
        RenderInit {
            display: DisplayGeometry {
                width: 64,
                height: 32,
                stride: 64,
            },
            ..RenderInit::default()
        }
    }

    fn context() -> RenderContext<HeadlessDriver> {
        RenderContext::new(HeadlessDriver::new(HeadlessConfig::for_tests()), small_init()).unwrap()
    }

    #[test]
    fn init_and_finish_leave_nothing_behind() {
        let rc = context();
        let driver = rc.driver();
        assert!(driver.is_initialized());
        assert_eq!(driver.live_contexts(), 1);
        assert_eq!(driver.live_sync_objects(), DISPLAY_BUFFER_COUNT);
        assert_eq!(driver.live_programs(), 2);
        assert_eq!(driver.live_linked_programs(), 2);

        let driver = rc.finish();
        assert_eq!(driver.live_objects(), 0);
        assert!(!driver.is_initialized());
    }

    #[test]
    fn stencil_defaults_to_always_keep_reference_one() {
        let rc = context();
        assert_eq!(
            rc.driver().current_stencil(rc.ctx),
            Some(StencilState::PASSTHROUGH)
        );
        rc.finish();
    }

    #[test]
    fn every_failed_init_step_unwinds_completely() {
        // Rings, display buffers, depth/stencil, patcher and quad buffers.
        const INIT_BLOCKS: u32 = 4 + DISPLAY_BUFFER_COUNT as u32 + 2 + 3 + 2;

        for successes in 0..INIT_BLOCKS {
            let mut driver = HeadlessDriver::new(HeadlessConfig::for_tests());
            driver.fail_allocation_after(successes);

            let (err, driver) = match RenderContext::create(driver, small_init()) {
                Ok(_) => panic!("init succeeded with {successes} allocations"),
                Err(failure) => failure,
            };
            assert!(matches!(err, Error::Unavailable { .. }), "{err}");
            assert_eq!(driver.live_objects(), 0, "after {successes} allocations");
            assert!(!driver.is_initialized());
        }

        let mut driver = HeadlessDriver::new(HeadlessConfig::for_tests());
        driver.fail_allocation_after(INIT_BLOCKS);
        let rc = RenderContext::new(driver, small_init()).unwrap();
        assert_eq!(rc.alloc_stats().outstanding(), u64::from(INIT_BLOCKS));
        rc.finish();
    }

    #[test]
    fn failed_init_reports_its_stage() {
        let mut driver = HeadlessDriver::new(HeadlessConfig::for_tests());
        driver.fail_allocation_after(4);
        let err = RenderContext::new(driver, small_init()).err().unwrap();
        assert!(matches!(
            err,
            Error::Unavailable {
                stage: InitStage::DisplayBuffers,
                ..
            }
        ));
    }

    #[test]
    fn begin_scene_twice_is_a_no_op() {
        let mut rc = context();
        rc.begin_scene().unwrap();
        rc.begin_scene().unwrap();
        assert!(rc.is_drawing());
        rc.end_scene().unwrap();
        assert_eq!(rc.driver().scenes_completed(), 1);
        assert!(matches!(rc.end_scene(), Err(Error::SceneNotActive)));
        rc.finish();
    }

    #[test]
    fn scene_protocol_is_enforced() {
        let mut rc = context();
        let id = rc.create_texture(8, 8, TextureFormat::A8B8G8R8).unwrap();

        assert!(matches!(rc.draw_texture(id), Err(Error::SceneNotActive)));
        rc.begin_scene().unwrap();
        assert!(matches!(rc.present(), Err(Error::SceneInProgress)));
        rc.end_scene().unwrap();
        rc.present().unwrap();

        rc.destroy_texture(id).unwrap();
        rc.begin_scene().unwrap();
        assert!(matches!(rc.draw_texture(id), Err(Error::UnknownTexture)));
        rc.end_scene().unwrap();
        rc.finish();
    }

    #[test]
    fn textures_outlive_the_scene_that_drew_them() {
        let mut rc = context();
        let drawn = rc.create_texture(8, 8, TextureFormat::R5G6B5).unwrap();
        let idle = rc.create_texture(8, 8, TextureFormat::L8).unwrap();
        let before = rc.alloc_stats();

        rc.begin_scene().unwrap();
        rc.draw_texture(drawn).unwrap();
        assert!(matches!(rc.destroy_texture(drawn), Err(Error::SceneInProgress)));
        assert!(matches!(rc.destroy_texture(idle), Err(Error::SceneInProgress)));
        assert_eq!(rc.texture_count(), 2);
        assert_eq!(rc.alloc_stats().outstanding(), before.outstanding());
        rc.end_scene().unwrap();

        rc.destroy_texture(drawn).unwrap();
        rc.destroy_texture(idle).unwrap();
        assert_eq!(rc.texture_count(), 0);
        rc.present().unwrap();
        rc.finish();
    }

    #[test]
    fn buffer_indices_advance_round_robin() {
        let mut rc = context();
        assert_eq!((rc.back_buffer_index(), rc.front_buffer_index()), (0, 0));

        for k in 1..=7usize {
            rc.begin_scene().unwrap();
            rc.end_scene().unwrap();
            rc.present().unwrap();
            assert_eq!(rc.back_buffer_index(), k % DISPLAY_BUFFER_COUNT);
            assert_eq!(rc.front_buffer_index(), (k - 1) % DISPLAY_BUFFER_COUNT);
        }
        assert_eq!(rc.present_count(), 7);
        rc.finish();
    }

    #[test]
    fn hundred_twenty_frames_of_a_16_bit_texture() {
        let mut rc = RenderContext::new(
            HeadlessDriver::new(HeadlessConfig::for_tests()),
            RenderInit::default(),
        )
        .unwrap();
        let id = rc.create_texture(64, 64, TextureFormat::R5G6B5).unwrap();

        for frame in 0..120u32 {
            let pixels = rc.texture_pixels_mut(id).unwrap();
            let shade = (frame % 32) as u16;
            for px in pixels.chunks_exact_mut(2) {
                px.copy_from_slice(&(shade << 11).to_le_bytes());
            }

            rc.begin_scene().unwrap();
            rc.draw_texture(id).unwrap();
            rc.end_scene().unwrap();
            rc.present().unwrap();
        }

        assert_eq!(rc.present_count(), 120);
        assert_eq!(rc.back_buffer_index(), 120 % DISPLAY_BUFFER_COUNT);
        assert_eq!(rc.front_buffer_index(), 119 % DISPLAY_BUFFER_COUNT);
        assert_eq!(rc.driver().draw_count(), 120);
        assert_eq!(rc.driver().scenes_completed(), 120);
        assert_eq!(rc.driver().finish_count(), 120);

        rc.destroy_texture(id).unwrap();
        let driver = rc.finish();
        assert_eq!(driver.live_objects(), 0);
    }

    #[test]
    fn textures_balance_their_allocations() {
        let mut rc = context();
        let before = rc.alloc_stats();

        let ids: Vec<_> = TextureFormat::ALL
            .iter()
            .enumerate()
            .map(|(i, &format)| rc.create_texture(10 + i as u32, 7, format).unwrap())
            .collect();
        for &id in &ids {
            let format = rc.texture_format(id).unwrap();
            assert_eq!(rc.texture(id).unwrap().has_palette(), format.is_paletted());
            assert_eq!(
                rc.texture_palette_mut(id).unwrap().is_some(),
                format.is_paletted()
            );
        }
        for id in ids {
            rc.destroy_texture(id).unwrap();
        }

        let after = rc.alloc_stats();
        assert_eq!(after.outstanding(), before.outstanding());
        assert_eq!(after.live_bytes, before.live_bytes);
        rc.finish();
    }

    #[test]
    fn texture_failure_leaves_the_context_usable() {
        let mut rc = context();
        let before = rc.alloc_stats();

        rc.fail_allocation_after(1);
        let err = rc.create_texture(16, 16, TextureFormat::P8Abgr).unwrap_err();
        assert!(matches!(err, Error::Texture(TextureError::Allocation { .. })));
        assert_eq!(rc.alloc_stats().outstanding(), before.outstanding());

        assert!(matches!(
            rc.create_texture(0, 4, TextureFormat::L8),
            Err(Error::Texture(TextureError::InvalidDimensions { .. }))
        ));

        let id = rc.create_texture(16, 16, TextureFormat::P8Abgr).unwrap();
        rc.begin_scene().unwrap();
        rc.draw_texture(id).unwrap();
        rc.end_scene().unwrap();
        rc.present().unwrap();
        rc.finish();
    }

    #[test]
    fn draws_land_in_the_back_buffer() {
        let mut rc = context();
        let id = rc.create_texture(4, 4, TextureFormat::R5G6B5).unwrap();
        for px in rc.texture_pixels_mut(id).unwrap().chunks_exact_mut(2) {
            px.copy_from_slice(&0xF800u16.to_le_bytes());
        }
        rc.set_scale(id, 8.0, 4.0, 2.0, 2.0).unwrap();

        let back = rc.back_buffer_index();
        rc.begin_scene().unwrap();
        rc.draw_texture(id).unwrap();
        rc.end_scene().unwrap();

        let surface = *rc.display_surface(back).unwrap();
        assert_eq!(rc.driver().read_pixel(&surface, 10, 6), Some([255, 0, 0, 255]));
        assert_eq!(rc.driver().read_pixel(&surface, 2, 2), Some([0, 0, 0, 255]));
        assert_eq!(rc.driver().read_pixel(&surface, 20, 6), Some([0, 0, 0, 255]));

        rc.present().unwrap();
        rc.finish();
    }

    #[test]
    fn render_target_textures_take_their_own_scenes() {
        let mut rc = context();
        let target = rc
            .create_render_target_texture(16, 16, TextureFormat::A8B8G8R8)
            .unwrap();
        let plain = rc.create_texture(8, 8, TextureFormat::L8).unwrap();
        for px in rc.texture_pixels_mut(plain).unwrap() {
            *px = 0x80;
        }

        assert!(matches!(
            rc.begin_texture_scene(plain),
            Err(Error::NotRenderTarget)
        ));
        assert!(matches!(
            rc.create_render_target_texture(8, 8, TextureFormat::R5G6B5),
            Err(Error::Texture(TextureError::UnsupportedFormat(_)))
        ));

        rc.begin_texture_scene(target).unwrap();
        assert_eq!(rc.scene_target(), Some(SceneTarget::Texture(target)));
        assert!(matches!(rc.destroy_texture(target), Err(Error::SceneInProgress)));
        rc.draw_texture(plain).unwrap();
        rc.end_scene().unwrap();

        let pixels = rc.texture(target).unwrap().pixels();
        assert_eq!(&pixels[..4], &[0x80, 0x80, 0x80, 0xFF]);
        let stride = rc.texture_stride(target).unwrap() as usize;
        assert_eq!(&pixels[9 * stride + 4 * 9..9 * stride + 4 * 10], &[0, 0, 0, 0]);

        rc.destroy_texture(target).unwrap();
        rc.destroy_texture(plain).unwrap();
        let driver = rc.finish();
        assert_eq!(driver.live_render_targets(), 0);
    }

    #[test]
    fn settings_toggle_at_runtime() {
        let mut rc = context();
        assert!(rc.vblank_wait());
        assert!(rc.full_drain_on_present());
        assert_eq!(rc.texture_memblock_type(), MemBlockType::UserCdramRw);

        rc.set_vblank_wait(false);
        rc.set_full_drain_on_present(false);
        rc.set_texture_memblock_type(MemBlockType::UserRw);

        let id = rc.create_texture(8, 8, TextureFormat::L8).unwrap();
        let finishes = rc.driver().finish_count();
        rc.present().unwrap();
        assert_eq!(rc.driver().finish_count(), finishes);
        assert!(!rc.vblank_wait());

        rc.destroy_texture(id).unwrap();
        rc.finish();
    }

    #[test]
    fn presented_extents_follow_the_placement() {
        let mut rc = context();
        let id = rc.create_texture(16, 8, TextureFormat::L8).unwrap();
        rc.set_scale(id, 8.0, 0.0, 3.0, 4.0).unwrap();

        let extents = rc.presented_extents(id).unwrap();
        assert_eq!(extents.logical, Rect::from_size(16, 8));
        assert_eq!(extents.scaled, Rect::new(8.0, 0.0, 48.0, 32.0));
        assert_eq!(extents.display, Vec2::new(64.0, 32.0));
        rc.finish();
    }
}
