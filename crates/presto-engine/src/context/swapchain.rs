use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::driver::{
    ColorFormat, ColorSurface, DepthStencilSurface, Display, DisplayCallback, DisplayData,
    DisplayPixelFormat, Driver, DriverError, FrameBuf, MemBlockType, MemoryAttribs, SetBufSync,
    SyncObject,
};
use crate::memory::{AllocRequest, GpuAllocation, GpuMemory, align_up};
use crate::texture::{COLOR_SURFACE_ALIGNMENT, DEPTHSTENCIL_SURFACE_ALIGNMENT, TILE_SIZE};

use super::error::{Error, InitStage};
use super::init::DisplayGeometry;

/// Display buffers cycled by [`SwapChain::present`].
pub const DISPLAY_BUFFER_COUNT: usize = 3;

/// Opaque black in A8B8G8R8.
const CLEAR_COLOR: u32 = 0xFF00_0000;

/// Number of display callbacks that have run, with a way to wait for more.
#[derive(Debug, Default)]
struct FlipSignal {
    flips: Mutex<u64>,
    flipped: Condvar,
}

impl FlipSignal {
    fn signal(&self) {
        *self.flips.lock() += 1;
        self.flipped.notify_all();
    }

    fn count(&self) -> u64 {
        *self.flips.lock()
    }

    fn wait_for(&self, target: u64) {
        let mut flips = self.flips.lock();
        while *flips < target {
            self.flipped.wait(&mut flips);
        }
    }
}

/// State shared between the swap chain and the display callback.
///
/// The callback sees only this and the buffer address carried by each
/// display-queue entry.
#[derive(Debug, Clone)]
pub(crate) struct DisplayLink {
    vblank_wait: Arc<AtomicBool>,
    flips: Arc<FlipSignal>,
}

impl DisplayLink {
    pub(crate) fn new(vblank_wait: bool) -> Self {
        Self {
            vblank_wait: Arc::new(AtomicBool::new(vblank_wait)),
            flips: Arc::default(),
        }
    }

    /// Builds the callback run once per display-queue entry: scan the buffer
    /// out from the next frame on, optionally wait for vblank, then signal.
    pub(crate) fn callback<P: Display>(&self, display: P, geometry: DisplayGeometry) -> DisplayCallback {
        let vblank_wait = Arc::clone(&self.vblank_wait);
        let flips = Arc::clone(&self.flips);

        Box::new(move |data: &DisplayData| {
            let frame = FrameBuf {
                base: data.address,
                pitch: geometry.stride,
                pixel_format: DisplayPixelFormat::A8B8G8R8,
                width: geometry.width,
                height: geometry.height,
            };
            if let Err(err) = display.set_frame_buf(&frame, SetBufSync::NextFrame) {
                log::error!("failed to set frame buffer {:#x}: {err}", data.address.0);
            }
            if vblank_wait.load(Ordering::Acquire) {
                display.wait_vblank_start();
            }
            flips.signal();
        })
    }

    fn vblank_wait(&self) -> bool {
        self.vblank_wait.load(Ordering::Acquire)
    }

    fn set_vblank_wait(&self, enable: bool) {
        self.vblank_wait.store(enable, Ordering::Release);
    }
}

#[derive(Debug)]
struct DisplayBuffer {
    memory: GpuAllocation,
    surface: ColorSurface,
    sync: SyncObject,
}

impl DisplayBuffer {
    fn create<D: Driver>(
        driver: &mut D,
        memory: &mut GpuMemory,
        geometry: DisplayGeometry,
    ) -> Result<Self, DriverError> {
        let mut block = memory.alloc_gpu(
            driver,
            MemBlockType::UserCdramRw,
            geometry.buffer_size(),
            COLOR_SURFACE_ALIGNMENT,
            MemoryAttribs::ReadWrite,
        )?;

        for pixel in block.bytes_mut()[..geometry.buffer_size()].chunks_exact_mut(4) {
            pixel.copy_from_slice(&CLEAR_COLOR.to_le_bytes());
        }

        let surface = ColorSurface::linear(
            ColorFormat::A8B8G8R8,
            geometry.width,
            geometry.height,
            geometry.stride,
            block.address(),
        );

        match driver.create_sync_object() {
            Ok(sync) => Ok(Self {
                memory: block,
                surface,
                sync,
            }),
            Err(err) => {
                memory.free(driver, block);
                Err(err)
            }
        }
    }

    /// Zeroes and frees the pixels, then destroys the sync object.
    fn destroy<D: Driver>(mut self, driver: &mut D, memory: &mut GpuMemory) {
        self.memory.bytes_mut().fill(0);
        memory.free(driver, self.memory);
        if let Err(err) = driver.destroy_sync_object(self.sync) {
            log::warn!("failed to destroy display sync object: {err}");
        }
    }
}

/// Depth and stencil buffers shared by every display buffer.
#[derive(Debug)]
struct DepthStencil {
    depth: GpuAllocation,
    stencil: GpuAllocation,
    surface: DepthStencilSurface,
}

impl DepthStencil {
    fn create<D: Driver>(
        driver: &mut D,
        memory: &mut GpuMemory,
        geometry: DisplayGeometry,
    ) -> Result<Self, DriverError> {
        let width = align_up(geometry.width as usize, TILE_SIZE as usize);
        let height = align_up(geometry.height as usize, TILE_SIZE as usize);
        let samples = width * height;
        let plane = AllocRequest::Gpu {
            ty: MemBlockType::UserRwUncache,
            size: 4 * samples,
            alignment: DEPTHSTENCIL_SURFACE_ALIGNMENT,
            attribs: MemoryAttribs::ReadWrite,
        };

        let [depth, stencil] = memory.alloc_batch(driver, [plane, plane])?;
        let surface =
            DepthStencilSurface::tiled(width as u32, depth.address(), Some(stencil.address()));

        Ok(Self {
            depth,
            stencil,
            surface,
        })
    }

    fn destroy<D: Driver>(self, driver: &mut D, memory: &mut GpuMemory) {
        memory.free_all(driver, vec![self.depth, self.stencil]);
    }
}

/// Display buffers, their sync objects and the shared depth/stencil surface.
///
/// Buffers are drawn into and shown round-robin: after every present the
/// front index takes the old back index and back advances by one.
#[derive(Debug)]
pub(crate) struct SwapChain {
    geometry: DisplayGeometry,
    buffers: Vec<DisplayBuffer>,
    depth_stencil: DepthStencil,
    back: usize,
    front: usize,
    presents: u64,
    link: DisplayLink,
}

impl SwapChain {
    /// Allocates [`DISPLAY_BUFFER_COUNT`] cleared buffers and the
    /// depth/stencil surface. Nothing stays allocated on failure.
    pub(crate) fn create<D: Driver>(
        driver: &mut D,
        memory: &mut GpuMemory,
        geometry: DisplayGeometry,
        link: DisplayLink,
    ) -> Result<Self, Error> {
        let mut buffers = Vec::with_capacity(DISPLAY_BUFFER_COUNT);
        for _ in 0..DISPLAY_BUFFER_COUNT {
            match DisplayBuffer::create(driver, memory, geometry) {
                Ok(buffer) => buffers.push(buffer),
                Err(err) => {
                    for buffer in buffers.into_iter().rev() {
                        buffer.destroy(driver, memory);
                    }
                    return Err(Error::unavailable(InitStage::DisplayBuffers)(err));
                }
            }
        }

        let depth_stencil = match DepthStencil::create(driver, memory, geometry) {
            Ok(depth_stencil) => depth_stencil,
            Err(err) => {
                for buffer in buffers.into_iter().rev() {
                    buffer.destroy(driver, memory);
                }
                return Err(Error::unavailable(InitStage::DepthStencil)(err));
            }
        };

        log::debug!(
            "swap chain: {DISPLAY_BUFFER_COUNT} buffers of {}x{} (stride {})",
            geometry.width,
            geometry.height,
            geometry.stride
        );

        Ok(Self {
            geometry,
            buffers,
            depth_stencil,
            back: 0,
            front: 0,
            presents: 0,
            link,
        })
    }

    #[inline]
    pub(crate) fn geometry(&self) -> DisplayGeometry {
        self.geometry
    }

    #[inline]
    pub(crate) fn back_index(&self) -> usize {
        self.back
    }

    #[inline]
    pub(crate) fn front_index(&self) -> usize {
        self.front
    }

    #[inline]
    pub(crate) fn present_count(&self) -> u64 {
        self.presents
    }

    pub(crate) fn back_surface(&self) -> &ColorSurface {
        &self.buffers[self.back].surface
    }

    pub(crate) fn back_sync(&self) -> SyncObject {
        self.buffers[self.back].sync
    }

    pub(crate) fn surface(&self, index: usize) -> Option<&ColorSurface> {
        self.buffers.get(index).map(|b| &b.surface)
    }

    pub(crate) fn depth_stencil(&self) -> &DepthStencilSurface {
        &self.depth_stencil.surface
    }

    pub(crate) fn vblank_wait(&self) -> bool {
        self.link.vblank_wait()
    }

    pub(crate) fn set_vblank_wait(&self, enable: bool) {
        self.link.set_vblank_wait(enable);
    }

    /// Queues the back buffer for display behind the front buffer and
    /// rotates the indices.
    ///
    /// With vblank waiting on, blocks until the display callback for this
    /// entry has run.
    pub(crate) fn present<D: Driver>(&mut self, driver: &mut D) -> Result<(), DriverError> {
        let back = &self.buffers[self.back];
        let front = &self.buffers[self.front];
        driver.display_queue_add_entry(
            front.sync,
            back.sync,
            DisplayData {
                address: back.memory.address(),
            },
        )?;

        self.presents += 1;
        self.front = self.back;
        self.back = (self.back + 1) % DISPLAY_BUFFER_COUNT;

        if self.link.vblank_wait() {
            self.link.flips.wait_for(self.presents);
        }
        log::trace!(
            "present #{} (front {}, back {}, flips {})",
            self.presents,
            self.front,
            self.back,
            self.link.flips.count()
        );
        Ok(())
    }

    /// Drains the display queue, then releases every buffer and the
    /// depth/stencil surface.
    pub(crate) fn destroy<D: Driver>(self, driver: &mut D, memory: &mut GpuMemory) {
        driver.display_queue_finish();
        for buffer in self.buffers {
            buffer.destroy(driver, memory);
        }
        self.depth_stencil.destroy(driver, memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::InitializeParams;
    use crate::driver::headless::{HeadlessConfig, HeadlessDriver};

    fn small() -> DisplayGeometry {
        DisplayGeometry {
            width: 64,
            height: 32,
            stride: 64,
        }
    }

    fn initialized(link: &DisplayLink) -> HeadlessDriver {
        let mut driver = HeadlessDriver::new(HeadlessConfig::for_tests());
        let callback = link.callback(driver.display(), small());
        driver
            .initialize(
                &InitializeParams {
                    display_queue_max_pending: 2,
                    parameter_buffer_size: 1 << 20,
                },
                callback,
            )
            .unwrap();
        driver
    }

    #[test]
    fn buffers_start_opaque_black() {
        let link = DisplayLink::new(true);
        let mut driver = initialized(&link);
        let mut memory = GpuMemory::new();
        let chain = SwapChain::create(&mut driver, &mut memory, small(), link).unwrap();

        assert_eq!(driver.live_sync_objects(), DISPLAY_BUFFER_COUNT);
        for index in 0..DISPLAY_BUFFER_COUNT {
            let surface = chain.surface(index).unwrap();
            assert!(surface.data.is_aligned(COLOR_SURFACE_ALIGNMENT));
            assert_eq!(driver.read_pixel(surface, 0, 0), Some([0, 0, 0, 0xFF]));
            assert_eq!(driver.read_pixel(surface, 63, 31), Some([0, 0, 0, 0xFF]));
        }
        assert_eq!(chain.depth_stencil().stride_in_samples, 64);

        chain.destroy(&mut driver, &mut memory);
        assert_eq!(driver.live_mem_blocks(), 0);
        assert_eq!(driver.live_sync_objects(), 0);
        driver.terminate();
    }

    #[test]
    fn present_rotates_and_waits_for_the_callback() {
        let link = DisplayLink::new(true);
        let mut driver = initialized(&link);
        let display = driver.display();
        let mut memory = GpuMemory::new();
        let mut chain = SwapChain::create(&mut driver, &mut memory, small(), link).unwrap();

        let first = chain.back_surface().data;
        chain.present(&mut driver).unwrap();
        assert_eq!((chain.front_index(), chain.back_index()), (0, 1));
        assert_eq!(display.scanout().map(|f| f.base), Some(first));
        assert_eq!(display.vblank_count(), 1);

        chain.set_vblank_wait(false);
        chain.present(&mut driver).unwrap();
        chain.present(&mut driver).unwrap();
        assert_eq!((chain.front_index(), chain.back_index()), (2, 0));
        assert_eq!(chain.present_count(), 3);

        chain.destroy(&mut driver, &mut memory);
        assert_eq!(display.flip_count(), 3);
        assert_eq!(display.vblank_count(), 1);
        driver.terminate();
    }

    #[test]
    fn failed_depth_allocation_releases_buffers() {
        let link = DisplayLink::new(false);
        let mut driver = initialized(&link);
        let mut memory = GpuMemory::new();
        driver.fail_allocation_after(DISPLAY_BUFFER_COUNT as u32 + 1);

        let err = SwapChain::create(&mut driver, &mut memory, small(), link).unwrap_err();
        assert!(matches!(
            err,
            Error::Unavailable {
                stage: InitStage::DepthStencil,
                ..
            }
        ));
        assert_eq!(driver.live_mem_blocks(), 0);
        assert_eq!(driver.live_sync_objects(), 0);
        assert_eq!(memory.stats().outstanding(), 0);
        driver.terminate();
    }
}
