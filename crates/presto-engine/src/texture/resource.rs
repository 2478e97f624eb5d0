use std::ptr::NonNull;

use crate::driver::{
    ColorFormat, ColorSurface, DepthStencilSurface, Driver, DriverError, MemBlockType,
    MemoryAttribs, RenderTargetHandle, RenderTargetParams, TextureDesc, TextureFilter,
};
use crate::memory::{GpuAllocation, GpuMemory, align_up};

use super::format::{TextureFormat, padded_width};

pub const TEXTURE_ALIGNMENT: usize = 16;
pub const PALETTE_ALIGNMENT: usize = 64;
pub const COLOR_SURFACE_ALIGNMENT: usize = 512;
pub const DEPTHSTENCIL_SURFACE_ALIGNMENT: usize = 2048;

/// Largest width or height a texture may have.
pub const MAX_TEXTURE_DIMENSION: u32 = 4096;

/// Number of 32-bit entries in a P8 palette.
pub const PALETTE_ENTRIES: usize = 256;

/// Depth/stencil surfaces are laid out in square tiles of this many samples.
pub const TILE_SIZE: u32 = 32;

/// Allocation stage of a texture, reported when it fails.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TextureStep {
    Pixels,
    Palette,
    DepthBuffer,
    RenderTarget,
}

#[derive(Debug, thiserror::Error)]
pub enum TextureError {
    #[error("invalid texture size {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("{0:?} textures cannot be render targets")]
    UnsupportedFormat(TextureFormat),
    #[error("texture {step:?} allocation failed")]
    Allocation {
        step: TextureStep,
        #[source]
        source: DriverError,
    },
}

/// Where a texture lands when drawn: top-left corner and per-axis scale.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Placement {
    pub x: f32,
    pub y: f32,
    pub scale_x: f32,
    pub scale_y: f32,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
        }
    }
}

/// Extra state of a texture that can be rendered into.
#[derive(Debug)]
pub struct RenderTargetData {
    pub color: ColorSurface,
    pub depth_stencil: DepthStencilSurface,
    pub target: RenderTargetHandle,
    depth: GpuAllocation,
}

/// A GPU pixel buffer with its descriptor.
///
/// Paletted formats always carry a palette; other formats never do.
#[derive(Debug)]
pub struct Texture {
    desc: TextureDesc,
    data: GpuAllocation,
    palette: Option<GpuAllocation>,
    render_target: Option<RenderTargetData>,
    placement: Placement,
}

impl Texture {
    /// Allocates a zeroed linear texture.
    ///
    /// Nothing stays allocated when this fails.
    pub fn create<D: Driver>(
        driver: &mut D,
        memory: &mut GpuMemory,
        memblock: MemBlockType,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<Self, TextureError> {
        check_dimensions(width, height)?;

        let mut data = memory
            .alloc_gpu(
                driver,
                memblock,
                format.footprint(width, height),
                TEXTURE_ALIGNMENT,
                MemoryAttribs::ReadWrite,
            )
            .map_err(|source| TextureError::Allocation {
                step: TextureStep::Pixels,
                source,
            })?;
        data.bytes_mut().fill(0);

        let mut desc = TextureDesc::linear(data.address(), format, width, height);

        let palette = if format.is_paletted() {
            let mut palette = match memory.alloc_gpu(
                driver,
                memblock,
                PALETTE_ENTRIES * size_of::<u32>(),
                PALETTE_ALIGNMENT,
                MemoryAttribs::Read,
            ) {
                Ok(palette) => palette,
                Err(source) => {
                    memory.free(driver, data);
                    return Err(TextureError::Allocation {
                        step: TextureStep::Palette,
                        source,
                    });
                }
            };
            palette.bytes_mut().fill(0);
            desc.palette = Some(palette.address());
            Some(palette)
        } else {
            None
        };

        log::debug!("created {width}x{height} {format:?} texture");

        Ok(Self {
            desc,
            data,
            palette,
            render_target: None,
            placement: Placement::default(),
        })
    }

    /// Allocates a texture that can also be the target of a scene.
    ///
    /// Only [`TextureFormat::A8B8G8R8`] is accepted, matching the color
    /// surface format scenes render in.
    pub fn create_render_target<D: Driver>(
        driver: &mut D,
        memory: &mut GpuMemory,
        memblock: MemBlockType,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<Self, TextureError> {
        if format != TextureFormat::A8B8G8R8 {
            return Err(TextureError::UnsupportedFormat(format));
        }

        let mut texture = Self::create(driver, memory, memblock, width, height, format)?;
        match RenderTargetData::create(driver, memory, &texture.data, width, height) {
            Ok(rt) => {
                texture.render_target = Some(rt);
                Ok(texture)
            }
            Err(err) => {
                texture.destroy(driver, memory);
                Err(err)
            }
        }
    }

    /// Releases the render target, depth buffer, palette and pixels, in
    /// that order.
    ///
    /// The GPU must be idle with respect to this texture.
    pub fn destroy<D: Driver>(self, driver: &mut D, memory: &mut GpuMemory) {
        if let Some(rt) = self.render_target {
            if let Err(err) = driver.destroy_render_target(rt.target) {
                log::warn!("failed to destroy texture render target: {err}");
            }
            memory.free(driver, rt.depth);
        }
        if let Some(palette) = self.palette {
            memory.free(driver, palette);
        }
        memory.free(driver, self.data);
        log::debug!(
            "destroyed {}x{} {:?} texture",
            self.desc.width,
            self.desc.height,
            self.desc.format
        );
    }

    #[inline]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    #[inline]
    pub fn format(&self) -> TextureFormat {
        self.desc.format
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.desc.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.desc.height
    }

    /// Row pitch in bytes. Wider than `width * bpp` unless the width is a
    /// multiple of 8.
    #[inline]
    pub fn stride(&self) -> u32 {
        self.desc.stride()
    }

    #[inline]
    pub fn data_ptr(&self) -> NonNull<u8> {
        self.data.as_ptr()
    }

    /// The `stride * height` bytes of the image.
    pub fn pixels(&self) -> &[u8] {
        let len = self.desc.format.footprint(self.desc.width, self.desc.height);
        &self.data.bytes()[..len]
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        let len = self.desc.format.footprint(self.desc.width, self.desc.height);
        &mut self.data.bytes_mut()[..len]
    }

    #[inline]
    pub fn has_palette(&self) -> bool {
        self.palette.is_some()
    }

    /// Palette entries in A8B8G8R8, for paletted formats.
    pub fn palette_mut(&mut self) -> Option<&mut [u32]> {
        let palette = self.palette.as_mut()?;
        let bytes = &mut palette.bytes_mut()[..PALETTE_ENTRIES * size_of::<u32>()];
        Some(bytemuck::cast_slice_mut(bytes))
    }

    pub fn set_filters(&mut self, min: TextureFilter, mag: TextureFilter) {
        self.desc.min_filter = min;
        self.desc.mag_filter = mag;
    }

    #[inline]
    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn set_placement(&mut self, placement: Placement) {
        self.placement = placement;
    }

    #[inline]
    pub fn render_target(&self) -> Option<&RenderTargetData> {
        self.render_target.as_ref()
    }

    /// Allocations owned by this texture, pixels first.
    pub fn allocation_count(&self) -> usize {
        1 + usize::from(self.palette.is_some())
            + usize::from(self.render_target.is_some())
    }
}

impl RenderTargetData {
    fn create<D: Driver>(
        driver: &mut D,
        memory: &mut GpuMemory,
        pixels: &GpuAllocation,
        width: u32,
        height: u32,
    ) -> Result<Self, TextureError> {
        let color = ColorSurface::linear(
            ColorFormat::A8B8G8R8,
            width,
            height,
            padded_width(width),
            pixels.address(),
        );

        let aligned_width = align_up(width as usize, TILE_SIZE as usize);
        let aligned_height = align_up(height as usize, TILE_SIZE as usize);
        let sample_count = aligned_width * aligned_height;

        let depth = memory
            .alloc_gpu(
                driver,
                MemBlockType::UserRwUncache,
                4 * sample_count,
                DEPTHSTENCIL_SURFACE_ALIGNMENT,
                MemoryAttribs::ReadWrite,
            )
            .map_err(|source| TextureError::Allocation {
                step: TextureStep::DepthBuffer,
                source,
            })?;

        let depth_stencil = DepthStencilSurface::tiled(aligned_width as u32, depth.address(), None);

        let target = match driver.create_render_target(&RenderTargetParams::single_scene(width, height)) {
            Ok(target) => target,
            Err(source) => {
                memory.free(driver, depth);
                return Err(TextureError::Allocation {
                    step: TextureStep::RenderTarget,
                    source,
                });
            }
        };

        Ok(Self {
            color,
            depth_stencil,
            target,
            depth,
        })
    }
}

fn check_dimensions(width: u32, height: u32) -> Result<(), TextureError> {
    let valid = |v: u32| (1..=MAX_TEXTURE_DIMENSION).contains(&v);
    if valid(width) && valid(height) {
        Ok(())
    } else {
        Err(TextureError::InvalidDimensions { width, height })
    }
}
