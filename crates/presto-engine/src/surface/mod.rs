//! Main screen surface.
//!
//! A CPU-writable texture the size of the logical screen, drawn as one quad
//! per flip. The surface layer writes pixels (respecting the pitch), then
//! calls [`ScreenSurface::flip`].

use crate::context::{Error, PresentedExtents, RenderContext, TextureId};
use crate::coords::{Rect, Vec2};
use crate::driver::{Driver, TextureFilter};
use crate::texture::TextureFormat;

/// How the logical screen is laid out on the display.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum ScalingMode {
    /// Actual size, centered.
    #[default]
    Native,
    /// Largest uniform scale that fits, letterboxed.
    Fit,
    /// Fills the display, ignoring aspect ratio.
    Stretch,
}

/// Texture format backing a surface of `bits_per_pixel` depth.
pub fn format_for_depth(bits_per_pixel: u8) -> Result<TextureFormat, Error> {
    match bits_per_pixel {
        16 => Ok(TextureFormat::R5G6B5),
        24 => Ok(TextureFormat::Rgb888),
        32 => Ok(TextureFormat::A8B8G8R8),
        other => Err(Error::UnsupportedSurfaceFormat(other)),
    }
}

#[derive(Debug)]
pub struct ScreenSurface {
    texture: TextureId,
    width: u32,
    height: u32,
    bits_per_pixel: u8,
    dst: Rect,
    bilinear: bool,
}

impl ScreenSurface {
    /// Creates a `width` x `height` surface drawn at the display origin at
    /// its own size.
    pub fn create<D: Driver>(
        ctx: &mut RenderContext<D>,
        width: u32,
        height: u32,
        bits_per_pixel: u8,
    ) -> Result<Self, Error> {
        let format = format_for_depth(bits_per_pixel)?;
        let texture = ctx.create_texture(width, height, format)?;
        log::info!("screen surface {width}x{height}x{bits_per_pixel} ({format:?})");
        Ok(Self {
            texture,
            width,
            height,
            bits_per_pixel,
            dst: Rect::from_size(width, height),
            bilinear: false,
        })
    }

    #[inline]
    pub fn texture(&self) -> TextureId {
        self.texture
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn bits_per_pixel(&self) -> u8 {
        self.bits_per_pixel
    }

    /// Display rectangle the surface is drawn into.
    #[inline]
    pub fn destination(&self) -> Rect {
        self.dst
    }

    #[inline]
    pub fn is_bilinear(&self) -> bool {
        self.bilinear
    }

    /// Bytes per row of [`ScreenSurface::pixels_mut`].
    pub fn pitch<D: Driver>(&self, ctx: &RenderContext<D>) -> Result<u32, Error> {
        ctx.texture_stride(self.texture)
    }

    pub fn pixels_mut<'a, D: Driver>(
        &self,
        ctx: &'a mut RenderContext<D>,
    ) -> Result<&'a mut [u8], Error> {
        ctx.texture_pixels_mut(self.texture)
    }

    /// Draws the surface into the display rectangle `(x, y, w, h)`.
    pub fn set_scaling<D: Driver>(
        &mut self,
        ctx: &mut RenderContext<D>,
        x: f32,
        y: f32,
        w: f32,
        h: f32,
    ) -> Result<(), Error> {
        let dst = Rect::new(x, y, w, h);
        let scale = dst.scale_from(Vec2::from_size(self.width, self.height));
        ctx.set_scale(self.texture, x, y, scale.x, scale.y)?;
        self.dst = dst;
        Ok(())
    }

    /// Lays the surface out on the display according to `mode`.
    pub fn fit<D: Driver>(&mut self, ctx: &mut RenderContext<D>, mode: ScalingMode) -> Result<(), Error> {
        let geometry = ctx.display_geometry();
        let display = Vec2::from_size(geometry.width, geometry.height);
        let content = Vec2::from_size(self.width, self.height);
        let dst = match mode {
            ScalingMode::Native => Rect::centered(content, display),
            ScalingMode::Fit => Rect::fit(content, display),
            ScalingMode::Stretch => Rect::new(0.0, 0.0, display.x, display.y),
        };
        log::debug!("screen surface {mode:?}: {dst:?}");
        self.set_scaling(ctx, dst.origin.x, dst.origin.y, dst.size.x, dst.size.y)
    }

    /// Switches between bilinear and nearest sampling in both directions.
    pub fn set_bilinear<D: Driver>(&mut self, ctx: &mut RenderContext<D>, enable: bool) -> Result<(), Error> {
        let filter = if enable {
            TextureFilter::Linear
        } else {
            TextureFilter::Point
        };
        ctx.set_texture_filter(self.texture, filter, filter)?;
        self.bilinear = enable;
        Ok(())
    }

    /// Draws the surface in its own scene and presents it.
    pub fn flip<D: Driver>(&self, ctx: &mut RenderContext<D>) -> Result<(), Error> {
        ctx.begin_scene()?;
        ctx.draw_texture(self.texture)?;
        ctx.end_scene()?;
        ctx.present()
    }

    pub fn presented_extents<D: Driver>(&self, ctx: &RenderContext<D>) -> Result<PresentedExtents, Error> {
        ctx.presented_extents(self.texture)
    }

    /// Waits for rendering to finish, then releases the texture.
    pub fn destroy<D: Driver>(self, ctx: &mut RenderContext<D>) -> Result<(), Error> {
        ctx.wait_rendering_done();
        ctx.destroy_texture(self.texture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RenderInit;
    use crate::driver::headless::{HeadlessConfig, HeadlessDriver};

    fn context() -> RenderContext<HeadlessDriver> {
        RenderContext::new(HeadlessDriver::new(HeadlessConfig::for_tests()), RenderInit::default())
            .unwrap()
    }

    #[test]
    fn depth_selects_the_texture_format() {
        assert_eq!(format_for_depth(16).unwrap(), TextureFormat::R5G6B5);
        assert_eq!(format_for_depth(24).unwrap(), TextureFormat::Rgb888);
        assert_eq!(format_for_depth(32).unwrap(), TextureFormat::A8B8G8R8);
        assert!(matches!(
            format_for_depth(8),
            Err(Error::UnsupportedSurfaceFormat(8))
        ));
    }

    #[test]
    fn unsupported_depth_allocates_nothing() {
        let mut ctx = context();
        let before = ctx.alloc_stats();
        assert!(ScreenSurface::create(&mut ctx, 320, 240, 15).is_err());
        assert_eq!(ctx.alloc_stats(), before);
        ctx.finish();
    }

    #[test]
    fn pitch_is_padded_to_eight_pixels() {
        let mut ctx = context();
        let surface = ScreenSurface::create(&mut ctx, 250, 100, 24).unwrap();
        assert_eq!(surface.pitch(&ctx).unwrap(), 256 * 3);
        assert_eq!(surface.pixels_mut(&mut ctx).unwrap().len(), 256 * 3 * 100);
        surface.destroy(&mut ctx).unwrap();
        ctx.finish();
    }

    #[test]
    fn scaling_modes_place_the_surface() {
        let mut ctx = context();
        let mut surface = ScreenSurface::create(&mut ctx, 320, 240, 16).unwrap();
        assert_eq!(surface.destination(), Rect::from_size(320, 240));

        surface.fit(&mut ctx, ScalingMode::Native).unwrap();
        assert_eq!(surface.destination(), Rect::new(320.0, 152.0, 320.0, 240.0));

        surface.fit(&mut ctx, ScalingMode::Stretch).unwrap();
        let extents = surface.presented_extents(&ctx).unwrap();
        assert_eq!(extents.scaled.origin, Vec2::zero());
        assert!((extents.scaled.size.x - 960.0).abs() < 1e-3);
        assert!((extents.scaled.size.y - 544.0).abs() < 1e-3);
        assert_eq!(extents.logical, Rect::from_size(320, 240));

        surface.fit(&mut ctx, ScalingMode::Fit).unwrap();
        let dst = surface.destination();
        assert!((dst.size.y - 544.0).abs() < 1e-3);
        assert!((dst.origin.x * 2.0 + dst.size.x - 960.0).abs() < 1e-3);

        surface.destroy(&mut ctx).unwrap();
        ctx.finish();
    }

    #[test]
    fn flips_present_the_surface() {
        let mut ctx = context();
        let mut surface = ScreenSurface::create(&mut ctx, 32, 16, 32).unwrap();
        surface.set_bilinear(&mut ctx, true).unwrap();
        assert!(surface.is_bilinear());
        assert_eq!(
            ctx.texture(surface.texture()).unwrap().desc().mag_filter,
            TextureFilter::Linear
        );

        for frame in 0..3 {
            surface.pixels_mut(&mut ctx).unwrap().fill(frame);
            surface.flip(&mut ctx).unwrap();
        }
        assert_eq!(ctx.present_count(), 3);
        assert!(!ctx.is_drawing());

        surface.destroy(&mut ctx).unwrap();
        assert_eq!(ctx.texture_count(), 0);
        let driver = ctx.finish();
        assert_eq!(driver.live_objects(), 0);
    }
}
