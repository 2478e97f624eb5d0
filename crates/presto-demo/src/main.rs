use anyhow::{Context, Result};
use presto_engine::driver::headless::{HeadlessConfig, HeadlessDriver};
use presto_engine::logging::{LoggingConfig, init_logging};
use presto_engine::{RenderContext, RenderInit, ScalingMode, ScreenSurface};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;
const FRAMES: u32 = 120;

fn main() -> Result<()> {
    init_logging(LoggingConfig::default());

    let driver = HeadlessDriver::new(HeadlessConfig::default());
    let mut ctx =
        RenderContext::new(driver, RenderInit::default()).context("failed to bring up rendering")?;

    let mut surface =
        ScreenSurface::create(&mut ctx, WIDTH, HEIGHT, 16).context("failed to create screen surface")?;
    surface.fit(&mut ctx, ScalingMode::Fit)?;
    surface.set_bilinear(&mut ctx, true)?;

    for frame in 0..FRAMES {
        let pitch = surface.pitch(&ctx)? as usize;
        let pixels = surface.pixels_mut(&mut ctx)?;
        paint_frame(pixels, pitch, frame);
        surface
            .flip(&mut ctx)
            .with_context(|| format!("flip {frame} failed"))?;
    }

    let extents = surface.presented_extents(&ctx)?;
    log::info!(
        "presented {} frames; surface shown at {:?}",
        ctx.present_count(),
        extents.scaled
    );

    surface.destroy(&mut ctx)?;
    let driver = ctx.finish();
    log::info!(
        "headless stats: {} scenes, {} draws, {} pixels filled, {} live objects",
        driver.scenes_completed(),
        driver.draw_count(),
        driver.pixels_filled(),
        driver.live_objects()
    );
    Ok(())
}

/// Scrolling RGB565 gradient. Rows are `pitch` bytes apart.
fn paint_frame(pixels: &mut [u8], pitch: usize, frame: u32) {
    for (y, row) in pixels.chunks_exact_mut(pitch).enumerate() {
        for (x, px) in row[..WIDTH as usize * 2].chunks_exact_mut(2).enumerate() {
            let r = ((x as u32 + frame) * 31 / WIDTH) as u16 & 31;
            let g = (y as u32 * 63 / HEIGHT) as u16 & 63;
            let b = (frame % 32) as u16;
            px.copy_from_slice(&((r << 11) | (g << 5) | b).to_le_bytes());
        }
    }
}
