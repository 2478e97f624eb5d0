//! Software execution of textured draws.
//!
//! Positions are transformed by the column-major `wvp` matrix, mapped to the
//! color surface with y pointing down, and filled with affine texture
//! coordinates sampled from the bound texture.

use crate::driver::{Primitive, TextureFilter};
use crate::texture::TextureFormat;

/// A vertex after projection to surface pixels.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(super) struct ScreenVertex {
    pub x: f32,
    pub y: f32,
    pub u: f32,
    pub v: f32,
}

pub(super) fn transform(wvp: &[f32; 16], p: [f32; 3]) -> [f32; 4] {
    let v = [p[0], p[1], p[2], 1.0];
    let mut out = [0.0; 4];
    for (row, o) in out.iter_mut().enumerate() {
        *o = (0..4).map(|col| wvp[col * 4 + row] * v[col]).sum();
    }
    out
}

/// Clip space to pixel coordinates on a `width` x `height` surface.
pub(super) fn to_screen(clip: [f32; 4], width: u32, height: u32) -> (f32, f32) {
    let w = if clip[3] == 0.0 { 1.0 } else { clip[3] };
    let (nx, ny) = (clip[0] / w, clip[1] / w);
    (
        (nx + 1.0) * 0.5 * width as f32,
        (1.0 - ny) * 0.5 * height as f32,
    )
}

/// Splits an index list into triangles.
pub(super) fn assemble(primitive: Primitive, indices: &[u32]) -> Vec<[u32; 3]> {
    match primitive {
        Primitive::Triangles => indices
            .chunks_exact(3)
            .map(|t| [t[0], t[1], t[2]])
            .collect(),
        Primitive::TriangleStrip => indices
            .windows(3)
            .map(|t| [t[0], t[1], t[2]])
            .collect(),
        Primitive::TriangleFan => match indices.split_first() {
            Some((&first, rest)) => rest.windows(2).map(|t| [first, t[0], t[1]]).collect(),
            None => Vec::new(),
        },
    }
}

/// Read access to a linear texture.
pub(super) struct Sampler<'a> {
    pub texels: &'a [u8],
    pub palette: Option<&'a [u8]>,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes.
    pub stride: usize,
}

impl Sampler<'_> {
    /// Decodes one texel to R, G, B, A.
    pub fn texel(&self, x: u32, y: u32) -> [u8; 4] {
        let bpp = self.format.bytes_per_pixel() as usize;
        let at = y as usize * self.stride + x as usize * bpp;
        let Some(px) = self.texels.get(at..at + bpp) else {
            return [0, 0, 0, 0];
        };
        let half = || u16::from_le_bytes([px[0], px[1]]);

        match self.format {
            TextureFormat::L8 => [px[0], px[0], px[0], 0xFF],
            TextureFormat::P8Abgr => {
                let entry = px[0] as usize * 4;
                match self.palette.and_then(|p| p.get(entry..entry + 4)) {
                    Some(c) => [c[0], c[1], c[2], c[3]],
                    None => [0, 0, 0, 0],
                }
            }
            TextureFormat::A4R4G4B4 => {
                let v = half();
                let n = |shift: u16| ((v >> shift) & 0xF) as u8 * 17;
                [n(8), n(4), n(0), n(12)]
            }
            TextureFormat::A1R5G5B5 => {
                let v = half();
                let a = if v & 0x8000 != 0 { 0xFF } else { 0 };
                [
                    expand5((v >> 10) & 31),
                    expand5((v >> 5) & 31),
                    expand5(v & 31),
                    a,
                ]
            }
            TextureFormat::R5G6B5 => {
                let v = half();
                [
                    expand5((v >> 11) & 31),
                    expand6((v >> 5) & 63),
                    expand5(v & 31),
                    0xFF,
                ]
            }
            TextureFormat::L8A8 => [px[1], px[1], px[1], px[0]],
            TextureFormat::Rgb888 => [px[2], px[1], px[0], 0xFF],
            TextureFormat::A8B8G8R8 => [px[0], px[1], px[2], px[3]],
            TextureFormat::A8R8G8B8 => [px[2], px[1], px[0], px[3]],
            TextureFormat::R32F => {
                let v = f32::from_le_bytes([px[0], px[1], px[2], px[3]]);
                [(v.clamp(0.0, 1.0) * 255.0).round() as u8, 0, 0, 0xFF]
            }
        }
    }

    pub fn sample(&self, u: f32, v: f32, filter: TextureFilter) -> [u8; 4] {
        let (w, h) = (self.width as f32, self.height as f32);
        let clamp_x = |x: f32| x.clamp(0.0, w - 1.0) as u32;
        let clamp_y = |y: f32| y.clamp(0.0, h - 1.0) as u32;

        match filter {
            TextureFilter::Point => self.texel(clamp_x((u * w).floor()), clamp_y((v * h).floor())),
            TextureFilter::Linear => {
                let x = u * w - 0.5;
                let y = v * h - 0.5;
                let (x0, y0) = (x.floor(), y.floor());
                let (fx, fy) = (x - x0, y - y0);

                let c00 = self.texel(clamp_x(x0), clamp_y(y0));
                let c10 = self.texel(clamp_x(x0 + 1.0), clamp_y(y0));
                let c01 = self.texel(clamp_x(x0), clamp_y(y0 + 1.0));
                let c11 = self.texel(clamp_x(x0 + 1.0), clamp_y(y0 + 1.0));

                let mut out = [0u8; 4];
                for (i, o) in out.iter_mut().enumerate() {
                    let top = lerp(c00[i] as f32, c10[i] as f32, fx);
                    let bottom = lerp(c01[i] as f32, c11[i] as f32, fx);
                    *o = lerp(top, bottom, fy).round() as u8;
                }
                out
            }
        }
    }
}

/// Write access to an A8B8G8R8 linear color surface.
pub(super) struct Target<'a> {
    pub pixels: &'a mut [u8],
    pub width: u32,
    pub height: u32,
    /// Row pitch in pixels.
    pub stride: u32,
}

impl Target<'_> {
    fn put(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let at = (y as usize * self.stride as usize + x as usize) * 4;
        if let Some(px) = self.pixels.get_mut(at..at + 4) {
            px.copy_from_slice(&rgba);
        }
    }
}

/// Fills the pixels whose centers lie inside `tri`; returns how many.
pub(super) fn fill_triangle(
    target: &mut Target<'_>,
    tri: [ScreenVertex; 3],
    sampler: &Sampler<'_>,
    min_filter: TextureFilter,
    mag_filter: TextureFilter,
) -> u64 {
    let [a, b, c] = tri;
    let area = edge(a.x, a.y, b.x, b.y, c.x, c.y);
    if area == 0.0 {
        return 0;
    }

    // Minifying when one screen pixel covers more than one texel.
    let uv_area = edge(a.u, a.v, b.u, b.v, c.u, c.v).abs() * sampler.width as f32 * sampler.height as f32;
    let filter = if uv_area > area.abs() { min_filter } else { mag_filter };

    let min_x = a.x.min(b.x).min(c.x).floor().max(0.0) as u32;
    let min_y = a.y.min(b.y).min(c.y).floor().max(0.0) as u32;
    let max_x = (a.x.max(b.x).max(c.x).ceil().max(0.0) as u32).min(target.width);
    let max_y = (a.y.max(b.y).max(c.y).ceil().max(0.0) as u32).min(target.height);

    let mut filled = 0;
    for y in min_y..max_y {
        for x in min_x..max_x {
            let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
            let w0 = edge(b.x, b.y, c.x, c.y, px, py) / area;
            let w1 = edge(c.x, c.y, a.x, a.y, px, py) / area;
            let w2 = edge(a.x, a.y, b.x, b.y, px, py) / area;
            if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                continue;
            }

            let u = w0 * a.u + w1 * b.u + w2 * c.u;
            let v = w0 * a.v + w1 * b.v + w2 * c.v;
            target.put(x, y, sampler.sample(u, v, filter));
            filled += 1;
        }
    }
    filled
}

#[inline]
fn edge(ax: f32, ay: f32, bx: f32, by: f32, px: f32, py: f32) -> f32 {
    (bx - ax) * (py - ay) - (by - ay) * (px - ax)
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[inline]
fn expand5(v: u16) -> u8 {
    ((v << 3) | (v >> 2)) as u8
}

#[inline]
fn expand6(v: u16) -> u8 {
    ((v << 2) | (v >> 4)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler(texels: &[u8], format: TextureFormat, width: u32, height: u32) -> Sampler<'_> {
        Sampler {
            texels,
            palette: None,
            format,
            width,
            height,
            stride: format.stride(width) as usize,
        }
    }

    #[test]
    fn strip_and_fan_assembly() {
        assert_eq!(
            assemble(Primitive::TriangleStrip, &[0, 1, 2, 3]),
            vec![[0, 1, 2], [1, 2, 3]]
        );
        assert_eq!(
            assemble(Primitive::TriangleFan, &[0, 1, 2, 3]),
            vec![[0, 1, 2], [0, 2, 3]]
        );
        assert_eq!(assemble(Primitive::Triangles, &[0, 1, 2, 3]), vec![[0, 1, 2]]);
        assert!(assemble(Primitive::TriangleFan, &[]).is_empty());
    }

    #[test]
    fn decodes_packed_16_bit_formats() {
        // Pure red, then pure green in R5G6B5.
        let texels = [0x00, 0xF8, 0xE0, 0x07, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let s = sampler(&texels, TextureFormat::R5G6B5, 2, 1);
        assert_eq!(s.texel(0, 0), [255, 0, 0, 255]);
        assert_eq!(s.texel(1, 0), [0, 255, 0, 255]);

        let argb = 0xF00Fu16.to_le_bytes();
        let mut texels = [0u8; 16];
        texels[..2].copy_from_slice(&argb);
        let s = sampler(&texels, TextureFormat::A4R4G4B4, 1, 1);
        assert_eq!(s.texel(0, 0), [0, 0, 255, 255]);
    }

    #[test]
    fn paletted_texels_go_through_the_palette() {
        let mut palette = [0u8; 1024];
        palette[8..12].copy_from_slice(&0xFF10_2030u32.to_le_bytes());
        let texels = [2u8, 0, 0, 0, 0, 0, 0, 0];
        let s = Sampler {
            palette: Some(&palette),
            ..sampler(&texels, TextureFormat::P8Abgr, 1, 1)
        };
        assert_eq!(s.texel(0, 0), [0x30, 0x20, 0x10, 0xFF]);
    }

    #[test]
    fn bilinear_blends_neighbours() {
        // Black and white L8 texels side by side.
        let texels = [0u8, 255, 0, 0, 0, 0, 0, 0];
        let s = sampler(&texels, TextureFormat::L8, 2, 1);
        assert_eq!(s.sample(0.25, 0.5, TextureFilter::Point), [0, 0, 0, 255]);
        assert_eq!(s.sample(0.5, 0.5, TextureFilter::Linear)[0], 128);
    }

    #[test]
    fn fills_a_full_surface_quad() {
        let texels = [0xAAu8; 8];
        let s = sampler(&texels, TextureFormat::L8, 1, 1);
        let mut pixels = vec![0u8; 4 * 4 * 4];
        let mut target = Target {
            pixels: &mut pixels,
            width: 4,
            height: 4,
            stride: 4,
        };

        let v = |x: f32, y: f32, u: f32, v: f32| ScreenVertex { x, y, u, v };
        let quad = [v(0.0, 0.0, 0.0, 0.0), v(4.0, 0.0, 1.0, 0.0), v(0.0, 4.0, 0.0, 1.0), v(4.0, 4.0, 1.0, 1.0)];

        let mut filled = 0;
        for [i, j, k] in assemble(Primitive::TriangleStrip, &[0, 1, 2, 3]) {
            let tri = [quad[i as usize], quad[j as usize], quad[k as usize]];
            filled += fill_triangle(&mut target, tri, &s, TextureFilter::Point, TextureFilter::Point);
        }

        assert!(filled >= 16);
        assert!(pixels.chunks_exact(4).all(|px| px == [0xAA, 0xAA, 0xAA, 0xFF]));
    }

    #[test]
    fn ortho_transform_maps_corners() {
        let m = crate::render::orthographic(0.0, 8.0, 4.0, 0.0, 0.0, 1.0);
        assert_eq!(to_screen(transform(&m, [0.0, 0.0, 0.5]), 8, 4), (0.0, 0.0));
        assert_eq!(to_screen(transform(&m, [8.0, 4.0, 0.5]), 8, 4), (8.0, 4.0));
    }
}
