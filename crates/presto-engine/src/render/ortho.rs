/// Column-major orthographic projection.
///
/// With `bottom > top` the y axis points down, so `(left, top)` lands on the
/// top-left corner of clip space. Depth maps `near..far` onto `1..-1`.
pub fn orthographic(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> [f32; 16] {
    let mut m = [0.0; 16];

    m[0] = 2.0 / (right - left);
    m[12] = -(right + left) / (right - left);

    m[5] = 2.0 / (top - bottom);
    m[13] = -(top + bottom) / (top - bottom);

    m[10] = -2.0 / (far - near);
    m[14] = (far + near) / (far - near);

    m[15] = 1.0;
    m
}

/// Maps a `width` x `height` pixel space, origin top-left, to clip space.
#[inline]
pub fn pixel_projection(width: u32, height: u32) -> [f32; 16] {
    orthographic(0.0, width as f32, height as f32, 0.0, 0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_projection_entries() {
        let m = pixel_projection(960, 544);

        assert_eq!(m[0], 2.0 / 960.0);
        assert_eq!(m[5], -2.0 / 544.0);
        assert_eq!(m[10], -2.0);
        assert_eq!(m[12], -1.0);
        assert_eq!(m[13], 1.0);
        assert_eq!(m[14], 1.0);
        assert_eq!(m[15], 1.0);

        let off_diagonal = [1, 2, 3, 4, 6, 7, 8, 9, 11];
        assert!(off_diagonal.iter().all(|&i| m[i] == 0.0));
    }

    #[test]
    fn y_axis_is_flipped() {
        let m = pixel_projection(100, 50);
        let close = |a: f32, b: f32| (a - b).abs() < 1e-6;

        // Pixel row 0 is the top of clip space, row 50 the bottom.
        assert!(close(m[5] * 0.0 + m[13], 1.0));
        assert!(close(m[5] * 50.0 + m[13], -1.0));
        assert!(close(m[0] * 100.0 + m[12], 1.0));
    }
}
