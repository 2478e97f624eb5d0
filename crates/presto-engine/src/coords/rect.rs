use super::Vec2;

/// Axis-aligned rectangle, top-left origin.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct Rect {
    pub origin: Vec2,
    pub size: Vec2,
}

impl Rect {
    #[inline]
    pub const fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self {
            origin: Vec2::new(x, y),
            size: Vec2::new(w, h),
        }
    }

    /// A `width` x `height` rectangle at the origin.
    #[inline]
    pub fn from_size(width: u32, height: u32) -> Self {
        Self {
            origin: Vec2::zero(),
            size: Vec2::from_size(width, height),
        }
    }

    #[inline]
    pub fn max(self) -> Vec2 {
        self.origin + self.size
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.size.x <= 0.0 || self.size.y <= 0.0
    }

    /// `content` at its own size, centered in `bounds`.
    pub fn centered(content: Vec2, bounds: Vec2) -> Self {
        Self {
            origin: (bounds - content) * 0.5,
            size: content,
        }
    }

    /// `content` scaled uniformly to the largest size that fits `bounds`,
    /// centered on the other axis.
    pub fn fit(content: Vec2, bounds: Vec2) -> Self {
        if content.x <= 0.0 || content.y <= 0.0 {
            return Self::centered(Vec2::zero(), bounds);
        }
        let scale = (bounds.x / content.x).min(bounds.y / content.y);
        Self::centered(content * scale, bounds)
    }

    /// Scale factors that map `content` onto this rectangle's size.
    #[inline]
    pub fn scale_from(self, content: Vec2) -> Vec2 {
        Vec2::new(self.size.x / content.x, self.size.y / content.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_letterboxes_wide_bounds() {
        let r = Rect::fit(Vec2::new(320.0, 240.0), Vec2::new(960.0, 544.0));
        let close = |a: f32, b: f32| (a - b).abs() < 1e-3;

        assert!(close(r.size.y, 544.0));
        assert!(close(r.size.x, 320.0 * 544.0 / 240.0));
        assert!(close(r.origin.y, 0.0));
        assert!(close(r.origin.x, (960.0 - r.size.x) / 2.0));
    }

    #[test]
    fn centered_keeps_size() {
        let r = Rect::centered(Vec2::new(100.0, 50.0), Vec2::new(300.0, 150.0));
        assert_eq!(r, Rect::new(100.0, 50.0, 100.0, 50.0));
        assert_eq!(r.max(), Vec2::new(200.0, 100.0));
    }

    #[test]
    fn scale_from_content() {
        let r = Rect::new(0.0, 0.0, 640.0, 120.0);
        assert_eq!(r.scale_from(Vec2::new(320.0, 240.0)), Vec2::new(2.0, 0.5));
        assert!(Rect::from_size(0, 4).is_empty());
    }
}
