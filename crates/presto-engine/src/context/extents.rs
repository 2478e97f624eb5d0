use crate::coords::{Rect, Vec2};

/// Where a texture of logical size `logical` ends up on a display of size
/// `display`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PresentedExtents {
    /// The texture at its own size, at the origin.
    pub logical: Rect,
    /// The area it covers on the display.
    pub scaled: Rect,
    pub display: Vec2,
}

impl PresentedExtents {
    /// Maps a normalized display position into logical texture coordinates.
    ///
    /// `normalized` is clamped to `[0, 1]` first. Positions in the letterbox
    /// map outside the logical rectangle.
    pub fn map_normalized(&self, normalized: Vec2) -> Vec2 {
        if self.scaled.is_empty() {
            return self.logical.origin;
        }
        let on_display = normalized.clamp01().scale(self.display);
        let relative = on_display - self.scaled.origin;
        Vec2::new(
            relative.x * self.logical.size.x / self.scaled.size.x,
            relative.y * self.logical.size.y / self.scaled.size.y,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letterboxed() -> PresentedExtents {
        PresentedExtents {
            logical: Rect::from_size(320, 240),
            scaled: Rect::new(117.0, 0.0, 725.0, 544.0),
            display: Vec2::new(960.0, 544.0),
        }
    }

    #[test]
    fn corners_of_the_scaled_area_map_to_logical_corners() {
        let extents = letterboxed();
        let close = |a: Vec2, b: Vec2| (a - b).x.abs() < 0.01 && (a - b).y.abs() < 0.01;

        let top_left = extents.map_normalized(Vec2::new(117.0 / 960.0, 0.0));
        assert!(close(top_left, Vec2::new(0.0, 0.0)), "{top_left:?}");

        let bottom_right = extents.map_normalized(Vec2::new(842.0 / 960.0, 1.0));
        assert!(close(bottom_right, Vec2::new(320.0, 240.0)), "{bottom_right:?}");
    }

    #[test]
    fn input_is_clamped_and_letterbox_maps_outside() {
        let extents = letterboxed();
        let left = extents.map_normalized(Vec2::new(-3.0, 0.5));
        assert!(left.x < 0.0);
        assert!((left.y - 120.0).abs() < 0.01);

        let same = extents.map_normalized(Vec2::new(0.0, 0.5));
        assert_eq!(left, same);
    }

    #[test]
    fn empty_scaled_area_maps_to_origin() {
        let extents = PresentedExtents {
            scaled: Rect::default(),
            ..letterboxed()
        };
        assert_eq!(extents.map_normalized(Vec2::new(0.5, 0.5)), Vec2::zero());
    }
}
