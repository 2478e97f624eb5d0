use core::ops::{Add, Mul, Sub};

/// 2D vector in surface or display pixels.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    #[inline]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    #[inline]
    pub const fn zero() -> Self {
        Self { x: 0.0, y: 0.0 }
    }

    /// Size of a `width` x `height` pixel grid.
    #[inline]
    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(width as f32, height as f32)
    }

    /// Component-wise product.
    #[inline]
    pub fn scale(self, by: Vec2) -> Vec2 {
        Vec2::new(self.x * by.x, self.y * by.y)
    }

    /// Both components clamped to `[0, 1]`.
    #[inline]
    pub fn clamp01(self) -> Vec2 {
        Vec2::new(self.x.clamp(0.0, 1.0), self.y.clamp(0.0, 1.0))
    }
}

impl Add for Vec2 {
    type Output = Vec2;
    #[inline]
    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Vec2;
    #[inline]
    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Vec2;
    #[inline]
    fn mul(self, rhs: f32) -> Vec2 {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}
