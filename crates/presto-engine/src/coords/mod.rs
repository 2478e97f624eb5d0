//! Geometry shared by the presentation path.
//!
//! Pixel space: origin top-left, +X right, +Y down.

mod rect;
mod vec2;

pub use rect::Rect;
pub use vec2::Vec2;
