//! Immediate textured-quad rendering.
//!
//! Convention:
//! - geometry is in surface pixels (top-left origin, +Y down)
//! - the `wvp` uniform carries an orthographic projection of the surface
//! - one draw call per quad, no batching

mod ortho;
mod quad;

pub use ortho::{orthographic, pixel_projection};
pub use quad::{QUAD_INDEX_COUNT, QuadRect, QuadRenderer, QuadVertex};
