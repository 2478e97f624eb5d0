//! GPU-resident textures.
//!
//! This module is responsible for:
//! - classifying pixel formats (bytes per pixel, palette use, stride)
//! - allocating pixel, palette and render-target storage for a texture
//! - releasing every attachment of a texture in dependency order

mod format;
mod resource;

pub use format::{BaseFormat, TextureFormat, padded_width};
pub use resource::{
    COLOR_SURFACE_ALIGNMENT, DEPTHSTENCIL_SURFACE_ALIGNMENT, MAX_TEXTURE_DIMENSION,
    PALETTE_ALIGNMENT, PALETTE_ENTRIES, Placement, RenderTargetData, TEXTURE_ALIGNMENT, TILE_SIZE,
    Texture, TextureError, TextureStep,
};
