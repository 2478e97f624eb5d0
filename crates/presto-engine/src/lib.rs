//! Presto engine crate.
//!
//! Presents frames on a tile-based GPU with a hardware display queue: GPU
//! memory, textures, the textured-quad shader pipeline, the swap chain and
//! the main screen surface built on top of them.
//!
//! The GPU is reached through [`driver::Driver`];
//! [`driver::headless::HeadlessDriver`] runs everything on the host.

pub mod context;
pub mod coords;
pub mod driver;
pub mod logging;
pub mod memory;
pub mod render;
pub mod shader;
pub mod surface;
pub mod texture;

pub use context::{Error, RenderContext, RenderInit, TextureId};
pub use surface::{ScalingMode, ScreenSurface};
pub use texture::TextureFormat;
