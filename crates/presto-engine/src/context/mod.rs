//! Render context and swap chain.
//!
//! This module is responsible for:
//! - bringing the driver up and tearing it down in dependency order
//! - the display buffers, their sync objects and the present queue
//! - the scene protocol and the texture set scenes draw from

mod error;
mod extents;
mod init;
mod render_context;
mod rings;
mod swapchain;

pub use error::{Error, InitStage};
pub use extents::PresentedExtents;
pub use init::{DisplayGeometry, RenderInit, RingBufferSizes};
pub use render_context::{RenderContext, SceneTarget, TextureId};
pub use swapchain::DISPLAY_BUFFER_COUNT;
