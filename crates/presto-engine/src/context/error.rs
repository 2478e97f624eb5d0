use std::fmt;

use crate::driver::DriverError;
use crate::texture::TextureError;

/// Initialization step that failed and left rendering unavailable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitStage {
    Initialize,
    RingBuffers,
    Context,
    RenderTarget,
    DisplayBuffers,
    DepthStencil,
    ShaderPatcher,
    ShaderPipeline,
    QuadBuffers,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InitStage::Initialize => "driver initialization",
            InitStage::RingBuffers => "ring buffer allocation",
            InitStage::Context => "context creation",
            InitStage::RenderTarget => "render target creation",
            InitStage::DisplayBuffers => "display buffer setup",
            InitStage::DepthStencil => "depth/stencil setup",
            InitStage::ShaderPatcher => "shader patcher creation",
            InitStage::ShaderPipeline => "shader pipeline linking",
            InitStage::QuadBuffers => "quad buffer allocation",
        })
    }
}

/// Errors reported by the render context and the screen surface.
///
/// `Unavailable` is the only fatal variant: nothing is left allocated when it
/// is returned. Everything else leaves the context usable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("rendering unavailable: {stage} failed")]
    Unavailable {
        stage: InitStage,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error(transparent)]
    Texture(#[from] TextureError),
    #[error("unsupported surface depth: {0} bits per pixel")]
    UnsupportedSurfaceFormat(u8),
    #[error("unknown texture")]
    UnknownTexture,
    #[error("no scene in progress")]
    SceneNotActive,
    #[error("a scene is in progress")]
    SceneInProgress,
    #[error("texture is not a render target")]
    NotRenderTarget,
    #[error("{op} failed")]
    Driver {
        op: &'static str,
        #[source]
        source: DriverError,
    },
}

impl Error {
    pub(crate) fn unavailable<E>(stage: InitStage) -> impl FnOnce(E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        move |source| Error::Unavailable {
            stage,
            source: Box::new(source),
        }
    }

    pub(crate) fn driver(op: &'static str) -> impl FnOnce(DriverError) -> Self {
        move |source| Error::Driver { op, source }
    }
}
