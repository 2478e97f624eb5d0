//! Shader programs.
//!
//! This module is responsible for:
//! - validating compiled GXP programs and reading their parameter tables
//! - owning the shader patcher and the memory it links programs into
//! - registering and linking the fixed textured-quad program pair

mod gxp;
mod patcher;
mod pipeline;

pub use gxp::{GxpError, ParameterCategory, Program, ProgramParameter, ProgramType};
pub use patcher::{PatcherSizes, ShaderPatcher};
pub use pipeline::{
    PipelineError, ShaderPipeline, TEXTURE_FRAGMENT_GXP, TEXTURE_VERTEX_GXP, VERTEX_STRIDE,
};
