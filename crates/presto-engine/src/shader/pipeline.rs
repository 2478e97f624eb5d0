use crate::driver::{
    AttributeFormat, BlendInfo, ContextHandle, Driver, DriverError, FragmentProgramHandle,
    IndexSource, MultisampleMode, OutputRegisterFormat, PatcherHandle, ProgramId,
    VertexAttribute, VertexProgramHandle, VertexStream,
};

use super::gxp::{GxpError, ParameterCategory, Program, ProgramParameter, ProgramType};
use super::patcher::ShaderPatcher;

/// Vertex stage of the textured-quad pipeline.
pub static TEXTURE_VERTEX_GXP: &[u8] = include_bytes!("programs/texture_v.gxp");
/// Fragment stage of the textured-quad pipeline.
pub static TEXTURE_FRAGMENT_GXP: &[u8] = include_bytes!("programs/texture_f.gxp");

/// Interleaved position (3 x f32) and texture coordinate (2 x f32).
pub const VERTEX_STRIDE: u16 = 20;
const TEXCOORD_OFFSET: u16 = 12;

const POSITION_ATTRIBUTE: &str = "aPosition";
const TEXCOORD_ATTRIBUTE: &str = "aTexcoord";
const WVP_UNIFORM: &str = "wvp";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid {stage:?} program")]
    InvalidProgram {
        stage: ProgramType,
        #[source]
        source: GxpError,
    },
    #[error("expected a {expected:?} program, found a {found:?} program")]
    WrongStage {
        expected: ProgramType,
        found: ProgramType,
    },
    #[error("vertex program has no {category:?} parameter `{name}`")]
    MissingParameter {
        name: &'static str,
        category: ParameterCategory,
    },
    #[error("{step} failed")]
    Driver {
        step: &'static str,
        #[source]
        source: DriverError,
    },
}

/// The linked vertex/fragment program pair every quad is drawn with.
#[derive(Debug)]
pub struct ShaderPipeline {
    vertex_id: ProgramId,
    fragment_id: ProgramId,
    vertex_program: VertexProgramHandle,
    fragment_program: FragmentProgramHandle,
    wvp: ProgramParameter<'static>,
}

/// Steps completed so far, undone in reverse on failure.
#[derive(Default)]
struct Linking {
    vertex_id: Option<ProgramId>,
    fragment_id: Option<ProgramId>,
    vertex_program: Option<VertexProgramHandle>,
}

impl Linking {
    fn unwind<D: Driver>(self, driver: &mut D, patcher: PatcherHandle) {
        if let Some(program) = self.vertex_program {
            if let Err(err) = driver.release_vertex_program(patcher, program) {
                log::warn!("failed to release vertex program while unwinding: {err}");
            }
        }
        if let Some(id) = self.fragment_id {
            if let Err(err) = driver.unregister_program(patcher, id) {
                log::warn!("failed to unregister fragment program while unwinding: {err}");
            }
        }
        if let Some(id) = self.vertex_id {
            if let Err(err) = driver.unregister_program(patcher, id) {
                log::warn!("failed to unregister vertex program while unwinding: {err}");
            }
        }
    }
}

impl ShaderPipeline {
    /// Registers and links the bundled textured-quad programs.
    pub fn register_and_link<D: Driver>(
        driver: &mut D,
        patcher: &ShaderPatcher,
    ) -> Result<Self, PipelineError> {
        Self::register_and_link_programs(driver, patcher, TEXTURE_VERTEX_GXP, TEXTURE_FRAGMENT_GXP)
    }

    pub fn register_and_link_programs<D: Driver>(
        driver: &mut D,
        patcher: &ShaderPatcher,
        vertex_gxp: &'static [u8],
        fragment_gxp: &'static [u8],
    ) -> Result<Self, PipelineError> {
        let vertex = check(vertex_gxp, ProgramType::Vertex)?;
        let fragment = check(fragment_gxp, ProgramType::Fragment)?;

        let position = find(&vertex, POSITION_ATTRIBUTE, ParameterCategory::Attribute)?;
        let texcoord = find(&vertex, TEXCOORD_ATTRIBUTE, ParameterCategory::Attribute)?;
        let wvp = find(&vertex, WVP_UNIFORM, ParameterCategory::Uniform)?;

        let handle = patcher.handle();
        let mut linking = Linking::default();

        let result = (|| -> Result<Self, PipelineError> {
            let vertex_id = driver
                .register_program(handle, &vertex)
                .map_err(driver_step("register vertex program"))?;
            linking.vertex_id = Some(vertex_id);

            let fragment_id = driver
                .register_program(handle, &fragment)
                .map_err(driver_step("register fragment program"))?;
            linking.fragment_id = Some(fragment_id);

            let attributes = [
                VertexAttribute {
                    stream_index: 0,
                    offset: 0,
                    format: AttributeFormat::F32,
                    component_count: 3,
                    reg_index: position.resource_index,
                },
                VertexAttribute {
                    stream_index: 0,
                    offset: TEXCOORD_OFFSET,
                    format: AttributeFormat::F32,
                    component_count: 2,
                    reg_index: texcoord.resource_index,
                },
            ];
            let streams = [VertexStream {
                stride: VERTEX_STRIDE,
                index_source: IndexSource::Index16Bit,
            }];

            let vertex_program = driver
                .create_vertex_program(handle, vertex_id, &attributes, &streams)
                .map_err(driver_step("create vertex program"))?;
            linking.vertex_program = Some(vertex_program);

            let fragment_program = driver
                .create_fragment_program(
                    handle,
                    fragment_id,
                    OutputRegisterFormat::Uchar4,
                    MultisampleMode::None,
                    Some(&BlendInfo::DISABLED),
                    vertex_id,
                )
                .map_err(driver_step("create fragment program"))?;

            Ok(Self {
                vertex_id,
                fragment_id,
                vertex_program,
                fragment_program,
                wvp,
            })
        })();

        match result {
            Ok(pipeline) => {
                log::debug!(
                    "texture pipeline linked (position reg {}, texcoord reg {})",
                    position.resource_index,
                    texcoord.resource_index
                );
                Ok(pipeline)
            }
            Err(err) => {
                linking.unwind(driver, handle);
                Err(err)
            }
        }
    }

    /// Makes this pipeline current on `ctx`.
    pub fn bind<D: Driver>(&self, driver: &mut D, ctx: ContextHandle) {
        driver.set_vertex_program(ctx, self.vertex_program);
        driver.set_fragment_program(ctx, self.fragment_program);
    }

    /// The world-view-projection uniform.
    #[inline]
    pub fn wvp(&self) -> &ProgramParameter<'static> {
        &self.wvp
    }

    /// Releases both linked programs.
    ///
    /// The programs stay registered until [`ShaderPipeline::unregister`].
    pub fn release_programs<D: Driver>(&self, driver: &mut D, patcher: &ShaderPatcher) {
        let handle = patcher.handle();
        if let Err(err) = driver.release_vertex_program(handle, self.vertex_program) {
            log::warn!("failed to release vertex program: {err}");
        }
        if let Err(err) = driver.release_fragment_program(handle, self.fragment_program) {
            log::warn!("failed to release fragment program: {err}");
        }
    }

    /// Unregisters the fragment program, then the vertex program.
    pub fn unregister<D: Driver>(self, driver: &mut D, patcher: &ShaderPatcher) {
        let handle = patcher.handle();
        if let Err(err) = driver.unregister_program(handle, self.fragment_id) {
            log::warn!("failed to unregister fragment program: {err}");
        }
        if let Err(err) = driver.unregister_program(handle, self.vertex_id) {
            log::warn!("failed to unregister vertex program: {err}");
        }
    }

    /// Releases and unregisters everything in one go.
    pub fn release<D: Driver>(self, driver: &mut D, patcher: &ShaderPatcher) {
        self.release_programs(driver, patcher);
        self.unregister(driver, patcher);
    }
}

fn check(bytes: &'static [u8], expected: ProgramType) -> Result<Program<'static>, PipelineError> {
    let program = Program::parse(bytes).map_err(|source| PipelineError::InvalidProgram {
        stage: expected,
        source,
    })?;
    if program.program_type() != expected {
        return Err(PipelineError::WrongStage {
            expected,
            found: program.program_type(),
        });
    }
    Ok(program)
}

fn find(
    program: &Program<'static>,
    name: &'static str,
    category: ParameterCategory,
) -> Result<ProgramParameter<'static>, PipelineError> {
    program
        .find_parameter(name)
        .filter(|p| p.category == category)
        .copied()
        .ok_or(PipelineError::MissingParameter { name, category })
}

fn driver_step(step: &'static str) -> impl FnOnce(DriverError) -> PipelineError {
    move |source| PipelineError::Driver { step, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::headless::{HeadlessConfig, HeadlessDriver};
    use crate::memory::GpuMemory;
    use crate::shader::PatcherSizes;

    fn setup() -> (HeadlessDriver, GpuMemory, ShaderPatcher) {
        let mut driver = HeadlessDriver::new(HeadlessConfig::for_tests());
        let mut memory = GpuMemory::new();
        let patcher =
            ShaderPatcher::create(&mut driver, &mut memory, &PatcherSizes::default()).unwrap();
        (driver, memory, patcher)
    }

    #[test]
    fn links_bundled_programs() {
        let (mut driver, mut memory, patcher) = setup();

        let pipeline = ShaderPipeline::register_and_link(&mut driver, &patcher).unwrap();
        assert_eq!(pipeline.wvp().name, "wvp");
        assert_eq!(driver.live_programs(), 2);

        pipeline.release(&mut driver, &patcher);
        assert_eq!(driver.live_programs(), 0);
        patcher.destroy(&mut driver, &mut memory);
        assert_eq!(driver.live_mem_blocks(), 0);
    }

    #[test]
    fn unwinding_undoes_partial_links_and_tolerates_stale_handles() {
        let (mut driver, mut memory, patcher) = setup();
        let handle = patcher.handle();

        let pipeline = ShaderPipeline::register_and_link(&mut driver, &patcher).unwrap();
        driver
            .release_fragment_program(handle, pipeline.fragment_program)
            .unwrap();
        let partial = || Linking {
            vertex_id: Some(pipeline.vertex_id),
            fragment_id: Some(pipeline.fragment_id),
            vertex_program: Some(pipeline.vertex_program),
        };

        partial().unwind(&mut driver, handle);
        assert_eq!(driver.live_linked_programs(), 0);
        assert_eq!(driver.live_programs(), 0);

        // Every step now fails; each is logged and skipped.
        partial().unwind(&mut driver, handle);
        assert_eq!(driver.live_programs(), 0);

        patcher.destroy(&mut driver, &mut memory);
        assert_eq!(driver.live_mem_blocks(), 0);
    }

    #[test]
    fn swapped_stages_are_rejected() {
        let (mut driver, mut memory, patcher) = setup();

        let err = ShaderPipeline::register_and_link_programs(
            &mut driver,
            &patcher,
            TEXTURE_FRAGMENT_GXP,
            TEXTURE_VERTEX_GXP,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::WrongStage {
                expected: ProgramType::Vertex,
                found: ProgramType::Fragment
            }
        ));
        assert_eq!(driver.live_programs(), 0);

        patcher.destroy(&mut driver, &mut memory);
    }

    #[test]
    fn corrupt_program_is_reported_with_its_stage() {
        let (mut driver, mut memory, patcher) = setup();

        let corrupt: &'static [u8] = Box::leak(vec![0u8; 64].into_boxed_slice());
        let err = ShaderPipeline::register_and_link_programs(
            &mut driver,
            &patcher,
            TEXTURE_VERTEX_GXP,
            corrupt,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidProgram {
                stage: ProgramType::Fragment,
                source: GxpError::BadMagic
            }
        ));

        patcher.destroy(&mut driver, &mut memory);
    }
}
