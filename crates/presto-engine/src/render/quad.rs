use bytemuck::{Pod, Zeroable};

use crate::driver::{
    ContextHandle, Driver, DriverError, IndexFormat, MemBlockType, MemoryAttribs, Primitive,
};
use crate::memory::{AllocRequest, GpuAllocation, GpuMemory};
use crate::shader::{ShaderPipeline, VERTEX_STRIDE};
use crate::texture::{Placement, Texture};

/// Vertices per quad, drawn as a triangle strip.
pub const QUAD_INDEX_COUNT: u32 = 4;

/// Layout of the single interleaved vertex stream.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 3],
    pub texcoord: [f32; 2],
}

const _: () = assert!(size_of::<QuadVertex>() == VERTEX_STRIDE as usize);

/// Destination rectangle of a quad in surface pixels.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct QuadRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl QuadRect {
    /// Rectangle covered by a `width` x `height` texture drawn at `placement`.
    pub fn from_placement(placement: Placement, width: u32, height: u32) -> Self {
        Self {
            x: placement.x,
            y: placement.y,
            width: placement.scale_x * width as f32,
            height: placement.scale_y * height as f32,
        }
    }

    /// Top-left, top-right, bottom-left, bottom-right, at depth 0.5.
    pub fn vertices(&self) -> [QuadVertex; 4] {
        let (l, t) = (self.x, self.y);
        let (r, b) = (self.x + self.width, self.y + self.height);
        let v = |x: f32, y: f32, u: f32, v: f32| QuadVertex {
            position: [x, y, 0.5],
            texcoord: [u, v],
        };
        [
            v(l, t, 0.0, 0.0),
            v(r, t, 1.0, 0.0),
            v(l, b, 0.0, 1.0),
            v(r, b, 1.0, 1.0),
        ]
    }
}

/// Submits one textured quad per call.
///
/// Owns the ascending index buffer and the four-vertex scratch buffer. The
/// scratch buffer is rewritten only when the destination rectangle changes.
///
/// Every draw reads the same scratch buffer, and the GPU consumes it only
/// when the scene is submitted. A scene therefore shows one placement: draws
/// with different rectangles inside one scene all land on the last one
/// written.
#[derive(Debug)]
pub struct QuadRenderer {
    indices: GpuAllocation,
    vertices: GpuAllocation,
    current: Option<QuadRect>,
}

impl QuadRenderer {
    pub fn create<D: Driver>(driver: &mut D, memory: &mut GpuMemory) -> Result<Self, DriverError> {
        let [mut indices, vertices] = memory.alloc_batch(
            driver,
            [
                AllocRequest::Gpu {
                    ty: MemBlockType::UserRwUncache,
                    size: QUAD_INDEX_COUNT as usize * size_of::<u16>(),
                    alignment: size_of::<u16>(),
                    attribs: MemoryAttribs::Read,
                },
                AllocRequest::Gpu {
                    ty: MemBlockType::UserRw,
                    size: 4 * size_of::<QuadVertex>(),
                    alignment: 4,
                    attribs: MemoryAttribs::Read,
                },
            ],
        )?;

        let linear: [u16; QUAD_INDEX_COUNT as usize] = [0, 1, 2, 3];
        if let Err(err) = indices.write(0, &linear) {
            memory.free_all(driver, vec![indices, vertices]);
            return Err(err);
        }

        Ok(Self {
            indices,
            vertices,
            current: None,
        })
    }

    /// Rectangle the scratch vertices currently describe.
    #[inline]
    pub fn current_rect(&self) -> Option<QuadRect> {
        self.current
    }

    /// Rewrites the scratch vertices unless they already describe `rect`.
    pub fn place(&mut self, rect: QuadRect) -> Result<bool, DriverError> {
        if self.current == Some(rect) {
            return Ok(false);
        }
        self.vertices.write(0, &rect.vertices())?;
        self.current = Some(rect);
        Ok(true)
    }

    /// Binds `texture` and the vertex stream, uploads `wvp` and issues the
    /// draw. A scene must be in progress on `ctx`.
    pub fn draw<D: Driver>(
        &mut self,
        driver: &mut D,
        ctx: ContextHandle,
        pipeline: &ShaderPipeline,
        texture: &Texture,
        wvp: &[f32; 16],
    ) -> Result<(), DriverError> {
        self.place(QuadRect::from_placement(
            texture.placement(),
            texture.width(),
            texture.height(),
        ))?;

        driver.set_fragment_texture(ctx, 0, texture.desc())?;
        driver.set_vertex_stream(ctx, 0, self.vertices.address())?;

        let uniforms = driver.reserve_vertex_default_uniform_buffer(ctx)?;
        driver.set_uniform_data_f(uniforms, pipeline.wvp(), 0, wvp)?;

        driver.draw(
            ctx,
            Primitive::TriangleStrip,
            IndexFormat::U16,
            self.indices.address(),
            QUAD_INDEX_COUNT,
        )
    }

    pub fn destroy<D: Driver>(self, driver: &mut D, memory: &mut GpuMemory) {
        memory.free_all(driver, vec![self.indices, self.vertices]);
    }
}
