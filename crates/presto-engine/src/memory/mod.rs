//! GPU memory adapter.
//!
//! Wraps the driver's memory-block, GPU-mapping and micro-code-mapping calls
//! into uniform alloc/free operations tagged with the owning block.

mod allocator;

pub use allocator::{AllocRequest, AllocStats, AllocationKind, GpuAllocation, GpuMemory, align_up};
