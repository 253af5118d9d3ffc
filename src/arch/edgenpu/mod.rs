//! Cycle-level model of a small int8 inference accelerator: a weight
//! stationary systolic array fed from on-chip buffers, an accumulator and
//! vector unit behind it, and a multi-channel DMA to external memory.

pub mod accumulator;
pub mod bank;
pub mod controller;
pub mod decoder;
pub mod dma;
pub mod error;
pub mod exec;
pub mod isa;
pub mod main;
pub mod memory;
pub mod model_format;
pub mod npu;
pub mod params;
pub mod regs;
pub mod systolic_array;
pub mod tensor;
pub mod vector_unit;

pub use controller::NpuState;
pub use error::{NpuError, Result};
pub use main::{create_simulation, HostCommand, RunOutcome};
pub use model_format::ModelImage;
pub use npu::{Npu, RunReport};
pub use params::NpuParams;
