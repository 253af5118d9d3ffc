pub mod arch;
pub mod simulator;

pub use arch::edgenpu::{Npu, NpuError, NpuParams, NpuState, RunReport};
pub use simulator::sim::mode::{SimConfig, StepMode};
pub use simulator::utils::log;
