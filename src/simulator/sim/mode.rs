use std::path::PathBuf;

use crate::simulator::config::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
  Continuous,
  Step,
}

/// Harness settings derived from the application config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
  pub quiet: bool,
  pub step_mode: StepMode,
  pub trace_file: Option<PathBuf>,
  pub max_cycles: u64,
}

impl Default for SimConfig {
  fn default() -> Self {
    Self {
      quiet: false,
      step_mode: StepMode::Continuous,
      trace_file: None,
      max_cycles: 10_000_000,
    }
  }
}

impl From<&AppConfig> for SimConfig {
  fn from(app: &AppConfig) -> Self {
    let sim = &app.simulation;
    Self {
      quiet: sim.quiet,
      step_mode: if sim.step_mode { StepMode::Step } else { StepMode::Continuous },
      trace_file: Some(sim.trace_file.trim())
        .filter(|p| !p.is_empty())
        .map(PathBuf::from),
      max_cycles: sim.max_cycles,
    }
  }
}
