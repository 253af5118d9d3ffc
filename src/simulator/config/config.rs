use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

use crate::arch::edgenpu::params::NpuParams;

const DEFAULT_TOML: &str = include_str!("default.toml");

/// Simulation section
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationSection {
  pub quiet: bool,
  pub step_mode: bool,
  pub trace_file: String,
  pub log_level: String,
  pub max_cycles: u64,
}

impl Default for SimulationSection {
  fn default() -> Self {
    Self {
      quiet: false,
      step_mode: false,
      trace_file: String::new(),
      log_level: "info".to_string(),
      max_cycles: 10_000_000,
    }
  }
}

/// What to run: model image, input tensor and where the output goes
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RunSection {
  pub model: String,
  pub input: String,
  pub output: String,
  pub weight_ext_base: usize,
  pub input_ext_base: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
  pub hardware: NpuParams,
  pub simulation: SimulationSection,
  pub run: RunSection,
}

impl AppConfig {
  pub fn to_toml(&self) -> io::Result<String> {
    toml::to_string_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
  }
}

/// Values given on the command line; `None` keeps the configured value
#[derive(Debug, Clone, Default)]
pub struct CliOverrides<'a> {
  pub model: Option<&'a str>,
  pub input: Option<&'a str>,
  pub output: Option<&'a str>,
  pub trace_file: Option<&'a str>,
  pub max_cycles: Option<u64>,
  pub quiet: bool,
  pub step: bool,
}

/// Built-in defaults
pub fn load_default_config() -> io::Result<AppConfig> {
  toml::from_str::<AppConfig>(DEFAULT_TOML)
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad built-in defaults: {}", e)))
}

/// Defaults, then the optional user file, then `EDGENPU__SECTION__KEY`
/// environment variables
pub fn load_layered(custom_config_path: Option<&Path>) -> io::Result<AppConfig> {
  let mut builder = Config::builder().add_source(File::from_str(DEFAULT_TOML, FileFormat::Toml));
  if let Some(path) = custom_config_path {
    if !path.exists() {
      return Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("config file {:?} does not exist", path),
      ));
    }
    builder = builder.add_source(File::from(path).format(FileFormat::Toml));
  }
  builder
    .add_source(Environment::with_prefix("EDGENPU").separator("__").try_parsing(true))
    .build()
    .and_then(|c| c.try_deserialize::<AppConfig>())
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid configuration: {}", e)))
}

pub fn apply_cli_overrides(config: &mut AppConfig, cli: &CliOverrides) {
  if cli.quiet {
    config.simulation.quiet = true;
  }
  if cli.step {
    config.simulation.step_mode = true;
  }
  if let Some(file) = cli.trace_file {
    config.simulation.trace_file = file.to_string();
  }
  if let Some(cycles) = cli.max_cycles {
    config.simulation.max_cycles = cycles;
  }
  if let Some(model) = cli.model {
    config.run.model = model.to_string();
  }
  if let Some(input) = cli.input {
    config.run.input = input.to_string();
  }
  if let Some(output) = cli.output {
    config.run.output = output.to_string();
  }
}

pub fn validate_config(config: &AppConfig) -> io::Result<()> {
  let invalid = |msg: String| Err(io::Error::new(io::ErrorKind::InvalidData, msg));
  let hw = &config.hardware;

  if hw.pe_rows == 0 || hw.pe_cols == 0 || hw.pe_rows > 255 || hw.pe_cols > 255 {
    return invalid(format!("array {}x{} must be 1..=255 in each dimension", hw.pe_rows, hw.pe_cols));
  }
  if hw.dma_channels < 4 {
    return invalid(format!("{} DMA channels, at least 4 required", hw.dma_channels));
  }
  if hw.bus_width_bits < 8 || hw.bus_width_bits % 8 != 0 {
    return invalid(format!("bus width {} is not a whole number of bytes", hw.bus_width_bits));
  }
  if hw.max_burst_bytes == 0 {
    return invalid("max_burst_bytes cannot be zero".to_string());
  }
  if hw.inst_fifo_entries == 0 {
    return invalid("inst_fifo_entries cannot be zero".to_string());
  }
  if config.simulation.max_cycles == 0 {
    return invalid("max_cycles cannot be zero".to_string());
  }
  if log_level_filter(&config.simulation.log_level).is_none() {
    return invalid(format!("unknown log level '{}'", config.simulation.log_level));
  }
  Ok(())
}

pub fn log_level_filter(level: &str) -> Option<log::LevelFilter> {
  level.parse::<log::LevelFilter>().ok()
}

/// Load and merge configuration
///
/// 1. built-in defaults
/// 2. the user file, if any
/// 3. environment
/// 4. CLI overrides
/// 5. validation
pub fn load_and_merge_configs(custom_config_path: Option<&Path>, cli: &CliOverrides) -> io::Result<AppConfig> {
  let mut config = load_layered(custom_config_path)?;
  apply_cli_overrides(&mut config, cli);
  validate_config(&config)?;
  Ok(config)
}
