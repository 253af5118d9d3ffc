use sim::simulator::Simulation;
use std::fs::{self, File};
use std::io::{self, BufWriter, Result};
use std::path::Path;

use super::config::config::AppConfig;
use super::sim::inject::inject_host_command;
use super::sim::mode::{SimConfig, StepMode};
use super::sim::model::{is_quiescent, model_step};
use super::sim::shell::{Command, Shell};
use super::utils::log::set_log;
use super::utils::report::{format_run_report, print_simulation_records};
use crate::arch::edgenpu::{create_simulation, HostCommand, ModelImage, Npu, NpuError, RunOutcome};
use crate::log_info;

pub struct Simulator {
  config: SimConfig,
  simulation: Simulation,
  trace_writer: Option<BufWriter<File>>,
  outcomes: Vec<RunOutcome>,
}

impl Simulator {
  /// Wrap a prepared NPU; `output_len` bytes of the output buffer are
  /// returned with each run outcome
  pub fn new(config: SimConfig, npu: Npu, output_len: usize) -> Result<Self> {
    let trace_writer = match &config.trace_file {
      Some(path) => Some(BufWriter::new(File::create(path)?)),
      None => None,
    };
    Ok(Self {
      config,
      simulation: create_simulation(npu, output_len),
      trace_writer,
      outcomes: Vec::new(),
    })
  }

  /// Build the NPU from `[hardware]`, then load the `[run]` model and input
  pub fn from_app_config(app: &AppConfig) -> Result<Self> {
    let mut npu = Npu::new(app.hardware.clone());
    let mut output_len = 0;

    if !app.run.model.is_empty() {
      let image = load_model_file(Path::new(&app.run.model))?;
      npu.load_model(&image, app.run.weight_ext_base)?;
      output_len = image.header.output_size as usize;
    }
    if !app.run.input.is_empty() {
      let input = fs::read(&app.run.input)?;
      npu.ext_mem_mut().write(app.run.input_ext_base, &input)?;
      log_info!("input: {} bytes at {:#x}", input.len(), app.run.input_ext_base);
    }

    Self::new(SimConfig::from(app), npu, output_len)
  }

  pub fn outcomes(&self) -> &[RunOutcome] {
    &self.outcomes
  }

  pub fn global_time(&self) -> f64 {
    self.simulation.get_global_time()
  }

  pub fn send(&mut self, cmd: &HostCommand) -> Result<()> {
    inject_host_command(&mut self.simulation, cmd).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
  }

  /// Start a run and drive it to its outcome. `None` when the step shell
  /// quit first.
  pub fn run(&mut self) -> Result<Option<RunOutcome>> {
    if self.config.quiet {
      set_log(false);
    }
    self.send(&HostCommand::Start)?;
    let outcome = match self.config.step_mode {
      StepMode::Continuous => self.run_continuous().map(Some),
      StepMode::Step => self.run_step_mode(),
    }?;

    if let Some(outcome) = &outcome {
      self.settle()?;
      log_info!("{}", format_run_report(&outcome.report));
      if let Some(err) = &outcome.error {
        log::error!("run failed: {}", err);
      }
    }
    if log::max_level() >= log::LevelFilter::Debug {
      print_simulation_records(&mut self.simulation);
    }
    Ok(outcome)
  }

  fn run_step_mode(&mut self) -> Result<Option<RunOutcome>> {
    println!("Step mode - Enter steps one cycle, 'si N' steps N, 'c' continues, 'q' quits");
    let mut shell = Shell::new()?;
    let seen = self.outcomes.len();
    loop {
      match shell.read_command()? {
        Command::Quit => return Ok(None),
        Command::Continue => return self.run_continuous().map(Some),
        Command::Step(n) => {
          for _ in 0..n {
            self.step()?;
            if self.outcomes.len() > seen {
              return Ok(self.outcomes.last().cloned());
            }
          }
          println!("t={:.1}", self.global_time());
        },
      }
    }
  }

  fn run_continuous(&mut self) -> Result<RunOutcome> {
    let seen = self.outcomes.len();
    let start = self.global_time();
    loop {
      if let Some(outcome) = self.outcomes.get(seen) {
        return Ok(outcome.clone());
      }
      let elapsed = (self.global_time() - start) as u64;
      if elapsed >= self.config.max_cycles {
        return Err(NpuError::Timeout { cycles: elapsed }.into());
      }
      if is_quiescent(&mut self.simulation) {
        return Err(io::Error::new(
          io::ErrorKind::Other,
          "simulation went idle without reporting a run outcome",
        ));
      }
      self.step()?;
    }
  }

  /// Deliver messages still in flight once the NPU has gone quiet
  fn settle(&mut self) -> Result<()> {
    while !is_quiescent(&mut self.simulation) {
      self.step()?;
    }
    Ok(())
  }

  /// One clock of the simulation
  pub fn step(&mut self) -> Result<()> {
    let messages = model_step(&mut self.simulation, &mut self.trace_writer)?;
    for msg in messages
      .iter()
      .filter(|msg| msg.source_id() == "npu" && msg.source_port() == "irq")
    {
      let outcome: RunOutcome =
        serde_json::from_str(msg.content()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
      self.outcomes.push(outcome);
    }
    Ok(())
  }
}

/// Read and validate a compiled model image
pub fn load_model_file(path: &Path) -> Result<ModelImage> {
  let bytes = fs::read(path)?;
  let image = ModelImage::parse(&bytes)?;
  log_info!(
    "model {:?}: {} instructions, {} weight bytes, {} bias bytes",
    path,
    image.header.num_instructions,
    image.header.weights_size,
    image.header.bias_size
  );
  Ok(image)
}
