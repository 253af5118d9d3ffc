/// edgenpu - cycle-level NPU simulator
///
/// Loads a compiled model image and an input tensor, clocks the
/// accelerator until the program reaches DONE or faults, and writes the
/// output tensor.
use clap::Parser;
use edgenpu::simulator::config::config::{load_and_merge_configs, log_level_filter, CliOverrides};
use edgenpu::simulator::utils::log::init_log;
use edgenpu::simulator::Simulator;
use std::fs;
use std::io;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "edgenpu", version, about = "Cycle-level simulator for an int8 edge NPU")]
struct Args {
  /// TOML configuration layered over the built-in defaults
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Compiled model image
  #[arg(short, long)]
  model: Option<String>,

  /// Raw input tensor, copied to external memory before the run
  #[arg(short, long)]
  input: Option<String>,

  /// Where to write the output tensor
  #[arg(short, long)]
  output: Option<String>,

  /// Interactive step mode
  #[arg(short, long)]
  step: bool,

  /// Only warnings and errors
  #[arg(short, long)]
  quiet: bool,

  /// JSON-lines message trace
  #[arg(long)]
  trace_file: Option<String>,

  #[arg(long)]
  max_cycles: Option<u64>,

  /// Print the effective configuration and exit
  #[arg(long)]
  print_config: bool,
}

fn main() -> io::Result<()> {
  let args = Args::parse();
  let cli = CliOverrides {
    model: args.model.as_deref(),
    input: args.input.as_deref(),
    output: args.output.as_deref(),
    trace_file: args.trace_file.as_deref(),
    max_cycles: args.max_cycles,
    quiet: args.quiet,
    step: args.step,
  };
  let config = load_and_merge_configs(args.config.as_deref(), &cli)?;

  if args.print_config {
    print!("{}", config.to_toml()?);
    return Ok(());
  }

  let level = log_level_filter(&config.simulation.log_level).unwrap_or(log::LevelFilter::Info);
  init_log(level, config.simulation.quiet);

  if config.run.model.is_empty() {
    return Err(io::Error::new(
      io::ErrorKind::InvalidInput,
      "no model given; use --model or [run].model",
    ));
  }

  let mut simulator = Simulator::from_app_config(&config)?;
  let Some(outcome) = simulator.run()? else {
    return Ok(());
  };

  if !config.run.output.is_empty() {
    fs::write(&config.run.output, &outcome.output)?;
    log::info!("wrote {} output bytes to {}", outcome.output.len(), config.run.output);
  }
  match outcome.error {
    Some(err) => Err(io::Error::new(io::ErrorKind::Other, err)),
    None => Ok(()),
  }
}
