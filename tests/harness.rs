use edgenpu::arch::edgenpu::decoder::{DmaOperands, MatrixOperands};
use edgenpu::arch::edgenpu::isa::{opcode, Flags, Instruction};
use edgenpu::arch::edgenpu::regs::offset;
use edgenpu::arch::edgenpu::{HostCommand, ModelImage};
use edgenpu::simulator::config::config::AppConfig;
use edgenpu::simulator::Simulator;
use edgenpu::{Npu, NpuError, NpuParams, NpuState, SimConfig};
use std::fs;
use std::path::PathBuf;

const INPUT_BASE: usize = 0x1000;

fn params() -> NpuParams {
  NpuParams {
    ext_mem_bytes: 64 * 1024,
    ..NpuParams::with_array(2, 2)
  }
}

fn word(op: u8, flags: Flags, operands: u64) -> u64 {
  Instruction::new(op, flags, operands).word()
}

fn dma(op: u8, src: u32, dst_line: u16) -> u64 {
  let ops = DmaOperands {
    src,
    dst_line,
    lines: 1,
  };
  word(op, Flags::NONE, ops.pack())
}

/// Weights come from external address 0, input from INPUT_BASE; one
/// biased 2x2 GEMM
fn tiny_model() -> ModelImage {
  let gemm = MatrixOperands {
    weight_line: 0,
    act_line: 0,
    count: 1,
  };
  let program = vec![
    dma(opcode::DMA_LOAD_W, 0, 0),
    dma(opcode::DMA_LOAD_A, INPUT_BASE as u32, 0),
    word(opcode::GEMM, Flags::BIAS, gemm.pack()),
    word(opcode::SYNC, Flags::NONE, 0),
  ];
  ModelImage::new(program, vec![1, 2, 3, 4], vec![10, 20], 2, 2)
}

fn quiet() -> SimConfig {
  SimConfig {
    quiet: true,
    ..SimConfig::default()
  }
}

fn scratch(name: &str) -> PathBuf {
  std::env::temp_dir().join(format!("edgenpu-{}-{}", std::process::id(), name))
}

/// Test loading a serialized model image and running it directly
#[test]
fn test_model_image_runs() {
  let image = ModelImage::parse(&tiny_model().to_bytes()).unwrap();
  let mut npu = Npu::new(params());
  npu.load_model(&image, 0).unwrap();
  npu.ext_mem_mut().write(INPUT_BASE, &[1, 1]).unwrap();

  let report = npu.run(1_000).unwrap();
  assert!(report.done);
  assert_eq!(report.instructions, 4);
  assert_eq!(npu.memory().output.read(0, 2).unwrap(), &[14, 26]);
}

/// Test a rejected model image leaving the NPU untouched
#[test]
fn test_bad_model_image() {
  let mut bytes = tiny_model().to_bytes();
  bytes.truncate(bytes.len() - 3);
  assert!(matches!(ModelImage::parse(&bytes), Err(NpuError::InvalidModel(_))));
}

/// Test a full run through the DEVS harness
#[test]
fn test_simulator_run() {
  let mut npu = Npu::new(params());
  npu.load_model(&tiny_model(), 0).unwrap();
  npu.ext_mem_mut().write(INPUT_BASE, &[1, 1]).unwrap();

  let mut simulator = Simulator::new(quiet(), npu, 2).unwrap();
  let outcome = simulator.run().unwrap().unwrap();
  assert!(outcome.report.done);
  assert_eq!(outcome.error, None);
  assert_eq!(outcome.output, vec![14, 26]);
  assert_eq!(outcome.report.instructions, 4);
  assert_eq!(outcome.report.final_state, NpuState::Idle);
  assert_eq!(outcome.report.dma_bytes, 32);
  // the host model has taken delivery
  assert_eq!(simulator.outcomes().len(), 1);
}

/// Test that a faulting program is reported through the harness once
#[test]
fn test_simulator_reports_fault() {
  let mut npu = Npu::new(params());
  npu.push_instruction(0xFF00_0000_0000_0000).unwrap();

  let mut simulator = Simulator::new(quiet(), npu, 0).unwrap();
  let outcome = simulator.run().unwrap().unwrap();
  assert!(!outcome.report.done);
  assert_eq!(outcome.report.error_code, 1);
  assert!(outcome.error.unwrap().contains("invalid opcode"));
  assert_eq!(simulator.outcomes().len(), 1);
}

/// Test an abort sent by the host while the array is busy
#[test]
fn test_simulator_abort() {
  let mut npu = Npu::new(params());
  let gemm = MatrixOperands {
    weight_line: 0,
    act_line: 0,
    count: 64,
  };
  npu
    .load_program(&[word(opcode::GEMM, Flags::NONE, gemm.pack()), word(opcode::SYNC, Flags::NONE, 0)])
    .unwrap();

  let mut simulator = Simulator::new(quiet(), npu, 0).unwrap();
  simulator.send(&HostCommand::Start).unwrap();
  for _ in 0..10 {
    simulator.step().unwrap();
  }
  assert!(simulator.outcomes().is_empty());
  simulator.send(&HostCommand::Abort).unwrap();
  for _ in 0..5 {
    simulator.step().unwrap();
  }
  let outcome = simulator.outcomes().first().cloned().unwrap();
  assert!(!outcome.report.done);
  assert_eq!(outcome.error, None);
  assert_eq!(outcome.report.final_state, NpuState::Idle);
}

/// Test register writes carried as host commands
#[test]
fn test_simulator_register_writes() {
  let mut npu = Npu::new(params());
  npu.memory_mut().weight.preload(0, &[100, 100, 100, 100]).unwrap();
  npu.memory_mut().activation.preload(0, &[1, 1]).unwrap();
  let gemm = MatrixOperands {
    weight_line: 0,
    act_line: 0,
    count: 1,
  };

  let mut simulator = Simulator::new(quiet(), npu, 2).unwrap();
  simulator
    .send(&HostCommand::WriteReg {
      offset: offset::LAYER_QUANT_SHIFT,
      value: 2,
    })
    .unwrap();
  simulator
    .send(&HostCommand::Push {
      word: word(opcode::GEMM, Flags::QUANT, gemm.pack()),
    })
    .unwrap();
  simulator
    .send(&HostCommand::Push {
      word: word(opcode::SYNC, Flags::NONE, 0),
    })
    .unwrap();
  let outcome = simulator.run().unwrap().unwrap();
  assert_eq!(outcome.output, vec![50, 50]);
}

/// Test the JSON-lines message trace
#[test]
fn test_trace_file() {
  let path = scratch("trace.jsonl");
  let mut npu = Npu::new(params());
  npu.push_instruction(word(opcode::SYNC, Flags::NONE, 0)).unwrap();
  let config = SimConfig {
    trace_file: Some(path.clone()),
    ..quiet()
  };

  let mut simulator = Simulator::new(config, npu, 0).unwrap();
  simulator.run().unwrap().unwrap();
  drop(simulator);

  let text = fs::read_to_string(&path).unwrap();
  let entries: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
  assert!(entries
    .iter()
    .any(|e| e["source"] == "npu" && e["source_port"] == "irq" && e["target"] == "host"));
  let _ = fs::remove_file(&path);
}

/// Test building a simulator from configuration plus files on disk
#[test]
fn test_from_app_config() {
  let model_path = scratch("model.bin");
  let input_path = scratch("input.bin");
  fs::write(&model_path, tiny_model().to_bytes()).unwrap();
  fs::write(&input_path, [2u8, 1]).unwrap();

  let mut config = AppConfig::default();
  config.hardware = params();
  config.simulation.quiet = true;
  config.run.model = model_path.to_string_lossy().to_string();
  config.run.input = input_path.to_string_lossy().to_string();
  config.run.input_ext_base = INPUT_BASE;

  let mut simulator = Simulator::from_app_config(&config).unwrap();
  let outcome = simulator.run().unwrap().unwrap();
  // [2*1 + 1*3, 2*2 + 1*4] plus bias [10, 20]
  assert_eq!(outcome.output, vec![15, 28]);

  let _ = fs::remove_file(&model_path);
  let _ = fs::remove_file(&input_path);
}

/// Test a timeout when the program never reaches SYNC
#[test]
fn test_simulator_timeout() {
  let config = SimConfig {
    max_cycles: 50,
    ..quiet()
  };
  let mut simulator = Simulator::new(config, Npu::new(params()), 0).unwrap();
  let err = simulator.run().unwrap_err();
  assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
}
