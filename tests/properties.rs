use edgenpu::arch::edgenpu::accumulator::{dequantize, quantize, requantize, QuantParams};
use edgenpu::arch::edgenpu::decoder::MatrixOperands;
use edgenpu::arch::edgenpu::dma::{DmaDescriptor, DmaDirection, CH_WEIGHT};
use edgenpu::arch::edgenpu::isa::{opcode, Flags, Instruction};
use edgenpu::arch::edgenpu::memory::BufferId;
use edgenpu::arch::edgenpu::regs::{irq, offset};
use edgenpu::{Npu, NpuParams};

fn npu(rows: usize, cols: usize) -> Npu {
  Npu::new(NpuParams {
    ext_mem_bytes: 64 * 1024,
    ..NpuParams::with_array(rows, cols)
  })
}

fn gemm(count: u16) -> u64 {
  let ops = MatrixOperands {
    weight_line: 0,
    act_line: 0,
    count,
  };
  Instruction::new(opcode::GEMM, Flags::NONE, ops.pack()).word()
}

fn sync() -> u64 {
  Instruction::new(opcode::SYNC, Flags::NONE, 0).word()
}

/// Test that a 1 KiB transfer moves as four maximal bursts
#[test]
fn test_dma_bursts_through_npu() {
  let mut npu = npu(4, 4);
  let pattern: Vec<u8> = (0..1024).map(|i| (i * 7 % 256) as u8).collect();
  npu.ext_mem_mut().write(0x2000, &pattern).unwrap();
  npu.write_reg(offset::IRQ_EN, irq::DMA_DONE);

  let desc = DmaDescriptor::new(CH_WEIGHT, DmaDirection::Load(BufferId::Weight), 0x2000, 0, 1024).with_irq();
  npu.submit_dma(desc).unwrap();
  npu.wait_idle(1_000).unwrap();

  let ch = npu.dma().channel(CH_WEIGHT).unwrap();
  assert_eq!(ch.burst_log(), &[256, 256, 256, 256]);
  assert_eq!(ch.address_phases(), 4);
  assert_eq!(npu.memory().weight.read(0, 1024).unwrap(), &pattern[..]);
  assert_eq!(npu.read_reg(offset::PERF_DMA_CNT), 1024);
  assert!(npu.irq_pending());
}

/// Test that DONE is raised once per run and stays clear while idle
#[test]
fn test_done_raised_once() {
  let mut npu = npu(2, 2);
  npu.load_program(&[gemm(1), sync()]).unwrap();
  npu.run(1_000).unwrap();
  assert_eq!(npu.runs_completed(), 1);
  assert_ne!(npu.read_reg(offset::IRQ_STATUS) & irq::DONE, 0);

  npu.write_reg(offset::IRQ_STATUS, irq::DONE);
  for _ in 0..50 {
    npu.advance_cycle();
  }
  assert_eq!(npu.read_reg(offset::IRQ_STATUS) & irq::DONE, 0);
  assert_eq!(npu.runs_completed(), 1);
}

/// Test that the output buffer flips once per stored GEMM
#[test]
fn test_output_swaps_per_store() {
  let mut npu = npu(2, 2);
  npu.memory_mut().weight.preload(0, &[1, 0, 0, 1]).unwrap();
  npu.memory_mut().activation.preload(0, &[3, 4]).unwrap();
  npu.load_program(&[gemm(1), gemm(1), gemm(1), sync()]).unwrap();

  let read_half = npu.memory().output.read_half();
  npu.run(1_000).unwrap();
  assert_eq!(npu.memory().output.swaps(), 3);
  assert_ne!(npu.memory().output.read_half(), read_half);
  assert_eq!(npu.memory().output.read(0, 2).unwrap(), &[3, 4]);
}

/// Test that two identical NPUs clocked identically agree cycle for cycle
#[test]
fn test_deterministic_runs() {
  let mut a = npu(4, 4);
  let weights: Vec<u8> = (0..16).map(|i| (i as i8 - 8) as u8).collect();
  a.memory_mut().weight.preload(0, &weights).unwrap();
  a.memory_mut().activation.preload(0, &[9, 250, 3, 7, 1, 1, 1, 1]).unwrap();
  a.load_program(&[gemm(2), sync()]).unwrap();
  let mut b = a.clone();

  a.start();
  b.start();
  for _ in 0..200 {
    a.advance_cycle();
    b.advance_cycle();
    assert_eq!(a.state(), b.state());
    assert_eq!(a.last_signals(), b.last_signals());
  }
  assert_eq!(a.perf(), b.perf());
  assert_eq!(a.memory().output.read(0, 8).unwrap(), b.memory().output.read(0, 8).unwrap());
}

/// Test that dequantize followed by quantize returns every int8 code
#[test]
fn test_quant_roundtrip_all_codes() {
  let params = QuantParams {
    scale: 3 << 14,
    zero_point: -5,
  };
  for q in i8::MIN..=i8::MAX {
    assert_eq!(quantize(dequantize(q, params), params), q as i32);
  }
}

/// Test the saturating and wrapping drain paths at the int8 edges
#[test]
fn test_requantize_edges() {
  assert_eq!(requantize(200, 0, 0, true), 127);
  assert_eq!(requantize(-200, 0, 0, true), -128);
  assert_eq!(requantize(127, 0, 0, true), 127);
  assert_eq!(requantize(-128, 0, 0, true), -128);
  assert_eq!(requantize(200, 0, 0, false), -56);
  assert_eq!(requantize(-7, 0, 1, true), -4);
}
