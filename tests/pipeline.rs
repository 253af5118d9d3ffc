use edgenpu::arch::edgenpu::decoder::{
  ConvOperands, DmaOperands, DrainOperands, MatrixOperands, PoolOperands, VectorOperands,
};
use edgenpu::arch::edgenpu::dma::CH_ACT_IN;
use edgenpu::arch::edgenpu::isa::{opcode, Flags, Instruction};
use edgenpu::arch::edgenpu::regs::{irq, offset, status};
use edgenpu::{Npu, NpuError, NpuParams, NpuState};

fn npu(rows: usize, cols: usize) -> Npu {
  Npu::new(NpuParams {
    ext_mem_bytes: 64 * 1024,
    ..NpuParams::with_array(rows, cols)
  })
}

fn word(op: u8, flags: Flags, operands: u64) -> u64 {
  Instruction::new(op, flags, operands).word()
}

fn sync() -> u64 {
  word(opcode::SYNC, Flags::NONE, 0)
}

fn gemm(flags: Flags, weight_line: u16, act_line: u16, count: u16) -> u64 {
  let ops = MatrixOperands {
    weight_line,
    act_line,
    count,
  };
  word(opcode::GEMM, flags, ops.pack())
}

fn dma(op: u8, flags: Flags, src: u32, dst_line: u16, lines: u8) -> u64 {
  let ops = DmaOperands {
    src,
    dst_line,
    lines,
  };
  word(op, flags, ops.pack())
}

fn vector(op: u8, src: u32, aux: u32, len: u16) -> u64 {
  word(op, Flags::NONE, VectorOperands { src, aux, len }.pack())
}

fn bytes(values: &[i8]) -> Vec<u8> {
  values.iter().map(|&v| v as u8).collect()
}

/// Test a GEMM whose operands arrive and leave through DMA
#[test]
fn test_gemm_through_dma() {
  let mut npu = npu(4, 4);
  let weights: [i8; 16] = [1, 0, 0, 0, 0, 2, 0, 0, 0, 0, 3, 0, 1, 1, 1, 1];
  let acts: [i8; 8] = [1, 2, 3, 4, -1, -2, -3, 10];
  npu.ext_mem_mut().write(0x000, &bytes(&weights)).unwrap();
  npu.ext_mem_mut().write(0x100, &bytes(&acts)).unwrap();
  npu
    .load_program(&[
      dma(opcode::DMA_LOAD_W, Flags::NONE, 0x000, 0, 1),
      dma(opcode::DMA_LOAD_A, Flags::NONE, 0x100, 0, 1),
      gemm(Flags::NONE, 0, 0, 2),
      dma(opcode::DMA_STORE, Flags::NONE, 0, 0x20, 1),
      sync(),
    ])
    .unwrap();

  let report = npu.run(1_000).unwrap();
  assert!(report.done);
  assert_eq!(report.instructions, 5);
  assert_eq!(report.mac_ops, 32);
  assert_eq!(report.dma_bytes, 48);
  assert_eq!(report.final_state, NpuState::Idle);

  let stored = npu.ext_mem().read(0x200, 8).unwrap();
  assert_eq!(stored, &bytes(&[5, 8, 13, 4, 9, 6, 1, 10])[..]);
  assert_eq!(npu.read_reg(offset::PERF_INST_CNT), 5);
}

/// Test an external-to-external copy taking both addresses from the
/// instruction
#[test]
fn test_dma_copy() {
  let mut npu = npu(2, 2);
  let pattern: Vec<u8> = (1..=32).collect();
  npu.ext_mem_mut().write(0x300, &pattern).unwrap();
  npu.write_reg(offset::ACT_OUT_BASE, 0x7000);
  npu
    .load_program(&[dma(opcode::DMA_COPY, Flags::NONE, 0x300, 0x50, 2), sync()])
    .unwrap();

  let report = npu.run(500).unwrap();
  assert!(report.done);
  assert_eq!(report.instructions, 2);
  assert_eq!(npu.ext_mem().read(0x500, 32).unwrap(), &pattern[..]);
  assert_eq!(npu.ext_mem().read(0x7000, 4).unwrap(), &[0; 4]);
  assert_eq!(npu.ext_mem().read(0x300, 32).unwrap(), &pattern[..]);
}

/// Test a 2D load whose row count overflows the transfer length
#[test]
fn test_two_d_overflow_faults() {
  let mut npu = npu(2, 2);
  npu.write_reg(offset::LAYER_IN_H, 0x0020_0000);
  npu
    .load_program(&[dma(opcode::DMA_LOAD_2D, Flags::NONE, 0, 0, 255), sync()])
    .unwrap();

  let err = npu.run(10_000).unwrap_err();
  assert!(matches!(err, NpuError::InvalidOperand { op: "dma", .. }));
  assert_eq!(npu.read_reg(offset::ERROR_CODE), 2);
  assert_eq!(npu.state(), NpuState::Idle);
  assert!(npu.dma().is_idle());
}

/// Test bias, requantization shift and fused RELU on the drain path
#[test]
fn test_bias_quant_relu_flags() {
  let mut npu = npu(2, 2);
  npu.memory_mut().weight.preload(0, &[1, 2, 3, 4]).unwrap();
  npu.memory_mut().activation.preload(0, &[1, 1]).unwrap();
  npu.memory_mut().load_bias(8, &[2, -20]).unwrap();
  npu.write_reg(offset::LAYER_BIAS_BASE, 8);
  npu.write_reg(offset::LAYER_QUANT_SHIFT, 1);
  npu
    .load_program(&[gemm(Flags::BIAS | Flags::QUANT | Flags::RELU, 0, 0, 1), sync()])
    .unwrap();

  npu.run(200).unwrap();
  // [4 + 2, 6 - 20] >> 1 = [3, -7], RELU clamps the negative lane
  assert_eq!(npu.memory().output.read(0, 2).unwrap(), &[3, 0]);
}

/// Test saturation against wrap-around selected by QUANT_CTRL
#[test]
fn test_saturation_control() {
  let program = [gemm(Flags::NONE, 0, 0, 1), sync()];

  let mut npu = npu(2, 2);
  npu.memory_mut().weight.preload(0, &[100, 100, 100, 100]).unwrap();
  npu.memory_mut().activation.preload(0, &[1, 1]).unwrap();
  npu.load_program(&program).unwrap();
  npu.run(200).unwrap();
  assert_eq!(npu.memory().output.read(0, 2).unwrap(), &[127, 127]);

  npu.write_reg(offset::LAYER_QUANT_CTRL, 0);
  npu.load_program(&program).unwrap();
  npu.run(200).unwrap();
  // 200 wraps to -56
  assert_eq!(npu.memory().output.read(0, 2).unwrap(), &[200, 200]);
}

/// Test that ACCUM adds a second tile onto the first
#[test]
fn test_accumulate_across_tiles() {
  let mut npu = npu(2, 2);
  npu.memory_mut().weight.preload(0, &[1, 2, 3, 4]).unwrap();
  npu.memory_mut().weight.preload(16, &[1, 0, 0, 1]).unwrap();
  npu.memory_mut().activation.preload(0, &[1, 1]).unwrap();
  npu
    .load_program(&[gemm(Flags::NONE, 0, 0, 1), gemm(Flags::ACCUM, 1, 0, 1), sync()])
    .unwrap();

  let report = npu.run(300).unwrap();
  assert_eq!(report.instructions, 3);
  assert_eq!(npu.memory().output.read(0, 2).unwrap(), &[5, 7]);
}

/// Test that accumulators never leak from one run into the next
#[test]
fn test_no_leak_between_runs() {
  let mut npu = npu(2, 2);
  npu.memory_mut().weight.preload(0, &[1, 2, 3, 4]).unwrap();
  npu.memory_mut().activation.preload(0, &[1, 1]).unwrap();

  npu.load_program(&[gemm(Flags::NONE, 0, 0, 1), sync()]).unwrap();
  assert!(npu.run(200).unwrap().done);
  npu.load_program(&[gemm(Flags::ACCUM, 0, 0, 1), sync()]).unwrap();
  assert!(npu.run(200).unwrap().done);

  assert_eq!(npu.memory().output.read(0, 2).unwrap(), &[4, 6]);
  assert_eq!(npu.runs_completed(), 2);
}

/// Test a 2x2 convolution with two output channels
#[test]
fn test_conv_two_channels() {
  let mut npu = npu(4, 4);
  #[rustfmt::skip]
  let weights: [u8; 16] = [
    1, 1, 0, 0,
    1, 0, 0, 0,
    1, 0, 0, 0,
    1, 0, 0, 0,
  ];
  npu.memory_mut().weight.preload(0, &weights).unwrap();
  npu.memory_mut().activation.preload(0, &[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
  npu.write_reg(offset::LAYER_IN_CH, 1);
  npu.write_reg(offset::LAYER_IN_H, 3);
  npu.write_reg(offset::LAYER_IN_W, 3);
  let conv = ConvOperands {
    in_ch: 1,
    out_ch: 2,
    kernel_h: 2,
    kernel_w: 2,
    stride_h: 1,
    stride_w: 1,
    pad_h: 0,
    pad_w: 0,
  };
  npu.load_program(&[word(opcode::CONV, Flags::NONE, conv.pack()), sync()]).unwrap();

  let report = npu.run(500).unwrap();
  assert!(report.done);
  // channel 0 sums the 2x2 patch, channel 1 picks its top-left tap
  assert_eq!(npu.memory().output.read(0, 8).unwrap(), &[12, 1, 16, 2, 24, 4, 28, 5]);
}

/// Test a convolution that does not fit the array
#[test]
fn test_conv_too_deep_faults() {
  let mut npu = npu(2, 2);
  npu.write_reg(offset::LAYER_IN_H, 3);
  npu.write_reg(offset::LAYER_IN_W, 3);
  let conv = ConvOperands {
    in_ch: 1,
    out_ch: 1,
    kernel_h: 3,
    kernel_w: 3,
    stride_h: 1,
    stride_w: 1,
    pad_h: 0,
    pad_w: 0,
  };
  npu.load_program(&[word(opcode::CONV, Flags::NONE, conv.pack()), sync()]).unwrap();
  let err = npu.run(100).unwrap_err();
  assert!(matches!(err, NpuError::InvalidOperand { op: "conv", .. }));
  assert_eq!(npu.read_reg(offset::ERROR_CODE), 2);
  assert_ne!(npu.read_reg(offset::STATUS) & status::ERROR, 0);
}

/// Test max and average pooling over a 4x4 single channel map
#[test]
fn test_pooling() {
  let input: Vec<u8> = (0..16).collect();
  let pool = PoolOperands {
    kernel_h: 2,
    kernel_w: 2,
    stride_h: 2,
    stride_w: 2,
    in_h: 4,
    in_w: 4,
  };

  let mut npu = npu(2, 2);
  npu.memory_mut().activation.preload(0, &input).unwrap();
  npu.write_reg(offset::LAYER_IN_CH, 1);
  npu.load_program(&[word(opcode::MAXPOOL, Flags::NONE, pool.pack()), sync()]).unwrap();
  npu.run(100).unwrap();
  assert_eq!(npu.memory().output.read(0, 4).unwrap(), &[5, 7, 13, 15]);

  npu.load_program(&[word(opcode::AVGPOOL, Flags::NONE, pool.pack()), sync()]).unwrap();
  npu.run(100).unwrap();
  assert_eq!(npu.memory().output.read(0, 4).unwrap(), &[2, 4, 10, 12]);
}

/// Test activation and elementwise ops on the vector unit
#[test]
fn test_vector_ops() {
  let mut npu = npu(2, 2);
  npu.memory_mut().activation.preload(0, &bytes(&[-3, 5, -1, 0])).unwrap();
  npu.memory_mut().activation.preload(16, &bytes(&[100, -100, 1])).unwrap();
  npu.memory_mut().activation.preload(32, &bytes(&[100, -100, 2])).unwrap();

  npu.load_program(&[vector(opcode::RELU, 0, 0, 4), sync()]).unwrap();
  npu.run(100).unwrap();
  assert_eq!(npu.memory().output.read(0, 4).unwrap(), &[0, 5, 0, 0]);

  npu.load_program(&[vector(opcode::ADD, 16, 32, 3), sync()]).unwrap();
  npu.run(100).unwrap();
  assert_eq!(npu.memory().output.read(0, 3).unwrap(), &bytes(&[127, -128, 3])[..]);
}

/// Test DRAIN copying the output buffer back into the activation buffer
#[test]
fn test_drain_to_activation_buffer() {
  let mut npu = npu(2, 2);
  npu.memory_mut().weight.preload(0, &[1, 2, 3, 4]).unwrap();
  npu.memory_mut().activation.preload(0, &[1, 1]).unwrap();
  let drain = DrainOperands { addr: 64, len: 2 };
  npu
    .load_program(&[gemm(Flags::NONE, 0, 0, 1), word(opcode::DRAIN, Flags::NONE, drain.pack()), sync()])
    .unwrap();

  npu.run(200).unwrap();
  assert_eq!(npu.memory().activation.read(64, 2).unwrap(), &[4, 6]);
}

/// Test an asynchronous load fenced by WAIT_DMA
#[test]
fn test_async_dma_with_wait() {
  let mut npu = npu(2, 2);
  npu.memory_mut().weight.preload(0, &[1, 2, 3, 4]).unwrap();
  npu.ext_mem_mut().write(0x40, &[2, 3]).unwrap();
  npu
    .load_program(&[
      dma(opcode::DMA_LOAD_A, Flags::ASYNC, 0x40, 0, 1),
      word(opcode::WAIT_DMA, Flags::NONE, 0),
      gemm(Flags::NONE, 0, 0, 1),
      sync(),
    ])
    .unwrap();

  let report = npu.run(500).unwrap();
  assert_eq!(report.instructions, 4);
  // [2*1 + 3*3, 2*2 + 3*4]
  assert_eq!(npu.memory().output.read(0, 2).unwrap(), &[11, 16]);
}

/// Test that a transport error on an awaited transfer faults the run
#[test]
fn test_awaited_dma_fault() {
  let mut npu = npu(2, 2);
  npu.write_reg(offset::IRQ_EN, irq::ERROR | irq::DMA_ERROR);
  npu.inject_dma_fault(CH_ACT_IN);
  npu
    .load_program(&[dma(opcode::DMA_LOAD_A, Flags::NONE, 0x40, 0, 1), sync()])
    .unwrap();

  let err = npu.run(200).unwrap_err();
  assert!(matches!(err, NpuError::HardwareFault(_)));
  assert_eq!(npu.read_reg(offset::ERROR_CODE), 3);
  let pending = npu.read_reg(offset::IRQ_STATUS);
  assert_ne!(pending & irq::DMA_ERROR, 0);
  assert_ne!(pending & irq::ERROR, 0);
  assert_eq!(npu.runs_completed(), 0);
  assert!(npu.dma().channel(CH_ACT_IN).unwrap().error().is_some());
}

/// Test that the IRQ flag on an instruction raises DONE when it retires
#[test]
fn test_instruction_irq_flag() {
  let mut npu = npu(2, 2);
  npu.write_reg(offset::IRQ_EN, irq::DONE);
  npu.push_instruction(word(opcode::NOP, Flags::IRQ, 0)).unwrap();
  npu.start();
  for _ in 0..4 {
    npu.advance_cycle();
  }
  assert!(npu.irq_pending());
  npu.write_reg(offset::IRQ_STATUS, irq::DONE);
  assert!(!npu.irq_pending());
}

/// Test that SINGLE_STEP holds the controller between START pulses
#[test]
fn test_single_step() {
  let mut npu = npu(2, 2);
  npu.load_program(&[word(opcode::NOP, Flags::NONE, 0), sync()]).unwrap();
  npu.write_reg(offset::CTRL, edgenpu::arch::edgenpu::regs::ctrl::SINGLE_STEP);
  npu.start();
  npu.advance_cycle();
  assert_eq!(npu.state(), NpuState::Fetch);
  for _ in 0..5 {
    npu.advance_cycle();
  }
  assert_eq!(npu.state(), NpuState::Fetch);
  npu.start();
  npu.advance_cycle();
  assert_eq!(npu.state(), NpuState::Decode);
}
