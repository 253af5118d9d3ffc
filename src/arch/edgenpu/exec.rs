//! Per-instruction execution context.
//!
//! Built in DECODE from the decoded word and a snapshot of the layer
//! registers, then carried through the pipeline states until the
//! instruction retires.

use super::accumulator::requantize;
use super::bank::Bank;
use super::controller::Plan;
use super::decoder::{
  ActivationKind, ControlOp, ConvKind, ConvOperands, Decoded, DmaKind, EltwiseKind, MatrixKind, Operation, QuantKind,
  ReshapeKind, VectorOperands,
};
use super::dma::{DmaDescriptor, DmaDirection, CH_ACT_IN, CH_ACT_OUT, CH_GENERAL, CH_WEIGHT};
use super::error::{NpuError, Result};
use super::isa::Flags;
use super::memory::{BufferId, MemorySubsystem};
use super::params::{NpuParams, LINE_BYTES};
use super::regs::LayerConfig;
use super::tensor::TensorDescriptor;
use super::vector_unit::{self, NormParams, PoolShape};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaProgress {
  Pending,
  Waiting(usize),
  Finished,
}

/// Which accumulator lanes of each vector become output bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanePick {
  /// the first `n` lanes
  First(usize),
  /// lane `vector % channels`, one byte per vector
  Depthwise(usize),
}

/// im2col view of a convolution over an HWC input in the activation buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
  pub kind: ConvKind,
  pub ops: ConvOperands,
  pub input: TensorDescriptor,
  pub out_h: usize,
  pub out_w: usize,
}

impl ConvGeometry {
  pub fn new(kind: ConvKind, ops: ConvOperands, layer: &LayerConfig, params: &NpuParams) -> Result<Self> {
    let bad = |reason: String| NpuError::InvalidOperand {
      op: match kind {
        ConvKind::Standard => "conv",
        ConvKind::Depthwise => "dwconv",
      },
      reason,
    };
    let (kh, kw) = (ops.kernel_h as usize, ops.kernel_w as usize);
    let (sh, sw) = (ops.stride_h as usize, ops.stride_w as usize);
    let (ph, pw) = (ops.pad_h as usize, ops.pad_w as usize);
    let in_ch = ops.in_ch as usize;
    if kh == 0 || kw == 0 || sh == 0 || sw == 0 || in_ch == 0 {
      return Err(bad("zero kernel, stride or channel count".to_string()));
    }
    if layer.in_h + 2 * ph < kh || layer.in_w + 2 * pw < kw {
      return Err(bad(format!("kernel {}x{} larger than padded input", kh, kw)));
    }

    let (depth, width) = match kind {
      ConvKind::Standard => (kh * kw * in_ch, ops.out_ch as usize),
      ConvKind::Depthwise => (kh * kw, in_ch),
    };
    if depth > params.pe_rows {
      return Err(bad(format!("reduction depth {} exceeds {} array rows", depth, params.pe_rows)));
    }
    if width == 0 || width > params.pe_cols {
      return Err(bad(format!("{} output channels do not fit {} array columns", width, params.pe_cols)));
    }

    Ok(Self {
      kind,
      ops,
      input: TensorDescriptor::int8_hwc(layer.act_in_base as u32, layer.in_h as u32, layer.in_w as u32, in_ch as u32),
      out_h: (layer.in_h + 2 * ph - kh) / sh + 1,
      out_w: (layer.in_w + 2 * pw - kw) / sw + 1,
    })
  }

  fn channels(&self) -> usize {
    self.input.c as usize
  }

  pub fn vectors(&self) -> usize {
    let pixels = self.out_h * self.out_w;
    match self.kind {
      ConvKind::Standard => pixels,
      ConvKind::Depthwise => pixels * self.channels(),
    }
  }

  /// Patch feeding vector `index`, ordered (ky, kx, channel)
  pub fn patch(&self, act: &Bank, index: usize) -> Result<Vec<i8>> {
    let (pixel, only) = match self.kind {
      ConvKind::Standard => (index, None),
      ConvKind::Depthwise => (index / self.channels(), Some(index % self.channels())),
    };
    let (oy, ox) = (pixel / self.out_w, pixel % self.out_w);
    let channels: Vec<usize> = match only {
      Some(c) => vec![c],
      None => (0..self.channels()).collect(),
    };

    let o = &self.ops;
    let mut patch = Vec::with_capacity(o.kernel_h as usize * o.kernel_w as usize * channels.len());
    for dy in 0..o.kernel_h as usize {
      for dx in 0..o.kernel_w as usize {
        let y = (oy * o.stride_h as usize + dy).checked_sub(o.pad_h as usize);
        let x = (ox * o.stride_w as usize + dx).checked_sub(o.pad_w as usize);
        for &c in &channels {
          let value = match (y, x) {
            (Some(y), Some(x)) if y < self.input.h as usize && x < self.input.w as usize => {
              act.read(self.input.addr(0, c as u32, y as u32, x as u32), 1)?[0] as i8
            },
            // zero padding
            _ => 0,
          };
          patch.push(value);
        }
      }
    }
    Ok(patch)
  }
}

#[derive(Debug, Clone)]
pub struct Exec {
  pub decoded: Decoded,
  pub plan: Plan,
  pub layer: LayerConfig,
  pub conv: Option<ConvGeometry>,
  pub lanes: LanePick,
  pub weight_addr: usize,
  pub weight_rows: usize,
  pub rows_loaded: usize,
  pub vectors: Vec<Vec<i8>>,
  pub fed: usize,
  pub compute_cycles: usize,
  pub drained: usize,
  pub operand_a: Vec<i8>,
  pub operand_b: Vec<i8>,
  pub results: Vec<i8>,
  pub dma: DmaProgress,
}

impl Exec {
  /// Plan one decoded instruction. Operand errors surface here and fault the run.
  pub fn new(decoded: Decoded, layer: LayerConfig, params: &NpuParams) -> Result<Self> {
    let mut exec = Self {
      decoded,
      plan: Plan::Nop,
      layer,
      conv: None,
      lanes: LanePick::First(params.pe_cols),
      weight_addr: 0,
      weight_rows: params.pe_rows,
      rows_loaded: 0,
      vectors: Vec::new(),
      fed: 0,
      compute_cycles: 0,
      drained: 0,
      operand_a: Vec::new(),
      operand_b: Vec::new(),
      results: Vec::new(),
      dma: DmaProgress::Pending,
    };
    let accumulate = decoded.flags().contains(Flags::ACCUM);

    exec.plan = match decoded.op {
      Operation::Control(op) => match op {
        ControlOp::Nop => Plan::Nop,
        ControlOp::Halt | ControlOp::Sync => Plan::Halt,
        ControlOp::WaitDma => Plan::WaitDma,
        ControlOp::WaitPe => Plan::WaitPe,
        ControlOp::Irq => Plan::Irq,
        // no program counter behind a FIFO issue stream
        ControlOp::LoopStart { .. } | ControlOp::LoopEnd { .. } | ControlOp::Branch { .. } | ControlOp::Jump { .. } => {
          return Err(NpuError::InvalidOpcode {
            opcode: decoded.inst.opcode,
            word: decoded.inst.word(),
          });
        },
      },
      Operation::Dma(DmaKind::Store | DmaKind::Store2d, _) => Plan::DmaStore,
      Operation::Dma(..) => Plan::DmaLoad,
      Operation::Matrix(kind, m) => {
        exec.weight_addr = m.weight_line as usize * LINE_BYTES;
        Plan::Array {
          load_weights: kind != MatrixKind::Compute,
          accumulate,
          vectors: m.count as usize,
        }
      },
      Operation::Conv(kind, ops) => {
        let geometry = ConvGeometry::new(kind, ops, &layer, params)?;
        exec.weight_addr = layer.weight_base;
        exec.lanes = match kind {
          ConvKind::Standard => LanePick::First(ops.out_ch as usize),
          ConvKind::Depthwise => LanePick::Depthwise(ops.in_ch as usize),
        };
        exec.conv = Some(geometry);
        Plan::Array {
          load_weights: true,
          accumulate,
          vectors: geometry.vectors(),
        }
      },
      Operation::ClearAcc => Plan::ClearAcc,
      Operation::LoadWeight(lw) => {
        let rows = if lw.rows == 0 { params.pe_rows } else { lw.rows as usize };
        if rows > params.pe_rows {
          return Err(NpuError::InvalidOperand {
            op: "load_weight",
            reason: format!("{} rows exceed {} array rows", rows, params.pe_rows),
          });
        }
        exec.weight_addr = lw.addr as usize;
        exec.weight_rows = rows;
        Plan::LoadWeight
      },
      Operation::Drain(_) => Plan::Drain,
      Operation::Pool(..) => Plan::Pool,
      Operation::Activation(..)
      | Operation::Elementwise(..)
      | Operation::Normalize(..)
      | Operation::Quantize(..)
      | Operation::Reshape(..) => Plan::Vector,
    };
    Ok(exec)
  }

  pub fn vector_count(&self) -> usize {
    match self.plan {
      Plan::Array { vectors, .. } => vectors,
      _ => 0,
    }
  }

  /// Stage the inputs of the current instruction from the activation buffer
  pub fn stage(&mut self, mem: &MemorySubsystem, params: &NpuParams) -> Result<()> {
    let act = &mem.activation;
    match self.decoded.op {
      Operation::Matrix(_, m) => {
        let base = m.act_line as usize * LINE_BYTES;
        let rows = params.pe_rows;
        self.vectors = (0..m.count as usize)
          .map(|i| act.read_i8(base + i * rows, rows))
          .collect::<Result<_>>()?;
      },
      Operation::Conv(..) => {
        if let Some(geometry) = self.conv {
          self.vectors = (0..geometry.vectors())
            .map(|i| geometry.patch(act, i))
            .collect::<Result<_>>()?;
        }
      },
      Operation::Pool(_, p) => {
        let channels = self.layer.in_ch.max(1);
        let len = p.in_h as usize * p.in_w as usize * channels;
        self.operand_a = act.read_i8(self.layer.act_in_base, len)?;
      },
      Operation::Activation(_, v) | Operation::Normalize(_, v) | Operation::Quantize(_, v) => {
        self.operand_a = act.read_i8(v.src as usize, v.len as usize)?;
      },
      Operation::Elementwise(kind, v) => {
        self.operand_a = act.read_i8(v.src as usize, v.len as usize)?;
        if kind != EltwiseKind::Abs {
          self.operand_b = act.read_i8(v.aux as usize, v.len as usize)?;
        }
      },
      Operation::Reshape(kind, v) => {
        self.operand_a = act.read_i8(v.src as usize, v.len as usize)?;
        if kind == ReshapeKind::Concat {
          self.operand_b = act.read_i8(v.aux as usize, v.len as usize)?;
        }
      },
      _ => {},
    }
    Ok(())
  }

  /// Pooling over the staged HWC input
  pub fn evaluate_pool(&mut self) -> Result<()> {
    if let Operation::Pool(kind, p) = self.decoded.op {
      let shape = PoolShape {
        in_h: p.in_h as usize,
        in_w: p.in_w as usize,
        channels: self.layer.in_ch.max(1),
        kernel_h: p.kernel_h as usize,
        kernel_w: p.kernel_w as usize,
        stride_h: p.stride_h as usize,
        stride_w: p.stride_w as usize,
      };
      self.results = vector_unit::pool(kind, &self.operand_a, shape)?;
    }
    Ok(())
  }

  /// Vector unit ops, or the fused RELU of an array op
  pub fn evaluate_vector(&mut self, mem: &MemorySubsystem) -> Result<()> {
    let flags = self.decoded.flags();
    let layer = self.layer;
    let bias_at = |i: usize| -> Result<i32> {
      if flags.contains(Flags::BIAS) {
        Ok(mem.bias(layer.bias_base + i, 1)?[0])
      } else {
        Ok(0)
      }
    };

    match self.decoded.op {
      Operation::Activation(kind, _) => {
        let mut out = self.operand_a.clone();
        vector_unit::activate_all(kind, &mut out);
        self.results = out;
      },
      Operation::Elementwise(kind, _) => {
        self.results = vector_unit::elementwise(kind, &self.operand_a, &self.operand_b);
      },
      Operation::Normalize(kind, _) => {
        let params = NormParams {
          scale: layer.quant_scale,
          zero_point: layer.quant_zero,
          shift: layer.quant_shift,
          bias: bias_at(0)?,
        };
        self.results = vector_unit::normalize(kind, &self.operand_a, params);
      },
      Operation::Quantize(kind, v) => {
        self.results = self.quantize(kind, v, &bias_at)?;
      },
      Operation::Reshape(kind, v) => {
        self.results = vector_unit::reshape(kind, &self.operand_a, &self.operand_b, v.aux as usize)?;
      },
      Operation::Matrix(..) | Operation::Conv(..) => {
        if flags.contains(Flags::RELU) {
          vector_unit::activate_all(ActivationKind::Relu, &mut self.results);
        }
      },
      _ => {},
    }
    Ok(())
  }

  fn quantize(&self, kind: QuantKind, v: VectorOperands, bias_at: &dyn Fn(usize) -> Result<i32>) -> Result<Vec<i8>> {
    let layer = &self.layer;
    self.operand_a
      .iter()
      .enumerate()
      .map(|(i, &x)| {
        let x = x as i32;
        Ok(match kind {
          QuantKind::Quantize | QuantKind::Requantize | QuantKind::Scale => {
            requantize(x.wrapping_mul(v.aux_signed()), bias_at(0)?, layer.quant_shift, layer.saturate)
          },
          QuantKind::Dequantize => requantize(x.wrapping_sub(layer.quant_zero), 0, 0, layer.saturate),
          QuantKind::BiasAdd => requantize(x, bias_at(i)?, 0, layer.saturate),
        })
      })
      .collect()
  }

  /// Transfer issued by a DMA instruction
  pub fn dma_descriptor(&self) -> Result<Option<DmaDescriptor>> {
    let Operation::Dma(kind, ops) = self.decoded.op else {
      return Ok(None);
    };
    let src = ops.src;
    let dst = ops.dst_line as u32 * LINE_BYTES as u32;
    let len = ops.lines as u32 * LINE_BYTES as u32;
    let layer = &self.layer;
    let desc = match kind {
      DmaKind::LoadWeight => DmaDescriptor::new(CH_WEIGHT, DmaDirection::Load(BufferId::Weight), src, dst, len),
      DmaKind::LoadAct => DmaDescriptor::new(CH_ACT_IN, DmaDirection::Load(BufferId::Activation), src, dst, len),
      DmaKind::Load2d => DmaDescriptor::new(CH_ACT_IN, DmaDirection::Load(BufferId::Activation), src, dst, 0).rows(
        len,
        layer.in_h as u32,
        layer.dma_src_stride,
        layer.dma_dst_stride,
      )?,
      DmaKind::Store => DmaDescriptor::new(CH_ACT_OUT, DmaDirection::Store(BufferId::Output), src, dst, len),
      DmaKind::Store2d => DmaDescriptor::new(CH_ACT_OUT, DmaDirection::Store(BufferId::Output), src, dst, 0).rows(
        len,
        layer.in_h as u32,
        layer.dma_src_stride,
        layer.dma_dst_stride,
      )?,
      DmaKind::Fill => DmaDescriptor::new(
        CH_GENERAL,
        DmaDirection::Fill(BufferId::Activation, src as u8),
        0,
        dst,
        len,
      ),
      DmaKind::Copy => DmaDescriptor::new(CH_GENERAL, DmaDirection::Copy, src, dst, len),
    };
    Ok(Some(desc))
  }

  /// Bytes produced by accumulator vector `index`
  pub fn pick_lanes(&self, index: usize, drained: &[i8]) -> Vec<i8> {
    match self.lanes {
      LanePick::First(n) => drained.iter().take(n).copied().collect(),
      LanePick::Depthwise(channels) => drained.get(index % channels.max(1)).copied().into_iter().collect(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::edgenpu::decoder::{decode, DmaOperands};
  use crate::arch::edgenpu::isa::{opcode, Instruction};
  use crate::arch::edgenpu::regs::RegisterFile;

  fn layer_with(in_h: usize, in_w: usize) -> LayerConfig {
    LayerConfig {
      in_h,
      in_w,
      ..RegisterFile::new(&NpuParams::default()).layer()
    }
  }

  fn conv_ops(in_ch: u16, out_ch: u16, k: u8, pad: u8) -> ConvOperands {
    ConvOperands {
      in_ch,
      out_ch,
      kernel_h: k,
      kernel_w: k,
      stride_h: 1,
      stride_w: 1,
      pad_h: pad,
      pad_w: pad,
    }
  }

  #[test]
  fn test_conv_geometry_limits() {
    let params = NpuParams::with_array(4, 4);
    let layer = layer_with(3, 3);
    let g = ConvGeometry::new(ConvKind::Standard, conv_ops(1, 2, 2, 0), &layer, &params).unwrap();
    assert_eq!((g.out_h, g.out_w), (2, 2));
    assert_eq!(g.vectors(), 4);

    // 3x3x1 = 9 taps do not fit 4 rows
    let err = ConvGeometry::new(ConvKind::Standard, conv_ops(1, 2, 3, 0), &layer, &params).unwrap_err();
    assert!(matches!(err, NpuError::InvalidOperand { op: "conv", .. }));
    let err = ConvGeometry::new(ConvKind::Standard, conv_ops(1, 5, 2, 0), &layer, &params).unwrap_err();
    assert!(matches!(err, NpuError::InvalidOperand { .. }));

    let dw = ConvGeometry::new(ConvKind::Depthwise, conv_ops(3, 3, 2, 0), &layer, &params).unwrap();
    assert_eq!(dw.vectors(), 12);
  }

  #[test]
  fn test_patch_with_padding() {
    let params = NpuParams::with_array(4, 4);
    let layer = layer_with(2, 2);
    let g = ConvGeometry::new(ConvKind::Standard, conv_ops(1, 1, 2, 1), &layer, &params).unwrap();
    assert_eq!((g.out_h, g.out_w), (3, 3));

    let mut act = Bank::new("activation buffer", 64);
    act.preload(0, &[1, 2, 3, 4]).unwrap();
    // top-left output sees only the first input pixel in its last tap
    assert_eq!(g.patch(&act, 0).unwrap(), vec![0, 0, 0, 1]);
    assert_eq!(g.patch(&act, 4).unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(g.patch(&act, 8).unwrap(), vec![4, 0, 0, 0]);
  }

  #[test]
  fn test_control_flow_is_rejected() {
    let params = NpuParams::default();
    let layer = layer_with(0, 0);
    let word = Instruction::new(opcode::JUMP, Flags::NONE, 3).word();
    let err = Exec::new(decode(word).unwrap(), layer, &params).unwrap_err();
    assert!(matches!(err, NpuError::InvalidOpcode { opcode: opcode::JUMP, .. }));
  }

  #[test]
  fn test_dma_descriptor_mapping() {
    let params = NpuParams::default();
    let ops = DmaOperands {
      src: 0x1000,
      dst_line: 2,
      lines: 4,
    };
    let word = Instruction::new(opcode::DMA_LOAD_A, Flags::NONE, ops.pack()).word();
    let exec = Exec::new(decode(word).unwrap(), layer_with(0, 0), &params).unwrap();
    assert_eq!(exec.plan, Plan::DmaLoad);
    let desc = exec.dma_descriptor().unwrap().unwrap();
    assert_eq!(desc.channel, CH_ACT_IN);
    assert_eq!((desc.src_addr, desc.dst_addr, desc.length), (0x1000, 32, 64));

    let word = Instruction::new(opcode::DMA_STORE, Flags::NONE, ops.pack()).word();
    let exec = Exec::new(decode(word).unwrap(), layer_with(0, 0), &params).unwrap();
    assert_eq!(exec.plan, Plan::DmaStore);
    let desc = exec.dma_descriptor().unwrap().unwrap();
    assert_eq!(desc.direction, DmaDirection::Store(BufferId::Output));
    assert_eq!((desc.src_addr, desc.dst_addr), (0x1000, 32));
  }

  /// Test a store laid out the way firmware emits it: output offset low,
  /// external destination above
  #[test]
  fn test_firmware_store_layout() {
    let params = NpuParams::default();
    // output offset 0, external line 0x20, 2 lines
    let word = Instruction::new(opcode::DMA_STORE, Flags::NONE, 0x02_0020_000000).word();
    let exec = Exec::new(decode(word).unwrap(), layer_with(0, 0), &params).unwrap();
    let desc = exec.dma_descriptor().unwrap().unwrap();
    assert_eq!(desc.channel, CH_ACT_OUT);
    assert_eq!((desc.src_addr, desc.dst_addr, desc.length), (0, 0x200, 32));
  }

  /// Test that COPY takes both ends from the instruction
  #[test]
  fn test_copy_descriptor_ignores_layer() {
    let params = NpuParams::default();
    let mut layer = layer_with(0, 0);
    layer.act_out_base = 0x7000;
    let ops = DmaOperands {
      src: 0x300,
      dst_line: 0x50,
      lines: 1,
    };
    let word = Instruction::new(opcode::DMA_COPY, Flags::NONE, ops.pack()).word();
    let exec = Exec::new(decode(word).unwrap(), layer, &params).unwrap();
    let desc = exec.dma_descriptor().unwrap().unwrap();
    assert_eq!(desc.direction, DmaDirection::Copy);
    assert_eq!((desc.src_addr, desc.dst_addr, desc.length), (0x300, 0x500, 16));
  }

  /// Test that a 2D row count overflowing the transfer length is refused
  #[test]
  fn test_two_d_length_overflow() {
    let params = NpuParams::default();
    let layer = layer_with(0x0020_0000, 0);
    let ops = DmaOperands {
      src: 0,
      dst_line: 0,
      lines: 255,
    };
    let word = Instruction::new(opcode::DMA_LOAD_2D, Flags::NONE, ops.pack()).word();
    let exec = Exec::new(decode(word).unwrap(), layer, &params).unwrap();
    assert!(matches!(exec.dma_descriptor(), Err(NpuError::InvalidOperand { .. })));
  }

  #[test]
  fn test_lane_pick() {
    let params = NpuParams::with_array(4, 4);
    let word = Instruction::new(opcode::GEMM, Flags::NONE, 0).word();
    let mut exec = Exec::new(decode(word).unwrap(), layer_with(0, 0), &params).unwrap();
    assert_eq!(exec.pick_lanes(0, &[1, 2, 3, 4]), vec![1, 2, 3, 4]);
    exec.lanes = LanePick::Depthwise(3);
    assert_eq!(exec.pick_lanes(4, &[1, 2, 3, 4]), vec![2]);
  }
}
