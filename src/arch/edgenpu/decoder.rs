use super::error::{NpuError, Result};
use super::isa::{field, opcode, place, Category, Flags, Instruction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
  Nop,
  Halt,
  Sync,
  WaitDma,
  WaitPe,
  Irq,
  LoopStart { count: u16 },
  LoopEnd { target: u16 },
  Branch { target: u16 },
  Jump { target: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaKind {
  LoadWeight,
  LoadAct,
  Store,
  Copy,
  Fill,
  Load2d,
  Store2d,
}

/// src [23:0] as a byte address, dst_line [39:24] in 16-byte lines,
/// lines [47:40]
///
/// Which side is on-chip follows the opcode. Loads and FILL read external
/// memory (FILL takes its byte from `src[7:0]`) and land in an on-chip
/// line. Stores read the output buffer at `src` and land in external line
/// `dst_line`. COPY stays in external memory on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaOperands {
  pub src: u32,
  pub dst_line: u16,
  pub lines: u8,
}

impl DmaOperands {
  pub fn unpack(operands: u64) -> Self {
    Self {
      src: field(operands, 0, 24) as u32,
      dst_line: field(operands, 24, 16) as u16,
      lines: field(operands, 40, 8) as u8,
    }
  }

  pub fn pack(&self) -> u64 {
    place(self.src as u64, 0, 24) | place(self.dst_line as u64, 24, 16) | place(self.lines as u64, 40, 8)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixKind {
  Gemm,
  Fc,
  MatMul,
  Mac,
  /// Streams activations past the weights already held in the array
  Compute,
}

/// weight_line [15:0], act_line [31:16], count [47:32]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixOperands {
  pub weight_line: u16,
  pub act_line: u16,
  pub count: u16,
}

impl MatrixOperands {
  pub fn unpack(operands: u64) -> Self {
    Self {
      weight_line: field(operands, 0, 16) as u16,
      act_line: field(operands, 16, 16) as u16,
      count: field(operands, 32, 16) as u16,
    }
  }

  pub fn pack(&self) -> u64 {
    place(self.weight_line as u64, 0, 16) | place(self.act_line as u64, 16, 16) | place(self.count as u64, 32, 16)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvKind {
  Standard,
  Depthwise,
}

/// in_ch [11:0], out_ch [23:12], then 4-bit kh, kw, sh, sw, ph, pw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvOperands {
  pub in_ch: u16,
  pub out_ch: u16,
  pub kernel_h: u8,
  pub kernel_w: u8,
  pub stride_h: u8,
  pub stride_w: u8,
  pub pad_h: u8,
  pub pad_w: u8,
}

impl ConvOperands {
  pub fn unpack(operands: u64) -> Self {
    let nibble = |lsb| field(operands, lsb, 4) as u8;
    Self {
      in_ch: field(operands, 0, 12) as u16,
      out_ch: field(operands, 12, 12) as u16,
      kernel_h: nibble(24),
      kernel_w: nibble(28),
      stride_h: nibble(32),
      stride_w: nibble(36),
      pad_h: nibble(40),
      pad_w: nibble(44),
    }
  }

  pub fn pack(&self) -> u64 {
    place(self.in_ch as u64, 0, 12)
      | place(self.out_ch as u64, 12, 12)
      | place(self.kernel_h as u64, 24, 4)
      | place(self.kernel_w as u64, 28, 4)
      | place(self.stride_h as u64, 32, 4)
      | place(self.stride_w as u64, 36, 4)
      | place(self.pad_h as u64, 40, 4)
      | place(self.pad_w as u64, 44, 4)
  }
}

/// addr [23:0], rows [39:24]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadWeightOperands {
  pub addr: u32,
  /// Number of array rows to load, 0 loads all of them
  pub rows: u16,
}

impl LoadWeightOperands {
  pub fn unpack(operands: u64) -> Self {
    Self {
      addr: field(operands, 0, 24) as u32,
      rows: field(operands, 24, 16) as u16,
    }
  }

  pub fn pack(&self) -> u64 {
    place(self.addr as u64, 0, 24) | place(self.rows as u64, 24, 16)
  }
}

/// addr [23:0], len [47:24]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOperands {
  pub addr: u32,
  pub len: u32,
}

impl DrainOperands {
  pub fn unpack(operands: u64) -> Self {
    Self {
      addr: field(operands, 0, 24) as u32,
      len: field(operands, 24, 24) as u32,
    }
  }

  pub fn pack(&self) -> u64 {
    place(self.addr as u64, 0, 24) | place(self.len as u64, 24, 24)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
  Max,
  Avg,
  GlobalAvg,
  GlobalMax,
}

/// One byte each: kh, kw, sh, sw, in_h, in_w
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOperands {
  pub kernel_h: u8,
  pub kernel_w: u8,
  pub stride_h: u8,
  pub stride_w: u8,
  pub in_h: u8,
  pub in_w: u8,
}

impl PoolOperands {
  pub fn unpack(operands: u64) -> Self {
    let byte = |lsb| field(operands, lsb, 8) as u8;
    Self {
      kernel_h: byte(0),
      kernel_w: byte(8),
      stride_h: byte(16),
      stride_w: byte(24),
      in_h: byte(32),
      in_w: byte(40),
    }
  }

  pub fn pack(&self) -> u64 {
    [self.kernel_h, self.kernel_w, self.stride_h, self.stride_w, self.in_h, self.in_w]
      .iter()
      .enumerate()
      .fold(0, |acc, (i, &b)| acc | place(b as u64, 8 * i as u32, 8))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
  Relu,
  Relu6,
  Sigmoid,
  Tanh,
  LeakyRelu,
  Swish,
  Gelu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EltwiseKind {
  Add,
  Sub,
  Mul,
  Div,
  Max,
  Min,
  Abs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
  BatchNorm,
  LayerNorm,
  Softmax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantKind {
  Quantize,
  Dequantize,
  Requantize,
  Scale,
  BiasAdd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReshapeKind {
  Reshape,
  Transpose,
  Concat,
  Split,
  Pad,
}

/// src [17:0], aux [35:18], len [47:36]
///
/// `src` and `aux` are activation buffer byte addresses; ops that need a
/// scalar parameter read it from `aux` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorOperands {
  pub src: u32,
  pub aux: u32,
  pub len: u16,
}

impl VectorOperands {
  pub fn unpack(operands: u64) -> Self {
    Self {
      src: field(operands, 0, 18) as u32,
      aux: field(operands, 18, 18) as u32,
      len: field(operands, 36, 12) as u16,
    }
  }

  pub fn pack(&self) -> u64 {
    place(self.src as u64, 0, 18) | place(self.aux as u64, 18, 18) | place(self.len as u64, 36, 12)
  }

  /// `aux` read as an 18-bit two's complement scalar
  pub fn aux_signed(&self) -> i32 {
    ((self.aux << 14) as i32) >> 14
  }
}

/// Typed operation descriptor produced by [`decode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  Control(ControlOp),
  Dma(DmaKind, DmaOperands),
  Matrix(MatrixKind, MatrixOperands),
  Conv(ConvKind, ConvOperands),
  ClearAcc,
  LoadWeight(LoadWeightOperands),
  Drain(DrainOperands),
  Activation(ActivationKind, VectorOperands),
  Pool(PoolKind, PoolOperands),
  Elementwise(EltwiseKind, VectorOperands),
  Normalize(NormKind, VectorOperands),
  Quantize(QuantKind, VectorOperands),
  Reshape(ReshapeKind, VectorOperands),
}

impl Operation {
  pub fn name(&self) -> &'static str {
    match self {
      Operation::Control(op) => match op {
        ControlOp::Nop => "nop",
        ControlOp::Halt => "halt",
        ControlOp::Sync => "sync",
        ControlOp::WaitDma => "wait_dma",
        ControlOp::WaitPe => "wait_pe",
        ControlOp::Irq => "irq",
        ControlOp::LoopStart { .. } => "loop_start",
        ControlOp::LoopEnd { .. } => "loop_end",
        ControlOp::Branch { .. } => "branch",
        ControlOp::Jump { .. } => "jump",
      },
      Operation::Dma(kind, _) => match kind {
        DmaKind::LoadWeight => "dma_load_w",
        DmaKind::LoadAct => "dma_load_a",
        DmaKind::Store => "dma_store",
        DmaKind::Copy => "dma_copy",
        DmaKind::Fill => "dma_fill",
        DmaKind::Load2d => "dma_load_2d",
        DmaKind::Store2d => "dma_store_2d",
      },
      Operation::Matrix(kind, _) => match kind {
        MatrixKind::Gemm => "gemm",
        MatrixKind::Fc => "fc",
        MatrixKind::MatMul => "matmul",
        MatrixKind::Mac => "mac",
        MatrixKind::Compute => "compute",
      },
      Operation::Conv(ConvKind::Standard, _) => "conv",
      Operation::Conv(ConvKind::Depthwise, _) => "dwconv",
      Operation::ClearAcc => "clear_acc",
      Operation::LoadWeight(_) => "load_weight",
      Operation::Drain(_) => "drain",
      Operation::Activation(..) => "activation",
      Operation::Pool(..) => "pool",
      Operation::Elementwise(..) => "elementwise",
      Operation::Normalize(..) => "normalize",
      Operation::Quantize(..) => "quantize",
      Operation::Reshape(..) => "reshape",
    }
  }
}

/// A decoded instruction: the raw fields plus the typed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
  pub inst: Instruction,
  pub op: Operation,
}

impl Decoded {
  pub fn flags(&self) -> Flags {
    self.inst.flags
  }
}

/// Translate one instruction word into a typed operation.
///
/// Pure: the same word always yields the same result.
pub fn decode(word: u64) -> Result<Decoded> {
  let inst = Instruction::from_word(word);
  let invalid = || NpuError::InvalidOpcode {
    opcode: inst.opcode,
    word,
  };
  let category = Category::of(inst.opcode).ok_or_else(invalid)?;
  let ops = inst.operands;
  let target = field(ops, 0, 16) as u16;

  let op = match category {
    Category::Control => Operation::Control(match inst.opcode {
      opcode::NOP => ControlOp::Nop,
      opcode::HALT => ControlOp::Halt,
      opcode::SYNC => ControlOp::Sync,
      opcode::WAIT_DMA => ControlOp::WaitDma,
      opcode::WAIT_PE => ControlOp::WaitPe,
      opcode::IRQ => ControlOp::Irq,
      opcode::LOOP_START => ControlOp::LoopStart { count: target },
      opcode::LOOP_END => ControlOp::LoopEnd { target },
      opcode::BRANCH => ControlOp::Branch { target },
      opcode::JUMP => ControlOp::Jump { target },
      _ => return Err(invalid()),
    }),
    Category::Dma => {
      let kind = match inst.opcode {
        opcode::DMA_LOAD_W => DmaKind::LoadWeight,
        opcode::DMA_LOAD_A => DmaKind::LoadAct,
        opcode::DMA_STORE => DmaKind::Store,
        opcode::DMA_COPY => DmaKind::Copy,
        opcode::DMA_FILL => DmaKind::Fill,
        opcode::DMA_LOAD_2D => DmaKind::Load2d,
        opcode::DMA_STORE_2D => DmaKind::Store2d,
        _ => return Err(invalid()),
      };
      Operation::Dma(kind, DmaOperands::unpack(ops))
    },
    Category::Compute => match inst.opcode {
      opcode::CONV => Operation::Conv(ConvKind::Standard, ConvOperands::unpack(ops)),
      opcode::DWCONV => Operation::Conv(ConvKind::Depthwise, ConvOperands::unpack(ops)),
      opcode::GEMM => Operation::Matrix(MatrixKind::Gemm, MatrixOperands::unpack(ops)),
      opcode::FC => Operation::Matrix(MatrixKind::Fc, MatrixOperands::unpack(ops)),
      opcode::MATMUL => Operation::Matrix(MatrixKind::MatMul, MatrixOperands::unpack(ops)),
      opcode::MAC => Operation::Matrix(MatrixKind::Mac, MatrixOperands::unpack(ops)),
      opcode::COMPUTE => Operation::Matrix(MatrixKind::Compute, MatrixOperands::unpack(ops)),
      opcode::CLEAR_ACC => Operation::ClearAcc,
      opcode::LOAD_WEIGHT => Operation::LoadWeight(LoadWeightOperands::unpack(ops)),
      opcode::DRAIN => Operation::Drain(DrainOperands::unpack(ops)),
      _ => return Err(invalid()),
    },
    Category::Activation => {
      let kind = match inst.opcode {
        opcode::RELU => ActivationKind::Relu,
        opcode::RELU6 => ActivationKind::Relu6,
        opcode::SIGMOID => ActivationKind::Sigmoid,
        opcode::TANH => ActivationKind::Tanh,
        opcode::LEAKY_RELU => ActivationKind::LeakyRelu,
        opcode::SWISH => ActivationKind::Swish,
        opcode::GELU => ActivationKind::Gelu,
        _ => return Err(invalid()),
      };
      Operation::Activation(kind, VectorOperands::unpack(ops))
    },
    Category::Pooling => {
      let kind = match inst.opcode {
        opcode::MAXPOOL => PoolKind::Max,
        opcode::AVGPOOL => PoolKind::Avg,
        opcode::GLOBAL_AVGPOOL => PoolKind::GlobalAvg,
        opcode::GLOBAL_MAXPOOL => PoolKind::GlobalMax,
        _ => return Err(invalid()),
      };
      Operation::Pool(kind, PoolOperands::unpack(ops))
    },
    Category::Elementwise => {
      let kind = match inst.opcode {
        opcode::ADD => EltwiseKind::Add,
        opcode::SUB => EltwiseKind::Sub,
        opcode::MUL => EltwiseKind::Mul,
        opcode::DIV => EltwiseKind::Div,
        opcode::MAX => EltwiseKind::Max,
        opcode::MIN => EltwiseKind::Min,
        opcode::ABS => EltwiseKind::Abs,
        _ => return Err(invalid()),
      };
      Operation::Elementwise(kind, VectorOperands::unpack(ops))
    },
    Category::Normalization => {
      let kind = match inst.opcode {
        opcode::BATCHNORM => NormKind::BatchNorm,
        opcode::LAYERNORM => NormKind::LayerNorm,
        opcode::SOFTMAX => NormKind::Softmax,
        _ => return Err(invalid()),
      };
      Operation::Normalize(kind, VectorOperands::unpack(ops))
    },
    Category::Quantization => {
      let kind = match inst.opcode {
        opcode::QUANTIZE => QuantKind::Quantize,
        opcode::DEQUANTIZE => QuantKind::Dequantize,
        opcode::REQUANTIZE => QuantKind::Requantize,
        opcode::SCALE => QuantKind::Scale,
        opcode::BIAS_ADD => QuantKind::BiasAdd,
        _ => return Err(invalid()),
      };
      Operation::Quantize(kind, VectorOperands::unpack(ops))
    },
    Category::Reshape => {
      let kind = match inst.opcode {
        opcode::RESHAPE => ReshapeKind::Reshape,
        opcode::TRANSPOSE => ReshapeKind::Transpose,
        opcode::CONCAT => ReshapeKind::Concat,
        opcode::SPLIT => ReshapeKind::Split,
        opcode::PAD => ReshapeKind::Pad,
        _ => return Err(invalid()),
      };
      Operation::Reshape(kind, VectorOperands::unpack(ops))
    },
  };

  Ok(Decoded { inst, op })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn word(op: u8, flags: Flags, operands: u64) -> u64 {
    Instruction::new(op, flags, operands).word()
  }

  #[test]
  fn test_decode_dma_layout() {
    // src 0x012345, dst line 0x0040, 8 lines
    let w = word(opcode::DMA_LOAD_W, Flags::ASYNC, 0x08_0040_012345);
    let decoded = decode(w).unwrap();
    assert_eq!(
      decoded.op,
      Operation::Dma(
        DmaKind::LoadWeight,
        DmaOperands {
          src: 0x012345,
          dst_line: 0x0040,
          lines: 8
        }
      )
    );
    assert!(decoded.flags().contains(Flags::ASYNC));
  }

  #[test]
  fn test_layout_follows_opcode_not_flags() {
    let operands = 0x0003_0002_0001;
    let gemm = decode(word(opcode::GEMM, Flags::QUANT, operands)).unwrap();
    let dma = decode(word(opcode::DMA_LOAD_A, Flags::QUANT, operands)).unwrap();
    assert_eq!(
      gemm.op,
      Operation::Matrix(
        MatrixKind::Gemm,
        MatrixOperands {
          weight_line: 1,
          act_line: 2,
          count: 3
        }
      )
    );
    match dma.op {
      Operation::Dma(DmaKind::LoadAct, ops) => {
        assert_eq!(ops.src, 0x02_0001);
        assert_eq!(ops.dst_line, 0x0300);
        assert_eq!(ops.lines, 0);
      },
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn test_decode_conv_nibbles() {
    let conv = ConvOperands {
      in_ch: 3,
      out_ch: 8,
      kernel_h: 3,
      kernel_w: 3,
      stride_h: 1,
      stride_w: 2,
      pad_h: 1,
      pad_w: 0,
    };
    assert_eq!(conv.pack(), 0x01_2_1_3_3_008_003);
    let decoded = decode(word(opcode::CONV, Flags::RELU, conv.pack())).unwrap();
    assert_eq!(decoded.op, Operation::Conv(ConvKind::Standard, conv));
  }

  #[test]
  fn test_decode_pool_bytes() {
    let decoded = decode(word(opcode::MAXPOOL, Flags::NONE, 0x08_08_02_02_02_02)).unwrap();
    match decoded.op {
      Operation::Pool(PoolKind::Max, p) => {
        assert_eq!((p.kernel_h, p.kernel_w, p.stride_h, p.stride_w), (2, 2, 2, 2));
        assert_eq!((p.in_h, p.in_w), (8, 8));
      },
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn test_vector_aux_sign() {
    let ops = VectorOperands {
      src: 0x100,
      aux: 0x3FFFF,
      len: 32,
    };
    let back = VectorOperands::unpack(ops.pack());
    assert_eq!(back.aux_signed(), -1);
    assert_eq!(back.src, 0x100);
    assert_eq!(back.len, 32);
  }

  #[test]
  fn test_control_operands() {
    let decoded = decode(word(opcode::LOOP_START, Flags::NONE, 12)).unwrap();
    assert_eq!(decoded.op, Operation::Control(ControlOp::LoopStart { count: 12 }));
    assert_eq!(decode(0).unwrap().op, Operation::Control(ControlOp::Nop));
  }

  #[test]
  fn test_invalid_opcodes() {
    for op in [0x0Au8, 0x17, 0x2A, 0x3F, 0x47, 0x54, 0x67, 0x73, 0x85, 0x95, 0xA0, 0xFF] {
      let w = word(op, Flags::NONE, 0);
      assert_eq!(decode(w), Err(NpuError::InvalidOpcode { opcode: op, word: w }), "opcode {:#x}", op);
    }
  }
}
