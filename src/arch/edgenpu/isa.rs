//! Instruction word format and opcode table.
//!
//! ```text
//!  63      56 55      48 47                                0
//! +----------+----------+-----------------------------------+
//! |  opcode  |  flags   |             operands              |
//! +----------+----------+-----------------------------------+
//! ```

use std::fmt;

pub const OPERAND_BITS: u32 = 48;
pub const OPERAND_MASK: u64 = (1 << OPERAND_BITS) - 1;

pub mod opcode {
  // control
  pub const NOP: u8 = 0x00;
  pub const HALT: u8 = 0x01;
  pub const SYNC: u8 = 0x02;
  pub const WAIT_DMA: u8 = 0x03;
  pub const WAIT_PE: u8 = 0x04;
  pub const IRQ: u8 = 0x05;
  pub const LOOP_START: u8 = 0x06;
  pub const LOOP_END: u8 = 0x07;
  pub const BRANCH: u8 = 0x08;
  pub const JUMP: u8 = 0x09;

  // dma
  pub const DMA_LOAD_W: u8 = 0x10;
  pub const DMA_LOAD_A: u8 = 0x11;
  pub const DMA_STORE: u8 = 0x12;
  pub const DMA_COPY: u8 = 0x13;
  pub const DMA_FILL: u8 = 0x14;
  pub const DMA_LOAD_2D: u8 = 0x15;
  pub const DMA_STORE_2D: u8 = 0x16;

  // compute
  pub const CONV: u8 = 0x20;
  pub const DWCONV: u8 = 0x21;
  pub const GEMM: u8 = 0x22;
  pub const FC: u8 = 0x23;
  pub const MATMUL: u8 = 0x24;
  pub const MAC: u8 = 0x25;
  pub const CLEAR_ACC: u8 = 0x26;
  pub const LOAD_WEIGHT: u8 = 0x27;
  pub const COMPUTE: u8 = 0x28;
  pub const DRAIN: u8 = 0x29;

  // activation
  pub const RELU: u8 = 0x40;
  pub const RELU6: u8 = 0x41;
  pub const SIGMOID: u8 = 0x42;
  pub const TANH: u8 = 0x43;
  pub const LEAKY_RELU: u8 = 0x44;
  pub const SWISH: u8 = 0x45;
  pub const GELU: u8 = 0x46;

  // pooling
  pub const MAXPOOL: u8 = 0x50;
  pub const AVGPOOL: u8 = 0x51;
  pub const GLOBAL_AVGPOOL: u8 = 0x52;
  pub const GLOBAL_MAXPOOL: u8 = 0x53;

  // elementwise
  pub const ADD: u8 = 0x60;
  pub const SUB: u8 = 0x61;
  pub const MUL: u8 = 0x62;
  pub const DIV: u8 = 0x63;
  pub const MAX: u8 = 0x64;
  pub const MIN: u8 = 0x65;
  pub const ABS: u8 = 0x66;

  // normalization
  pub const BATCHNORM: u8 = 0x70;
  pub const LAYERNORM: u8 = 0x71;
  pub const SOFTMAX: u8 = 0x72;

  // quantization
  pub const QUANTIZE: u8 = 0x80;
  pub const DEQUANTIZE: u8 = 0x81;
  pub const REQUANTIZE: u8 = 0x82;
  pub const SCALE: u8 = 0x83;
  pub const BIAS_ADD: u8 = 0x84;

  // reshape
  pub const RESHAPE: u8 = 0x90;
  pub const TRANSPOSE: u8 = 0x91;
  pub const CONCAT: u8 = 0x92;
  pub const SPLIT: u8 = 0x93;
  pub const PAD: u8 = 0x94;
}

/// Opcode space partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
  Control,
  Dma,
  Compute,
  Activation,
  Pooling,
  Elementwise,
  Normalization,
  Quantization,
  Reshape,
}

impl Category {
  pub fn of(opcode: u8) -> Option<Category> {
    match opcode {
      0x00..=0x0F => Some(Category::Control),
      0x10..=0x1F => Some(Category::Dma),
      0x20..=0x3F => Some(Category::Compute),
      0x40..=0x4F => Some(Category::Activation),
      0x50..=0x5F => Some(Category::Pooling),
      0x60..=0x6F => Some(Category::Elementwise),
      0x70..=0x7F => Some(Category::Normalization),
      0x80..=0x8F => Some(Category::Quantization),
      0x90..=0x9F => Some(Category::Reshape),
      _ => None,
    }
  }
}

/// Per-instruction modifier bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(pub u8);

impl Flags {
  pub const NONE: Flags = Flags(0);
  pub const LAST: Flags = Flags(0x01);
  pub const IRQ: Flags = Flags(0x02);
  pub const CHAIN: Flags = Flags(0x04);
  pub const ASYNC: Flags = Flags(0x08);
  pub const RELU: Flags = Flags(0x10);
  pub const BIAS: Flags = Flags(0x20);
  pub const QUANT: Flags = Flags(0x40);
  pub const ACCUM: Flags = Flags(0x80);

  pub fn contains(self, other: Flags) -> bool {
    self.0 & other.0 == other.0
  }

  pub fn bits(self) -> u8 {
    self.0
  }
}

impl std::ops::BitOr for Flags {
  type Output = Flags;

  fn bitor(self, rhs: Flags) -> Flags {
    Flags(self.0 | rhs.0)
  }
}

/// A raw instruction split into its three fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
  pub opcode: u8,
  pub flags: Flags,
  pub operands: u64,
}

impl Instruction {
  pub fn new(opcode: u8, flags: Flags, operands: u64) -> Self {
    Self {
      opcode,
      flags,
      operands: operands & OPERAND_MASK,
    }
  }

  pub fn from_word(word: u64) -> Self {
    Self {
      opcode: (word >> 56) as u8,
      flags: Flags((word >> 48) as u8),
      operands: word & OPERAND_MASK,
    }
  }

  pub fn word(&self) -> u64 {
    ((self.opcode as u64) << 56) | ((self.flags.0 as u64) << 48) | (self.operands & OPERAND_MASK)
  }
}

impl fmt::Display for Instruction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "op={:#04x} flags={:#04x} operands={:#014x}", self.opcode, self.flags.0, self.operands)
  }
}

/// Extract `width` bits starting at `lsb`
pub(crate) fn field(operands: u64, lsb: u32, width: u32) -> u64 {
  (operands >> lsb) & ((1u64 << width) - 1)
}

/// Place `value` into `width` bits starting at `lsb`
pub(crate) fn place(value: u64, lsb: u32, width: u32) -> u64 {
  (value & ((1u64 << width) - 1)) << lsb
}
