//! Compiled model container.
//!
//! Layout, all little-endian: a 64-byte header of sixteen u32 words, then
//! `num_instructions` u64 words, `weights_size` int8 weights and
//! `bias_size / 4` i32 bias values.

use serde::{Deserialize, Serialize};

use super::error::{NpuError, Result};

pub const MODEL_MAGIC: u32 = 0x5550_4E45;
pub const MODEL_VERSION: u32 = 0x0100;
pub const HEADER_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelHeader {
  pub magic: u32,
  pub version: u32,
  pub num_instructions: u32,
  pub instructions_size: u32,
  pub weights_size: u32,
  pub bias_size: u32,
  pub input_size: u32,
  pub output_size: u32,
  pub reserved: [u32; 8],
}

impl ModelHeader {
  fn parse(bytes: &[u8]) -> Result<Self> {
    if bytes.len() < HEADER_BYTES {
      return Err(NpuError::InvalidModel(format!(
        "{} bytes is shorter than the {}-byte header",
        bytes.len(),
        HEADER_BYTES
      )));
    }
    let word = |i: usize| u32::from_le_bytes([bytes[4 * i], bytes[4 * i + 1], bytes[4 * i + 2], bytes[4 * i + 3]]);
    let mut reserved = [0; 8];
    for (i, slot) in reserved.iter_mut().enumerate() {
      *slot = word(8 + i);
    }
    Ok(Self {
      magic: word(0),
      version: word(1),
      num_instructions: word(2),
      instructions_size: word(3),
      weights_size: word(4),
      bias_size: word(5),
      input_size: word(6),
      output_size: word(7),
      reserved,
    })
  }

  fn to_bytes(&self) -> Vec<u8> {
    let words = [
      self.magic,
      self.version,
      self.num_instructions,
      self.instructions_size,
      self.weights_size,
      self.bias_size,
      self.input_size,
      self.output_size,
    ];
    words
      .iter()
      .chain(self.reserved.iter())
      .flat_map(|w| w.to_le_bytes())
      .collect()
  }
}

/// A parsed model: program, weights and bias table contents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelImage {
  pub header: ModelHeader,
  pub instructions: Vec<u64>,
  pub weights: Vec<u8>,
  pub bias: Vec<i32>,
}

impl ModelImage {
  /// Assemble an image; header sizes are derived from the payload
  pub fn new(instructions: Vec<u64>, weights: Vec<u8>, bias: Vec<i32>, input_size: u32, output_size: u32) -> Self {
    let header = ModelHeader {
      magic: MODEL_MAGIC,
      version: MODEL_VERSION,
      num_instructions: instructions.len() as u32,
      instructions_size: (instructions.len() * 8) as u32,
      weights_size: weights.len() as u32,
      bias_size: (bias.len() * 4) as u32,
      input_size,
      output_size,
      reserved: [0; 8],
    };
    Self {
      header,
      instructions,
      weights,
      bias,
    }
  }

  pub fn parse(bytes: &[u8]) -> Result<Self> {
    let header = ModelHeader::parse(bytes)?;
    if header.magic != MODEL_MAGIC {
      return Err(NpuError::InvalidModel(format!("bad magic {:#010x}", header.magic)));
    }
    if header.version != MODEL_VERSION {
      return Err(NpuError::InvalidModel(format!("unsupported version {:#06x}", header.version)));
    }
    if header.instructions_size as u64 != header.num_instructions as u64 * 8 {
      return Err(NpuError::InvalidModel(format!(
        "instructions_size {} does not match {} instructions",
        header.instructions_size, header.num_instructions
      )));
    }
    if header.bias_size % 4 != 0 {
      return Err(NpuError::InvalidModel(format!(
        "bias_size {} is not a multiple of 4",
        header.bias_size
      )));
    }

    let inst_len = header.instructions_size as usize;
    let weights_len = header.weights_size as usize;
    let bias_len = header.bias_size as usize;
    let needed = HEADER_BYTES + inst_len + weights_len + bias_len;
    if bytes.len() < needed {
      return Err(NpuError::InvalidModel(format!(
        "truncated: {} bytes, header declares {}",
        bytes.len(),
        needed
      )));
    }

    let (inst_bytes, rest) = bytes[HEADER_BYTES..].split_at(inst_len);
    let (weight_bytes, rest) = rest.split_at(weights_len);
    let instructions = inst_bytes
      .chunks_exact(8)
      .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
      .collect();
    let weights = weight_bytes.to_vec();
    let bias = rest[..bias_len]
      .chunks_exact(4)
      .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
      .collect();

    Ok(Self {
      header,
      instructions,
      weights,
      bias,
    })
  }

  pub fn to_bytes(&self) -> Vec<u8> {
    let mut out = self.header.to_bytes();
    out.extend(self.instructions.iter().flat_map(|w| w.to_le_bytes()));
    out.extend_from_slice(&self.weights);
    out.extend(self.bias.iter().flat_map(|b| b.to_le_bytes()));
    out
  }
}
