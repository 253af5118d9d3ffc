use serde::{Deserialize, Serialize};

/// Operand width of the datapath in bits
pub const DATA_WIDTH: u32 = 8;
/// Accumulator width in bits
pub const ACC_WIDTH: u32 = 32;
/// Granularity of on-chip line addresses used by the ISA
pub const LINE_BYTES: usize = 16;
/// Value reported by the VERSION register (major.minor.patch as 8.8.16)
pub const HW_VERSION: u32 = 0x0001_0000;

/// Hardware configuration of one NPU instance
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NpuParams {
  pub pe_rows: usize,
  pub pe_cols: usize,
  pub weight_buffer_bytes: usize,
  pub act_buffer_bytes: usize,
  /// Size of one output buffer half
  pub output_half_bytes: usize,
  pub inst_fifo_entries: usize,
  pub bias_entries: usize,
  pub dma_channels: usize,
  pub bus_width_bits: usize,
  pub max_burst_bytes: usize,
  pub ext_mem_bytes: usize,
}

impl Default for NpuParams {
  fn default() -> Self {
    Self {
      pe_rows: 16,
      pe_cols: 16,
      weight_buffer_bytes: 256 * 1024,
      act_buffer_bytes: 256 * 1024,
      output_half_bytes: 64 * 1024,
      inst_fifo_entries: 1024,
      bias_entries: 4096,
      dma_channels: 4,
      bus_width_bits: 128,
      max_burst_bytes: 256,
      ext_mem_bytes: 16 * 1024 * 1024,
    }
  }
}

impl NpuParams {
  /// Bytes moved per DMA data beat
  pub fn beat_bytes(&self) -> usize {
    (self.bus_width_bits / 8).max(1)
  }

  /// Cycles between the first activation entering the array and the last
  /// column producing its output
  pub fn fill_latency(&self) -> usize {
    self.pe_rows + self.pe_cols - 1
  }

  /// CONFIG register encoding: rows in [7:0], cols in [15:8]
  pub fn config_word(&self) -> u32 {
    (self.pe_rows as u32 & 0xFF) | ((self.pe_cols as u32 & 0xFF) << 8)
  }

  /// Configuration for a small array, convenient in tests
  pub fn with_array(rows: usize, cols: usize) -> Self {
    Self {
      pe_rows: rows,
      pe_cols: cols,
      ..Self::default()
    }
  }
}
