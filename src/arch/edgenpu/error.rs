use std::io;
use thiserror::Error;

/// Failure conditions raised by the NPU model
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NpuError {
  #[error("invalid opcode {opcode:#04x} in instruction {word:#018x}")]
  InvalidOpcode { opcode: u8, word: u64 },

  #[error("invalid operand for {op}: {reason}")]
  InvalidOperand { op: &'static str, reason: String },

  #[error("hardware fault: {0}")]
  HardwareFault(String),

  #[error("timed out after {cycles} cycles")]
  Timeout { cycles: u64 },

  #[error("{buffer} overflow (capacity {capacity})")]
  BufferOverflow { buffer: &'static str, capacity: usize },

  #[error("{buffer} access out of range: addr {addr:#x}, len {len}, capacity {capacity}")]
  AddressOutOfRange {
    buffer: &'static str,
    addr: usize,
    len: usize,
    capacity: usize,
  },

  #[error("{0} not ready")]
  NotReady(&'static str),

  #[error("{buffer} written by {first} and {second} in the same cycle")]
  WriteConflict {
    buffer: &'static str,
    first: String,
    second: String,
  },

  #[error("DMA channel {0} is busy")]
  DmaBusy(usize),

  #[error("invalid model: {0}")]
  InvalidModel(String),
}

pub type Result<T> = std::result::Result<T, NpuError>;

impl NpuError {
  /// Value latched into the ERROR_CODE register
  pub fn code(&self) -> u32 {
    match self {
      NpuError::InvalidOpcode { .. } => 1,
      NpuError::InvalidOperand { .. } => 2,
      NpuError::HardwareFault(_) => 3,
      NpuError::Timeout { .. } => 4,
      NpuError::BufferOverflow { .. } => 5,
      NpuError::AddressOutOfRange { .. } => 6,
      NpuError::NotReady(_) => 7,
      NpuError::WriteConflict { .. } => 8,
      NpuError::DmaBusy(_) => 9,
      NpuError::InvalidModel(_) => 10,
    }
  }
}

impl From<NpuError> for io::Error {
  fn from(err: NpuError) -> Self {
    let kind = match err {
      NpuError::Timeout { .. } => io::ErrorKind::TimedOut,
      NpuError::InvalidModel(_) => io::ErrorKind::InvalidData,
      _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
  }
}

/// Bounds check shared by every on-chip storage
pub(crate) fn check_range(buffer: &'static str, addr: usize, len: usize, capacity: usize) -> Result<()> {
  match addr.checked_add(len) {
    Some(end) if end <= capacity => Ok(()),
    _ => Err(NpuError::AddressOutOfRange {
      buffer,
      addr,
      len,
      capacity,
    }),
  }
}
