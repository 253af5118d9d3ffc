use std::collections::VecDeque;

use super::bank::Bank;
use super::error::{check_range, NpuError, Result};
use super::params::NpuParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferId {
  Weight,
  Activation,
  Output,
}

/// Output buffer made of two halves that swap roles atomically.
///
/// The controller writes into the write half while readers drain the read
/// half. `swap` publishes the write half as the new read half in one step.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
  halves: [Vec<u8>; 2],
  valid: [bool; 2],
  write_half: usize,
  swaps: u64,
}

impl OutputBuffer {
  pub fn new(half_bytes: usize) -> Self {
    Self {
      halves: [vec![0; half_bytes], vec![0; half_bytes]],
      valid: [false; 2],
      write_half: 0,
      swaps: 0,
    }
  }

  pub fn half_bytes(&self) -> usize {
    self.halves[0].len()
  }

  pub fn write_half(&self) -> usize {
    self.write_half
  }

  pub fn read_half(&self) -> usize {
    1 - self.write_half
  }

  pub fn is_read_valid(&self) -> bool {
    self.valid[self.read_half()]
  }

  pub fn swaps(&self) -> u64 {
    self.swaps
  }

  pub fn write(&mut self, addr: usize, data: &[u8]) -> Result<()> {
    check_range("output buffer", addr, data.len(), self.half_bytes())?;
    let half = self.write_half;
    self.halves[half][addr..addr + data.len()].copy_from_slice(data);
    Ok(())
  }

  /// Read from the current read half
  pub fn read(&self, addr: usize, len: usize) -> Result<&[u8]> {
    self.read_from(self.read_half(), addr, len)
  }

  /// Read from an explicit half; a half whose data is not valid is refused
  pub fn read_from(&self, half: usize, addr: usize, len: usize) -> Result<&[u8]> {
    check_range("output buffer", addr, len, self.half_bytes())?;
    if half > 1 || !self.valid[half] {
      return Err(NpuError::NotReady("output buffer half"));
    }
    Ok(&self.halves[half][addr..addr + len])
  }

  pub fn swap(&mut self) {
    let published = self.write_half;
    self.valid[published] = true;
    self.write_half = 1 - published;
    self.valid[self.write_half] = false;
    self.swaps += 1;
  }

  pub fn reset(&mut self) {
    for half in self.halves.iter_mut() {
      half.fill(0);
    }
    self.valid = [false; 2];
    self.write_half = 0;
    self.swaps = 0;
  }
}

/// In-order instruction queue
#[derive(Debug, Clone)]
pub struct InstructionFifo {
  entries: VecDeque<u64>,
  capacity: usize,
}

impl InstructionFifo {
  pub fn new(capacity: usize) -> Self {
    Self {
      entries: VecDeque::with_capacity(capacity),
      capacity,
    }
  }

  pub fn push(&mut self, word: u64) -> Result<()> {
    if self.entries.len() >= self.capacity {
      return Err(NpuError::BufferOverflow {
        buffer: "instruction fifo",
        capacity: self.capacity,
      });
    }
    self.entries.push_back(word);
    Ok(())
  }

  pub fn pop(&mut self) -> Option<u64> {
    self.entries.pop_front()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }
}

/// All on-chip storage of the NPU
#[derive(Debug, Clone)]
pub struct MemorySubsystem {
  pub weight: Bank,
  pub activation: Bank,
  pub output: OutputBuffer,
  pub instructions: InstructionFifo,
  bias: Vec<i32>,
}

impl MemorySubsystem {
  pub fn new(params: &NpuParams) -> Self {
    Self {
      weight: Bank::new("weight buffer", params.weight_buffer_bytes),
      activation: Bank::new("activation buffer", params.act_buffer_bytes),
      output: OutputBuffer::new(params.output_half_bytes),
      instructions: InstructionFifo::new(params.inst_fifo_entries),
      bias: vec![0; params.bias_entries],
    }
  }

  /// Bank behind a buffer id; the output buffer has no bank
  pub fn bank(&self, id: BufferId) -> Option<&Bank> {
    match id {
      BufferId::Weight => Some(&self.weight),
      BufferId::Activation => Some(&self.activation),
      BufferId::Output => None,
    }
  }

  pub fn bank_mut(&mut self, id: BufferId) -> Option<&mut Bank> {
    match id {
      BufferId::Weight => Some(&mut self.weight),
      BufferId::Activation => Some(&mut self.activation),
      BufferId::Output => None,
    }
  }

  pub fn capacity(&self, id: BufferId) -> usize {
    match id {
      BufferId::Weight => self.weight.capacity(),
      BufferId::Activation => self.activation.capacity(),
      BufferId::Output => self.output.half_bytes(),
    }
  }

  pub fn load_bias(&mut self, base: usize, values: &[i32]) -> Result<()> {
    check_range("bias table", base, values.len(), self.bias.len())?;
    self.bias[base..base + values.len()].copy_from_slice(values);
    Ok(())
  }

  pub fn bias(&self, base: usize, len: usize) -> Result<&[i32]> {
    check_range("bias table", base, len, self.bias.len())?;
    Ok(&self.bias[base..base + len])
  }

  /// End of cycle for every registered storage
  pub fn commit(&mut self) {
    self.weight.commit();
    self.activation.commit();
  }

  /// Drop in-flight state while keeping loaded contents
  pub fn abort(&mut self) {
    self.weight.discard_pending();
    self.activation.discard_pending();
    self.instructions.clear();
  }

  pub fn reset(&mut self) {
    self.weight.reset();
    self.activation.reset();
    self.output.reset();
    self.instructions.clear();
    self.bias.fill(0);
  }
}
