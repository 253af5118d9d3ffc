use std::fmt;

use super::error::{check_range, NpuError, Result};

/// Agent driving a bank write port in a given cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePort {
  Controller,
  Dma(usize),
}

impl fmt::Display for WritePort {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      WritePort::Controller => write!(f, "controller"),
      WritePort::Dma(ch) => write!(f, "dma channel {}", ch),
    }
  }
}

#[derive(Debug, Clone)]
struct Sram {
  data: Vec<u8>,
}

impl Sram {
  fn new(depth: usize) -> Self {
    Self { data: vec![0; depth] }
  }

  fn read_batch(&self, start_addr: usize, count: usize) -> &[u8] {
    &self.data[start_addr..start_addr + count]
  }

  fn write_batch(&mut self, start_addr: usize, data: &[u8]) {
    self.data[start_addr..start_addr + data.len()].copy_from_slice(data);
  }
}

#[derive(Debug, Clone)]
struct PendingWrite {
  addr: usize,
  data: Vec<u8>,
}

/// Byte-addressable on-chip buffer with registered writes.
///
/// Reads observe the contents as of the start of the cycle. Writes are held
/// until [`Bank::commit`] closes the cycle, so a read of an address written
/// in the same cycle returns the old value.
#[derive(Debug, Clone)]
pub struct Bank {
  name: &'static str,
  sram: Sram,
  pending: Vec<PendingWrite>,
  writer: Option<WritePort>,
}

impl Bank {
  pub fn new(name: &'static str, capacity: usize) -> Self {
    Self {
      name,
      sram: Sram::new(capacity),
      pending: Vec::new(),
      writer: None,
    }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  pub fn capacity(&self) -> usize {
    self.sram.data.len()
  }

  pub fn read(&self, addr: usize, len: usize) -> Result<&[u8]> {
    check_range(self.name, addr, len, self.capacity())?;
    Ok(self.sram.read_batch(addr, len))
  }

  pub fn read_i8(&self, addr: usize, len: usize) -> Result<Vec<i8>> {
    Ok(self.read(addr, len)?.iter().map(|&b| b as i8).collect())
  }

  /// Stage a write for this cycle. Only one port may write per cycle.
  pub fn write(&mut self, port: WritePort, addr: usize, data: &[u8]) -> Result<()> {
    check_range(self.name, addr, data.len(), self.capacity())?;
    match self.writer {
      Some(owner) if owner != port => {
        return Err(NpuError::WriteConflict {
          buffer: self.name,
          first: owner.to_string(),
          second: port.to_string(),
        });
      },
      _ => self.writer = Some(port),
    }
    self.pending.push(PendingWrite {
      addr,
      data: data.to_vec(),
    });
    Ok(())
  }

  /// Port currently owning the write side, if any write was staged this cycle
  pub fn writer(&self) -> Option<WritePort> {
    self.writer
  }

  /// Close the cycle: apply staged writes in issue order and release the port
  pub fn commit(&mut self) {
    for write in self.pending.drain(..) {
      self.sram.write_batch(write.addr, &write.data);
    }
    self.writer = None;
  }

  /// Direct host access outside of simulated time
  pub fn preload(&mut self, addr: usize, data: &[u8]) -> Result<()> {
    check_range(self.name, addr, data.len(), self.capacity())?;
    self.sram.write_batch(addr, data);
    Ok(())
  }

  pub fn reset(&mut self) {
    self.sram.data.fill(0);
    self.pending.clear();
    self.writer = None;
  }

  /// Drop staged writes without applying them
  pub fn discard_pending(&mut self) {
    self.pending.clear();
    self.writer = None;
  }
}
