use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::bank::WritePort;
use super::error::{check_range, NpuError, Result};
use super::memory::{BufferId, MemorySubsystem};
use super::params::NpuParams;

pub const CH_WEIGHT: usize = 0;
pub const CH_ACT_IN: usize = 1;
pub const CH_ACT_OUT: usize = 2;
pub const CH_GENERAL: usize = 3;

/// Host memory behind the system bus
#[derive(Debug, Clone)]
pub struct ExternalMemory {
  data: Vec<u8>,
}

impl ExternalMemory {
  pub fn new(size: usize) -> Self {
    Self { data: vec![0; size] }
  }

  pub fn size(&self) -> usize {
    self.data.len()
  }

  pub fn read(&self, addr: usize, len: usize) -> Result<&[u8]> {
    check_range("external memory", addr, len, self.data.len())?;
    Ok(&self.data[addr..addr + len])
  }

  pub fn write(&mut self, addr: usize, bytes: &[u8]) -> Result<()> {
    check_range("external memory", addr, bytes.len(), self.data.len())?;
    self.data[addr..addr + bytes.len()].copy_from_slice(bytes);
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmaState {
  Idle,
  ReadAddr,
  ReadData,
  WriteAddr,
  WriteData,
  WriteResp,
  Complete,
}

/// Which way a descriptor moves data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
  /// external memory to an on-chip buffer
  Load(BufferId),
  /// on-chip buffer to external memory
  Store(BufferId),
  /// external memory to external memory
  Copy,
  /// constant byte into an on-chip buffer
  Fill(BufferId, u8),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaFlags(pub u8);

impl DmaFlags {
  pub const TWO_D: DmaFlags = DmaFlags(0x01);
  pub const IRQ: DmaFlags = DmaFlags(0x02);
  pub const CHAIN: DmaFlags = DmaFlags(0x04);

  pub fn contains(self, other: DmaFlags) -> bool {
    self.0 & other.0 == other.0
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDescriptor {
  pub src_addr: u32,
  pub dst_addr: u32,
  pub length: u32,
  pub src_stride: u32,
  pub dst_stride: u32,
  pub width: u32,
  pub height: u32,
  pub channel: usize,
  pub direction: DmaDirection,
  pub flags: DmaFlags,
}

impl DmaDescriptor {
  pub fn new(channel: usize, direction: DmaDirection, src_addr: u32, dst_addr: u32, length: u32) -> Self {
    Self {
      src_addr,
      dst_addr,
      length,
      src_stride: 0,
      dst_stride: 0,
      width: 0,
      height: 0,
      channel,
      direction,
      flags: DmaFlags::default(),
    }
  }

  /// Turn into a 2-D transfer of `height` rows of `width` bytes
  pub fn rows(mut self, width: u32, height: u32, src_stride: u32, dst_stride: u32) -> Result<Self> {
    self.length = width.checked_mul(height).ok_or_else(|| NpuError::InvalidOperand {
      op: "dma",
      reason: format!("{} rows of {} bytes overflow the transfer length", height, width),
    })?;
    self.width = width;
    self.height = height;
    self.src_stride = src_stride;
    self.dst_stride = dst_stride;
    self.flags = DmaFlags(self.flags.0 | DmaFlags::TWO_D.0);
    Ok(self)
  }

  pub fn with_irq(mut self) -> Self {
    self.flags = DmaFlags(self.flags.0 | DmaFlags::IRQ.0);
    self
  }

  fn segments(&self) -> Vec<Segment> {
    let segments = if self.flags.contains(DmaFlags::TWO_D) {
      (0..self.height as usize)
        .map(|row| Segment {
          src: self.src_addr as usize + row * self.src_stride as usize,
          dst: self.dst_addr as usize + row * self.dst_stride as usize,
          len: self.width as usize,
        })
        .collect()
    } else {
      vec![Segment {
        src: self.src_addr as usize,
        dst: self.dst_addr as usize,
        len: self.length as usize,
      }]
    };
    segments.into_iter().filter(|s| s.len > 0).collect()
  }

  fn is_read_path(&self) -> bool {
    matches!(self.direction, DmaDirection::Load(_) | DmaDirection::Copy | DmaDirection::Fill(..))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
  src: usize,
  dst: usize,
  len: usize,
}

/// Reported when a channel passes through COMPLETE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaCompletion {
  pub channel: usize,
  pub bytes: u64,
  pub error: Option<NpuError>,
  pub irq: bool,
}

#[derive(Debug, Clone)]
pub struct DmaChannel {
  index: usize,
  state: DmaState,
  desc: Option<DmaDescriptor>,
  segments: VecDeque<Segment>,
  seg_offset: usize,
  burst_left: usize,
  done: bool,
  error: Option<NpuError>,
  fault_pending: bool,
  burst_log: Vec<usize>,
  bytes_moved: u64,
  stall_cycles: u64,
}

impl DmaChannel {
  fn new(index: usize) -> Self {
    Self {
      index,
      state: DmaState::Idle,
      desc: None,
      segments: VecDeque::new(),
      seg_offset: 0,
      burst_left: 0,
      done: false,
      error: None,
      fault_pending: false,
      burst_log: Vec::new(),
      bytes_moved: 0,
      stall_cycles: 0,
    }
  }

  pub fn state(&self) -> DmaState {
    self.state
  }

  pub fn is_busy(&self) -> bool {
    self.state != DmaState::Idle
  }

  /// Sticky until the next descriptor is accepted
  pub fn done(&self) -> bool {
    self.done
  }

  pub fn error(&self) -> Option<&NpuError> {
    self.error.as_ref()
  }

  /// Bytes carried by each address phase of the current or last transfer
  pub fn burst_log(&self) -> &[usize] {
    &self.burst_log
  }

  pub fn address_phases(&self) -> usize {
    self.burst_log.len()
  }

  pub fn bytes_moved(&self) -> u64 {
    self.bytes_moved
  }

  pub fn stall_cycles(&self) -> u64 {
    self.stall_cycles
  }

  pub fn descriptor(&self) -> Option<&DmaDescriptor> {
    self.desc.as_ref()
  }

  fn start(&mut self, desc: DmaDescriptor) {
    self.segments = desc.segments().into();
    self.state = if self.segments.is_empty() {
      DmaState::Complete
    } else if desc.is_read_path() {
      DmaState::ReadAddr
    } else {
      DmaState::WriteAddr
    };
    self.desc = Some(desc);
    self.seg_offset = 0;
    self.burst_left = 0;
    self.done = false;
    self.error = None;
    self.burst_log.clear();
    self.bytes_moved = 0;
  }

  fn abort(&mut self) {
    self.state = DmaState::Idle;
    self.desc = None;
    self.segments.clear();
    self.burst_left = 0;
    self.fault_pending = false;
  }

  fn advance(
    &mut self,
    beat_bytes: usize,
    max_burst: usize,
    ext: &mut ExternalMemory,
    mem: &mut MemorySubsystem,
  ) -> Option<DmaCompletion> {
    let desc = self.desc?;
    match self.state {
      DmaState::Idle => {},
      DmaState::ReadAddr | DmaState::WriteAddr => {
        let seg = self.segments.front()?;
        let burst = (seg.len - self.seg_offset).min(max_burst);
        self.burst_left = burst;
        self.burst_log.push(burst);
        self.state = if self.state == DmaState::ReadAddr {
          DmaState::ReadData
        } else {
          DmaState::WriteData
        };
      },
      DmaState::ReadData | DmaState::WriteData => {
        if self.fault_pending {
          self.fault_pending = false;
          self.error = Some(NpuError::HardwareFault(format!("dma channel {} transport error", self.index)));
          self.state = DmaState::Complete;
          return None;
        }
        let seg = *self.segments.front()?;
        let n = beat_bytes.min(self.burst_left);
        let src = seg.src + self.seg_offset;
        let dst = seg.dst + self.seg_offset;
        match move_beat(desc.direction, WritePort::Dma(self.index), src, dst, n, ext, mem) {
          Ok(true) => {},
          Ok(false) => {
            self.stall_cycles += 1;
            return None;
          },
          Err(e) => {
            self.error = Some(e);
            self.state = DmaState::Complete;
            return None;
          },
        }
        self.seg_offset += n;
        self.burst_left -= n;
        self.bytes_moved += n as u64;
        if self.burst_left == 0 {
          if self.seg_offset == seg.len {
            self.segments.pop_front();
            self.seg_offset = 0;
          }
          self.state = match self.state {
            DmaState::WriteData => DmaState::WriteResp,
            _ if self.segments.is_empty() => DmaState::Complete,
            _ => DmaState::ReadAddr,
          };
        }
      },
      DmaState::WriteResp => {
        self.state = if self.segments.is_empty() {
          DmaState::Complete
        } else {
          DmaState::WriteAddr
        };
      },
      DmaState::Complete => {
        self.done = true;
        self.state = DmaState::Idle;
        self.desc = None;
        return Some(DmaCompletion {
          channel: self.index,
          bytes: self.bytes_moved,
          error: self.error.clone(),
          irq: desc.flags.contains(DmaFlags::IRQ),
        });
      },
    }
    None
  }
}

/// Move one beat; `Ok(false)` means the target bank is owned by another
/// writer this cycle and the beat must be retried.
fn move_beat(
  direction: DmaDirection,
  port: WritePort,
  src: usize,
  dst: usize,
  n: usize,
  ext: &mut ExternalMemory,
  mem: &mut MemorySubsystem,
) -> Result<bool> {
  match direction {
    DmaDirection::Load(buffer) | DmaDirection::Fill(buffer, _) => {
      let data = match direction {
        DmaDirection::Fill(_, value) => vec![value; n],
        _ => ext.read(src, n)?.to_vec(),
      };
      let bank = mem
        .bank_mut(buffer)
        .ok_or_else(|| NpuError::HardwareFault("dma load into output buffer".to_string()))?;
      if matches!(bank.writer(), Some(owner) if owner != port) {
        return Ok(false);
      }
      bank.write(port, dst, &data)?;
    },
    DmaDirection::Store(buffer) => {
      let data = match mem.bank(buffer) {
        Some(bank) => bank.read(src, n)?.to_vec(),
        None => mem.output.read(src, n)?.to_vec(),
      };
      ext.write(dst, &data)?;
    },
    DmaDirection::Copy => {
      let data = ext.read(src, n)?.to_vec();
      ext.write(dst, &data)?;
    },
  }
  Ok(true)
}

/// Multi-channel burst DMA engine
#[derive(Debug, Clone)]
pub struct DmaEngine {
  channels: Vec<DmaChannel>,
  beat_bytes: usize,
  max_burst: usize,
}

impl DmaEngine {
  pub fn new(params: &NpuParams) -> Self {
    Self {
      channels: (0..params.dma_channels).map(DmaChannel::new).collect(),
      beat_bytes: params.beat_bytes(),
      max_burst: params.max_burst_bytes.max(1),
    }
  }

  pub fn channel(&self, index: usize) -> Option<&DmaChannel> {
    self.channels.get(index)
  }

  pub fn channels(&self) -> &[DmaChannel] {
    &self.channels
  }

  pub fn is_idle(&self) -> bool {
    self.channels.iter().all(|ch| !ch.is_busy())
  }

  /// True when a busy channel targets `buffer` with writes
  pub fn is_writing(&self, buffer: BufferId) -> bool {
    self.channels.iter().any(|ch| {
      ch.is_busy()
        && matches!(
          ch.desc.map(|d| d.direction),
          Some(DmaDirection::Load(b)) | Some(DmaDirection::Fill(b, _)) if b == buffer
        )
    })
  }

  /// True when a busy channel drains `buffer`
  pub fn is_reading(&self, buffer: BufferId) -> bool {
    self.channels.iter().any(|ch| {
      ch.is_busy() && matches!(ch.desc.map(|d| d.direction), Some(DmaDirection::Store(b)) if b == buffer)
    })
  }

  /// Accept a descriptor. The whole transfer is range-checked up front.
  pub fn submit(&mut self, desc: DmaDescriptor, ext: &ExternalMemory, mem: &MemorySubsystem) -> Result<()> {
    let channel = self.channels.get(desc.channel).ok_or_else(|| NpuError::InvalidOperand {
      op: "dma",
      reason: format!("no channel {}", desc.channel),
    })?;
    if channel.is_busy() {
      return Err(NpuError::DmaBusy(desc.channel));
    }

    if matches!(
      desc.direction,
      DmaDirection::Load(BufferId::Output) | DmaDirection::Fill(BufferId::Output, _)
    ) {
      return Err(NpuError::InvalidOperand {
        op: "dma",
        reason: "output buffer is not a load target".to_string(),
      });
    }
    for seg in desc.segments() {
      match desc.direction {
        DmaDirection::Load(buffer) => {
          check_range("external memory", seg.src, seg.len, ext.size())?;
          check_range(buffer_name(buffer), seg.dst, seg.len, mem.capacity(buffer))?;
        },
        DmaDirection::Fill(buffer, _) => {
          check_range(buffer_name(buffer), seg.dst, seg.len, mem.capacity(buffer))?;
        },
        DmaDirection::Store(buffer) => {
          check_range(buffer_name(buffer), seg.src, seg.len, mem.capacity(buffer))?;
          check_range("external memory", seg.dst, seg.len, ext.size())?;
          if buffer == BufferId::Output && !mem.output.is_read_valid() {
            return Err(NpuError::NotReady("output buffer half"));
          }
        },
        DmaDirection::Copy => {
          check_range("external memory", seg.src, seg.len, ext.size())?;
          check_range("external memory", seg.dst, seg.len, ext.size())?;
        },
      }
    }

    log::debug!(
      "dma ch{} accept {:?} src={:#x} dst={:#x} len={}",
      desc.channel,
      desc.direction,
      desc.src_addr,
      desc.dst_addr,
      desc.length
    );
    self.channels[desc.channel].start(desc);
    Ok(())
  }

  /// Arm a transport error on the next data beat of `channel`
  pub fn inject_fault(&mut self, channel: usize) {
    if let Some(ch) = self.channels.get_mut(channel) {
      ch.fault_pending = true;
    }
  }

  /// Advance every channel by one cycle, lowest index first
  pub fn advance_cycle(&mut self, ext: &mut ExternalMemory, mem: &mut MemorySubsystem) -> Vec<DmaCompletion> {
    let (beat, burst) = (self.beat_bytes, self.max_burst);
    let completions: Vec<DmaCompletion> = self
      .channels
      .iter_mut()
      .filter_map(|ch| ch.advance(beat, burst, ext, mem))
      .collect();
    for c in &completions {
      match &c.error {
        Some(e) => log::warn!("dma ch{} failed after {} bytes: {}", c.channel, c.bytes, e),
        None => log::debug!("dma ch{} complete, {} bytes", c.channel, c.bytes),
      }
    }
    completions
  }

  pub fn bytes_moved(&self) -> u64 {
    self.channels.iter().map(|ch| ch.bytes_moved).sum()
  }

  /// Drop every in-flight transfer
  pub fn abort(&mut self) {
    for ch in self.channels.iter_mut() {
      ch.abort();
    }
  }

  pub fn reset(&mut self) {
    for ch in self.channels.iter_mut() {
      *ch = DmaChannel::new(ch.index);
    }
  }
}

fn buffer_name(buffer: BufferId) -> &'static str {
  match buffer {
    BufferId::Weight => "weight buffer",
    BufferId::Activation => "activation buffer",
    BufferId::Output => "output buffer",
  }
}
