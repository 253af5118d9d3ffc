//! Memory-mapped register file.
//!
//! Host writes land through [`RegisterFile::host_write`], which only touches
//! control and configuration registers. Status, error code and performance
//! counters are written by the controller path alone.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::params::{NpuParams, HW_VERSION};

pub mod offset {
  pub const CTRL: u32 = 0x000;
  pub const STATUS: u32 = 0x004;
  pub const IRQ_EN: u32 = 0x008;
  pub const IRQ_STATUS: u32 = 0x00C;
  pub const VERSION: u32 = 0x010;
  pub const CONFIG: u32 = 0x014;
  pub const ERROR_CODE: u32 = 0x018;

  pub const WEIGHT_BASE: u32 = 0x200;
  pub const ACT_IN_BASE: u32 = 0x300;
  pub const ACT_OUT_BASE: u32 = 0x308;

  pub const DMA_SRC_STRIDE: u32 = 0x414;
  pub const DMA_DST_STRIDE: u32 = 0x418;

  pub const PERF_CYCLES_LO: u32 = 0x604;
  pub const PERF_CYCLES_HI: u32 = 0x608;
  pub const PERF_INST_CNT: u32 = 0x60C;
  pub const PERF_MAC_LO: u32 = 0x610;
  pub const PERF_MAC_HI: u32 = 0x614;
  pub const PERF_STALL_CNT: u32 = 0x618;
  pub const PERF_DMA_CNT: u32 = 0x61C;

  pub const LAYER_IN_CH: u32 = 0x704;
  pub const LAYER_OUT_CH: u32 = 0x708;
  pub const LAYER_IN_H: u32 = 0x70C;
  pub const LAYER_IN_W: u32 = 0x710;
  pub const LAYER_QUANT_SCALE: u32 = 0x730;
  pub const LAYER_QUANT_ZERO: u32 = 0x734;
  pub const LAYER_QUANT_SHIFT: u32 = 0x738;
  pub const LAYER_QUANT_CTRL: u32 = 0x73C;
  pub const LAYER_BIAS_BASE: u32 = 0x740;
}

pub mod ctrl {
  pub const ENABLE: u32 = 1 << 0;
  pub const START: u32 = 1 << 1;
  pub const RESET: u32 = 1 << 2;
  pub const ABORT: u32 = 1 << 3;
  pub const SINGLE_STEP: u32 = 1 << 4;
  pub const DEBUG_EN: u32 = 1 << 5;
}

pub mod status {
  pub const BUSY: u32 = 1 << 0;
  pub const DONE: u32 = 1 << 1;
  pub const ERROR: u32 = 1 << 2;
  pub const IDLE: u32 = 1 << 3;
  pub const STATE_SHIFT: u32 = 4;
  pub const STATE_MASK: u32 = 0xF << STATE_SHIFT;
}

pub mod irq {
  pub const DONE: u32 = 1 << 0;
  pub const ERROR: u32 = 1 << 1;
  pub const DMA_DONE: u32 = 1 << 2;
  pub const DMA_ERROR: u32 = 1 << 3;
}

/// Bit 0 of QUANT_CTRL selects saturation
pub const QUANT_CTRL_SATURATE: u32 = 1 << 0;

const CONFIG_REGS: &[u32] = &[
  offset::WEIGHT_BASE,
  offset::ACT_IN_BASE,
  offset::ACT_OUT_BASE,
  offset::DMA_SRC_STRIDE,
  offset::DMA_DST_STRIDE,
  offset::LAYER_IN_CH,
  offset::LAYER_OUT_CH,
  offset::LAYER_IN_H,
  offset::LAYER_IN_W,
  offset::LAYER_QUANT_SCALE,
  offset::LAYER_QUANT_ZERO,
  offset::LAYER_QUANT_SHIFT,
  offset::LAYER_QUANT_CTRL,
  offset::LAYER_BIAS_BASE,
];

/// Snapshot of the layer configuration as the datapath sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerConfig {
  pub in_ch: usize,
  pub out_ch: usize,
  pub in_h: usize,
  pub in_w: usize,
  pub quant_scale: i32,
  pub quant_zero: i32,
  pub quant_shift: u32,
  pub saturate: bool,
  pub bias_base: usize,
  pub weight_base: usize,
  pub act_in_base: usize,
  pub act_out_base: usize,
  pub dma_src_stride: u32,
  pub dma_dst_stride: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfCounters {
  pub cycles: u64,
  pub instructions: u64,
  pub mac_ops: u64,
  pub stall_cycles: u64,
  pub dma_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct RegisterFile {
  ctrl: u32,
  status: u32,
  irq_en: u32,
  irq_status: u32,
  config: u32,
  error_code: u32,
  plain: BTreeMap<u32, u32>,
  pub perf: PerfCounters,
}

impl RegisterFile {
  pub fn new(params: &NpuParams) -> Self {
    let mut plain: BTreeMap<u32, u32> = CONFIG_REGS.iter().map(|&reg| (reg, 0)).collect();
    plain.insert(offset::LAYER_QUANT_SCALE, 1 << 16);
    plain.insert(offset::LAYER_QUANT_CTRL, QUANT_CTRL_SATURATE);
    Self {
      ctrl: 0,
      status: status::IDLE,
      irq_en: 0,
      irq_status: 0,
      config: params.config_word(),
      error_code: 0,
      plain,
      perf: PerfCounters::default(),
    }
  }

  pub fn read(&self, reg: u32) -> u32 {
    match reg {
      offset::CTRL => self.ctrl,
      offset::STATUS => self.status,
      offset::IRQ_EN => self.irq_en,
      offset::IRQ_STATUS => self.irq_status,
      offset::VERSION => HW_VERSION,
      offset::CONFIG => self.config,
      offset::ERROR_CODE => self.error_code,
      offset::PERF_CYCLES_LO => self.perf.cycles as u32,
      offset::PERF_CYCLES_HI => (self.perf.cycles >> 32) as u32,
      offset::PERF_INST_CNT => self.perf.instructions as u32,
      offset::PERF_MAC_LO => self.perf.mac_ops as u32,
      offset::PERF_MAC_HI => (self.perf.mac_ops >> 32) as u32,
      offset::PERF_STALL_CNT => self.perf.stall_cycles as u32,
      offset::PERF_DMA_CNT => self.perf.dma_bytes as u32,
      other => self.plain.get(&other).copied().unwrap_or(0),
    }
  }

  /// Host side write. Read-only registers ignore the access.
  pub fn host_write(&mut self, reg: u32, value: u32) {
    match reg {
      offset::CTRL => self.ctrl = value,
      offset::IRQ_EN => self.irq_en = value,
      offset::IRQ_STATUS => self.irq_status &= !value,
      other => {
        if let Some(slot) = self.plain.get_mut(&other) {
          *slot = value;
        } else {
          log::debug!("write to read-only or unmapped register {:#05x} ignored", other);
        }
      },
    }
  }

  pub fn ctrl(&self) -> u32 {
    self.ctrl
  }

  pub fn ctrl_set(&self, bit: u32) -> bool {
    self.ctrl & bit != 0
  }

  /// START, RESET and ABORT self-clear once sampled
  pub fn take_pulses(&mut self) -> u32 {
    let pulses = self.ctrl & (ctrl::START | ctrl::RESET | ctrl::ABORT);
    self.ctrl &= !pulses;
    pulses
  }

  pub fn status(&self) -> u32 {
    self.status
  }

  /// Controller path status update; DONE and ERROR are sticky until the next START
  pub fn set_status(&mut self, state_code: u32, busy: bool) {
    let sticky = self.status & (status::DONE | status::ERROR);
    let mut value = sticky | ((state_code << status::STATE_SHIFT) & status::STATE_MASK);
    value |= if busy { status::BUSY } else { status::IDLE };
    self.status = value;
  }

  pub fn mark_done(&mut self) {
    self.status |= status::DONE;
  }

  pub fn clear_sticky(&mut self) {
    self.status &= !(status::DONE | status::ERROR);
  }

  pub fn latch_error(&mut self, code: u32) {
    self.error_code = code;
    self.status |= status::ERROR;
  }

  pub fn error_code(&self) -> u32 {
    self.error_code
  }

  pub fn raise_irq(&mut self, bits: u32) {
    self.irq_status |= bits;
  }

  pub fn irq_status(&self) -> u32 {
    self.irq_status
  }

  /// Interrupt line towards the host
  pub fn irq_pending(&self) -> bool {
    self.irq_status & self.irq_en != 0
  }

  pub fn layer(&self) -> LayerConfig {
    let reg = |r: u32| self.read(r);
    LayerConfig {
      in_ch: reg(offset::LAYER_IN_CH) as usize,
      out_ch: reg(offset::LAYER_OUT_CH) as usize,
      in_h: reg(offset::LAYER_IN_H) as usize,
      in_w: reg(offset::LAYER_IN_W) as usize,
      quant_scale: reg(offset::LAYER_QUANT_SCALE) as i32,
      quant_zero: reg(offset::LAYER_QUANT_ZERO) as i32,
      quant_shift: reg(offset::LAYER_QUANT_SHIFT),
      saturate: reg(offset::LAYER_QUANT_CTRL) & QUANT_CTRL_SATURATE != 0,
      bias_base: reg(offset::LAYER_BIAS_BASE) as usize,
      weight_base: reg(offset::WEIGHT_BASE) as usize,
      act_in_base: reg(offset::ACT_IN_BASE) as usize,
      act_out_base: reg(offset::ACT_OUT_BASE) as usize,
      dma_src_stride: reg(offset::DMA_SRC_STRIDE),
      dma_dst_stride: reg(offset::DMA_DST_STRIDE),
    }
  }

  /// Power-on values, except the interrupt enables the host programmed
  pub fn reset(&mut self) {
    let irq_en = self.irq_en;
    let config = self.config;
    *self = Self {
      config,
      ..Self::new(&NpuParams::default())
    };
    self.irq_en = irq_en;
  }
}
