//! Top-level accelerator model.
//!
//! `advance_cycle` runs the blocks in a fixed order every cycle:
//! DMA channels, controller plus the datapath work its signals enable,
//! buffer commit, then status, interrupts and counters.

use serde::{Deserialize, Serialize};

use super::accumulator::{AccumulationBank, AccumulatorQuantizer};
use super::bank::WritePort;
use super::controller::{self, ControlInputs, ControlSignals, NpuState, Plan};
use super::decoder::{decode, Operation};
use super::dma::{DmaCompletion, DmaDescriptor, DmaEngine, ExternalMemory};
use super::error::{NpuError, Result};
use super::exec::{DmaProgress, Exec};
use super::isa::Flags;
use super::memory::{BufferId, MemorySubsystem};
use super::model_format::ModelImage;
use super::params::NpuParams;
use super::regs::{ctrl, irq, offset, PerfCounters, RegisterFile};
use super::systolic_array::SystolicArray;

/// Outcome of one datapath phase
#[derive(Debug, Default)]
struct Phase {
  done: bool,
  stalled: bool,
  fault: Option<NpuError>,
}

impl Phase {
  fn done() -> Self {
    Self {
      done: true,
      ..Self::default()
    }
  }

  fn busy() -> Self {
    Self::default()
  }

  fn stall() -> Self {
    Self {
      stalled: true,
      ..Self::default()
    }
  }

  fn from_result(result: Result<bool>) -> Self {
    match result {
      Ok(done) => Self {
        done,
        ..Self::default()
      },
      Err(e) => Self {
        fault: Some(e),
        ..Self::default()
      },
    }
  }
}

/// Summary of a host-driven run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
  pub cycles: u64,
  pub instructions: u64,
  pub mac_ops: u64,
  pub stall_cycles: u64,
  pub dma_bytes: u64,
  pub final_state: NpuState,
  pub done: bool,
  pub error_code: u32,
}

#[derive(Debug, Clone)]
pub struct Npu {
  params: NpuParams,
  state: NpuState,
  regs: RegisterFile,
  mem: MemorySubsystem,
  ext: ExternalMemory,
  dma: DmaEngine,
  array: SystolicArray,
  quantizer: AccumulatorQuantizer,
  acc_bank: AccumulationBank,
  fetched: Option<u64>,
  exec: Option<Exec>,
  pending_error: Option<NpuError>,
  last_error: Option<NpuError>,
  last_signals: ControlSignals,
  completions: Vec<DmaCompletion>,
  runs_completed: u64,
  cycle: u64,
}

impl Default for Npu {
  fn default() -> Self {
    Self::new(NpuParams::default())
  }
}

impl Npu {
  pub fn new(params: NpuParams) -> Self {
    Self {
      state: NpuState::Idle,
      regs: RegisterFile::new(&params),
      mem: MemorySubsystem::new(&params),
      ext: ExternalMemory::new(params.ext_mem_bytes),
      dma: DmaEngine::new(&params),
      array: SystolicArray::new(params.pe_rows, params.pe_cols),
      quantizer: AccumulatorQuantizer::new(params.pe_cols),
      acc_bank: AccumulationBank::new(),
      fetched: None,
      exec: None,
      pending_error: None,
      last_error: None,
      last_signals: ControlSignals::default(),
      completions: Vec::new(),
      runs_completed: 0,
      cycle: 0,
      params,
    }
  }

  // ===========================================
  // Host interface
  // ===========================================

  pub fn params(&self) -> &NpuParams {
    &self.params
  }

  pub fn state(&self) -> NpuState {
    self.state
  }

  pub fn cycle(&self) -> u64 {
    self.cycle
  }

  pub fn read_reg(&self, reg: u32) -> u32 {
    self.regs.read(reg)
  }

  pub fn write_reg(&mut self, reg: u32, value: u32) {
    self.regs.host_write(reg, value);
  }

  pub fn regs(&self) -> &RegisterFile {
    &self.regs
  }

  pub fn perf(&self) -> PerfCounters {
    self.regs.perf
  }

  pub fn memory(&self) -> &MemorySubsystem {
    &self.mem
  }

  /// Direct buffer access for preloading; bypasses the cycle model
  pub fn memory_mut(&mut self) -> &mut MemorySubsystem {
    &mut self.mem
  }

  pub fn ext_mem(&self) -> &ExternalMemory {
    &self.ext
  }

  pub fn ext_mem_mut(&mut self) -> &mut ExternalMemory {
    &mut self.ext
  }

  pub fn dma(&self) -> &DmaEngine {
    &self.dma
  }

  pub fn array(&self) -> &SystolicArray {
    &self.array
  }

  pub fn last_signals(&self) -> ControlSignals {
    self.last_signals
  }

  pub fn last_error(&self) -> Option<&NpuError> {
    self.last_error.as_ref()
  }

  /// Number of runs that reached DONE
  pub fn runs_completed(&self) -> u64 {
    self.runs_completed
  }

  pub fn irq_pending(&self) -> bool {
    self.regs.irq_pending()
  }

  pub fn push_instruction(&mut self, word: u64) -> Result<()> {
    self.mem.instructions.push(word)
  }

  pub fn load_program(&mut self, words: &[u64]) -> Result<()> {
    words.iter().try_for_each(|&w| self.push_instruction(w))
  }

  /// Queue the model's instructions, place its weights in external memory at
  /// `weight_ext_base` and fill the bias table.
  pub fn load_model(&mut self, model: &ModelImage, weight_ext_base: usize) -> Result<()> {
    self.ext.write(weight_ext_base, &model.weights)?;
    self.mem.load_bias(0, &model.bias)?;
    self.load_program(&model.instructions)?;
    log::info!(
      "model loaded: {} instructions, {} weight bytes at {:#x}, {} bias values",
      model.instructions.len(),
      model.weights.len(),
      weight_ext_base,
      model.bias.len()
    );
    Ok(())
  }

  pub fn submit_dma(&mut self, desc: DmaDescriptor) -> Result<()> {
    self.dma.submit(desc, &self.ext, &self.mem)
  }

  pub fn inject_dma_fault(&mut self, channel: usize) {
    self.dma.inject_fault(channel);
  }

  /// Set ENABLE and pulse START
  pub fn start(&mut self) {
    let value = self.regs.ctrl() | ctrl::ENABLE | ctrl::START;
    self.regs.host_write(offset::CTRL, value);
  }

  /// Pulse ABORT; applied at the start of the next cycle
  pub fn abort(&mut self) {
    let value = self.regs.ctrl() | ctrl::ABORT;
    self.regs.host_write(offset::CTRL, value);
  }

  /// Pulse RESET; applied at the start of the next cycle
  pub fn reset(&mut self) {
    let value = self.regs.ctrl() | ctrl::RESET;
    self.regs.host_write(offset::CTRL, value);
  }

  /// Start and clock until the run ends and DMA drains
  pub fn run(&mut self, max_cycles: u64) -> Result<RunReport> {
    let before = self.regs.perf;
    let done_before = self.runs_completed;
    self.start();
    let mut cycles = 0;
    loop {
      if cycles >= max_cycles {
        return Err(NpuError::Timeout { cycles });
      }
      self.advance_cycle();
      cycles += 1;
      if self.state == NpuState::Idle && self.dma.is_idle() {
        break;
      }
    }
    if let Some(err) = self.last_error.clone().filter(|_| self.runs_completed == done_before) {
      return Err(err);
    }
    Ok(self.report_since(before, cycles, self.runs_completed > done_before))
  }

  /// Counter deltas against a snapshot taken when the run began
  pub fn report_since(&self, before: PerfCounters, cycles: u64, done: bool) -> RunReport {
    let after = self.regs.perf;
    RunReport {
      cycles,
      instructions: after.instructions.saturating_sub(before.instructions),
      mac_ops: after.mac_ops.saturating_sub(before.mac_ops),
      stall_cycles: after.stall_cycles.saturating_sub(before.stall_cycles),
      dma_bytes: after.dma_bytes.saturating_sub(before.dma_bytes),
      final_state: self.state,
      done,
      error_code: self.regs.error_code(),
    }
  }

  /// Neither the controller nor any DMA channel has work left
  pub fn is_quiescent(&self) -> bool {
    self.state == NpuState::Idle && self.dma.is_idle()
  }

  /// Clock until the controller is idle and every DMA channel drained
  pub fn wait_idle(&mut self, max_cycles: u64) -> Result<u64> {
    for cycles in 0..max_cycles {
      if self.state == NpuState::Idle && self.dma.is_idle() {
        return Ok(cycles);
      }
      self.advance_cycle();
    }
    if self.state == NpuState::Idle && self.dma.is_idle() {
      return Ok(max_cycles);
    }
    Err(NpuError::Timeout { cycles: max_cycles })
  }

  // ===========================================
  // Cycle model
  // ===========================================

  pub fn advance_cycle(&mut self) {
    self.cycle += 1;
    let pulses = self.regs.take_pulses();
    if pulses & ctrl::RESET != 0 {
      self.hard_reset();
      return;
    }
    if pulses & ctrl::ABORT != 0 {
      self.abort_run();
    }
    let start = pulses & ctrl::START != 0;
    let enable = self.regs.ctrl_set(ctrl::ENABLE);
    if start && enable && self.state == NpuState::Idle {
      self.begin_run();
    }

    // DMA
    self.completions = self.dma.advance_cycle(&mut self.ext, &mut self.mem);
    for c in &self.completions {
      self.regs.perf.dma_bytes += c.bytes;
      if c.error.is_some() {
        self.regs.raise_irq(irq::DMA_ERROR);
      } else if c.irq {
        self.regs.raise_irq(irq::DMA_DONE);
      }
    }

    // Controller and datapath
    let single_step = self.regs.ctrl_set(ctrl::SINGLE_STEP);
    if !single_step || start || self.state == NpuState::Idle {
      self.step_controller(start, enable);
    } else {
      self.last_signals = ControlSignals::default();
    }

    self.mem.commit();

    self.regs.set_status(self.state.code(), self.state != NpuState::Idle);
    if self.state != NpuState::Idle {
      self.regs.perf.cycles += 1;
    }
  }

  fn begin_run(&mut self) {
    self.array.clear_acc();
    self.acc_bank.clear();
    self.regs.clear_sticky();
    self.last_error = None;
    log::debug!("run started at cycle {}", self.cycle);
  }

  fn abort_run(&mut self) {
    log::warn!("abort in state {:?} at cycle {}", self.state, self.cycle);
    self.state = NpuState::Idle;
    self.dma.abort();
    self.array.clear_acc();
    self.acc_bank.clear();
    self.mem.abort();
    self.fetched = None;
    self.exec = None;
    self.pending_error = None;
  }

  fn hard_reset(&mut self) {
    log::info!("reset at cycle {}", self.cycle);
    self.abort_run();
    self.dma.reset();
    self.array.reset();
    self.mem.reset();
    self.regs.reset();
    self.last_error = None;
    self.last_signals = ControlSignals::default();
  }

  fn step_controller(&mut self, start: bool, enable: bool) {
    let state = self.state;
    let mut decode_error = false;

    if state == NpuState::Decode && self.exec.is_none() {
      let layer = self.regs.layer();
      let planned = self
        .fetched
        .take()
        .ok_or(NpuError::NotReady("fetched instruction"))
        .and_then(decode)
        .and_then(|decoded| Exec::new(decoded, layer, &self.params));
      match planned {
        Ok(exec) => {
          log::debug!("decode {} ({})", exec.decoded.inst, exec.decoded.op.name());
          self.exec = Some(exec);
        },
        Err(e) => {
          self.pending_error = Some(e);
          decode_error = true;
        },
      }
    }

    let mut inputs = ControlInputs {
      enable,
      start,
      abort: false,
      fifo_empty: self.mem.instructions.is_empty(),
      plan: self.exec.as_ref().map(|e| e.plan),
      decode_error,
      phase_done: false,
      dma_idle: self.dma.is_idle(),
      fault: false,
    };
    let signals = controller::signals(state, &inputs);
    let phase = self.execute(state, &signals);

    if phase.stalled || (state == NpuState::Fetch && inputs.fifo_empty) {
      self.regs.perf.stall_cycles += 1;
    }
    inputs.phase_done = phase.done;
    if let Some(e) = phase.fault {
      self.pending_error = Some(e);
      inputs.fault = true;
    }

    let (next, _) = controller::transition(state, &inputs);
    if next != state {
      log::trace!("cycle {}: {:?} -> {:?}", self.cycle, state, next);
    }
    let retiring = state.is_executing() && matches!(next, NpuState::Fetch | NpuState::Done);
    if retiring {
      self.retire();
    }
    if next == NpuState::Error || next == NpuState::Idle {
      self.exec = None;
    }
    self.state = next;
    self.last_signals = signals;
  }

  fn retire(&mut self) {
    self.regs.perf.instructions += 1;
    if let Some(exec) = self.exec.take() {
      if exec.decoded.flags().contains(Flags::IRQ) {
        self.regs.raise_irq(irq::DONE);
      }
    }
  }

  /// Datapath work for the current state
  fn execute(&mut self, state: NpuState, s: &ControlSignals) -> Phase {
    match state {
      NpuState::Idle => Phase::busy(),
      NpuState::Fetch => {
        if s.fetch {
          self.fetched = self.mem.instructions.pop();
        }
        Phase::done()
      },
      NpuState::Decode => {
        if s.clear_acc {
          self.array.clear_acc();
          self.acc_bank.clear();
        }
        if s.irq {
          self.regs.raise_irq(irq::DONE);
        }
        Phase::done()
      },
      NpuState::LoadWeight => Phase::from_result(self.load_weight_row()),
      NpuState::LoadAct => {
        if s.dma_start {
          self.dma_phase()
        } else if s.act_load {
          Phase::from_result(self.stage_activations())
        } else {
          Phase::done()
        }
      },
      NpuState::Compute => {
        if s.pe_enable {
          self.compute_step()
        } else {
          Phase::done()
        }
      },
      NpuState::Accumulate => {
        if s.acc_drain {
          Phase::from_result(self.drain_vector())
        } else {
          Phase::done()
        }
      },
      NpuState::Pool => match self.exec.as_mut() {
        Some(exec) => Phase::from_result(exec.evaluate_pool().map(|_| true)),
        None => Phase::done(),
      },
      NpuState::Activate => match self.exec.as_mut() {
        Some(exec) => Phase::from_result(exec.evaluate_vector(&self.mem).map(|_| true)),
        None => Phase::done(),
      },
      NpuState::Store => {
        if s.dma_start {
          self.dma_phase()
        } else {
          self.store_results()
        }
      },
      NpuState::Done => {
        self.regs.mark_done();
        self.regs.raise_irq(irq::DONE);
        self.runs_completed += 1;
        log::info!(
          "run complete: {} instructions, {} MACs, {} busy cycles",
          self.regs.perf.instructions,
          self.regs.perf.mac_ops,
          self.regs.perf.cycles
        );
        Phase::done()
      },
      NpuState::Error => {
        let err = self
          .pending_error
          .take()
          .unwrap_or_else(|| NpuError::HardwareFault("unspecified fault".to_string()));
        log::error!("run faulted at cycle {}: {}", self.cycle, err);
        self.regs.latch_error(err.code());
        self.regs.raise_irq(irq::ERROR);
        self.last_error = Some(err);
        Phase::done()
      },
    }
  }

  fn load_weight_row(&mut self) -> Result<bool> {
    let cols = self.params.pe_cols;
    let Some(exec) = self.exec.as_mut() else {
      return Ok(true);
    };
    let row = exec.rows_loaded;
    let weights = self.mem.weight.read_i8(exec.weight_addr + row * cols, cols)?;
    self.array.load_weight(row, &weights)?;
    exec.rows_loaded += 1;
    Ok(exec.rows_loaded >= exec.weight_rows)
  }

  fn stage_activations(&mut self) -> Result<bool> {
    let Some(exec) = self.exec.as_mut() else {
      return Ok(true);
    };
    exec.stage(&self.mem, &self.params)?;
    if let Plan::Array { accumulate, vectors, .. } = exec.plan {
      self.acc_bank.prepare(vectors, self.params.pe_cols, accumulate)?;
    }
    Ok(true)
  }

  fn compute_step(&mut self) -> Phase {
    let (rows, cols) = (self.params.pe_rows, self.params.pe_cols);
    let Some(exec) = self.exec.as_mut() else {
      return Phase::done();
    };
    let count = exec.vectors.len();
    let feed = exec.vectors.get(exec.fed).map(|v| v.as_slice());
    if feed.is_some() {
      exec.fed += 1;
    }
    let macs_before = self.array.mac_ops();
    let step = exec.compute_cycles;
    let outputs = self.array.step(feed);
    for (col, out) in outputs.iter().enumerate() {
      // column `col` emits vector `step - rows - col`
      if let (Some(value), Some(vector)) = (out, step.checked_sub(rows + col)) {
        self.acc_bank.add(vector, col, *value);
      }
    }
    self.regs.perf.mac_ops += self.array.mac_ops() - macs_before;
    exec.compute_cycles += 1;
    if exec.compute_cycles >= count + rows + cols - 1 {
      Phase::done()
    } else {
      Phase::busy()
    }
  }

  fn drain_vector(&mut self) -> Result<bool> {
    let cols = self.params.pe_cols;
    let Some(exec) = self.exec.as_mut() else {
      return Ok(true);
    };
    if exec.drained >= self.acc_bank.len() {
      return Ok(true);
    }
    let flags = exec.decoded.flags();
    let layer = exec.layer;
    let lanes: Vec<Option<i32>> = match self.acc_bank.row(exec.drained) {
      Some(row) => row.iter().map(|&v| Some(v)).collect(),
      None => return Ok(true),
    };
    let bias = if flags.contains(Flags::BIAS) {
      Some(self.mem.bias(layer.bias_base, cols)?)
    } else {
      None
    };
    let shift = if flags.contains(Flags::QUANT) { layer.quant_shift } else { 0 };
    let bytes = self
      .quantizer
      .drain(&lanes, bias, shift, layer.saturate)
      .ok_or_else(|| NpuError::HardwareFault("accumulator lanes not valid".to_string()))?;
    let picked = exec.pick_lanes(exec.drained, &bytes);
    exec.results.extend(picked);
    exec.drained += 1;
    Ok(exec.drained >= self.acc_bank.len())
  }

  fn store_results(&mut self) -> Phase {
    let Some(exec) = self.exec.as_ref() else {
      return Phase::done();
    };
    if let Operation::Drain(d) = exec.decoded.op {
      if self.dma.is_writing(BufferId::Activation) || self.mem.activation.writer().is_some() {
        return Phase::stall();
      }
      let result = self
        .mem
        .output
        .read(0, d.len as usize)
        .map(|data| data.to_vec())
        .and_then(|data| self.mem.activation.write(WritePort::Controller, d.addr as usize, &data));
      return Phase::from_result(result.map(|_| true));
    }

    if self.dma.is_reading(BufferId::Output) {
      return Phase::stall();
    }
    let bytes: Vec<u8> = exec.results.iter().map(|&v| v as u8).collect();
    match self.mem.output.write(0, &bytes) {
      Ok(()) => {
        self.mem.output.swap();
        Phase::done()
      },
      Err(e) => Phase {
        fault: Some(e),
        ..Phase::default()
      },
    }
  }

  /// Issue the instruction's transfer, then wait for it unless ASYNC
  fn dma_phase(&mut self) -> Phase {
    let Some(exec) = self.exec.as_mut() else {
      return Phase::done();
    };
    match exec.dma {
      DmaProgress::Pending => {
        let desc = match exec.dma_descriptor() {
          Ok(Some(desc)) => desc,
          Ok(None) => return Phase::done(),
          Err(e) => {
            return Phase {
              fault: Some(e),
              ..Phase::default()
            }
          },
        };
        match self.dma.submit(desc, &self.ext, &self.mem) {
          Ok(()) => {
            if exec.decoded.flags().contains(Flags::ASYNC) {
              exec.dma = DmaProgress::Finished;
              Phase::done()
            } else {
              exec.dma = DmaProgress::Waiting(desc.channel);
              Phase::busy()
            }
          },
          Err(NpuError::DmaBusy(_)) => Phase::stall(),
          Err(e) => Phase {
            fault: Some(e),
            ..Phase::default()
          },
        }
      },
      DmaProgress::Waiting(channel) => match self.completions.iter().find(|c| c.channel == channel) {
        Some(c) => match &c.error {
          Some(e) => Phase {
            fault: Some(NpuError::HardwareFault(format!("awaited dma channel {} failed: {}", channel, e))),
            ..Phase::default()
          },
          None => {
            exec.dma = DmaProgress::Finished;
            Phase::done()
          },
        },
        None => Phase::stall(),
      },
      DmaProgress::Finished => Phase::done(),
    }
  }
}
