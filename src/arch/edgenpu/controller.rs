//! Top-level sequencing FSM.
//!
//! The controller is a pure function of the current state and the inputs
//! sampled this cycle. It never touches the datapath itself; the owning
//! [`Npu`](super::npu::Npu) executes the work selected by
//! [`signals`] and reports progress back through [`ControlInputs`].

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NpuState {
  Idle,
  Fetch,
  Decode,
  LoadWeight,
  LoadAct,
  Compute,
  Accumulate,
  Pool,
  Activate,
  Store,
  Done,
  Error,
}

impl NpuState {
  /// Encoding reported in STATUS[7:4]
  pub fn code(self) -> u32 {
    match self {
      NpuState::Idle => 0,
      NpuState::Fetch => 1,
      NpuState::Decode => 2,
      NpuState::LoadWeight => 3,
      NpuState::LoadAct => 4,
      NpuState::Compute => 5,
      NpuState::Accumulate => 6,
      NpuState::Pool => 7,
      NpuState::Activate => 8,
      NpuState::Store => 9,
      NpuState::Done => 10,
      NpuState::Error => 11,
    }
  }

  /// States that belong to the execution of one fetched instruction
  pub fn is_executing(self) -> bool {
    !matches!(self, NpuState::Idle | NpuState::Fetch | NpuState::Done | NpuState::Error)
  }
}

/// How the decoded instruction travels through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
  Nop,
  Halt,
  ClearAcc,
  WaitDma,
  WaitPe,
  Irq,
  /// Weight load only
  LoadWeight,
  /// Systolic array pass over `vectors` activation vectors
  Array {
    load_weights: bool,
    accumulate: bool,
    vectors: usize,
  },
  Pool,
  Vector,
  DmaLoad,
  DmaStore,
  Drain,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlInputs {
  pub enable: bool,
  pub start: bool,
  pub abort: bool,
  pub fifo_empty: bool,
  /// Plan of the instruction in flight, set from DECODE onwards
  pub plan: Option<Plan>,
  /// The fetched word failed to decode or cannot be executed
  pub decode_error: bool,
  /// The datapath finished the work of the current state this cycle
  pub phase_done: bool,
  pub dma_idle: bool,
  /// The datapath hit a fatal error in the current state
  pub fault: bool,
}

/// Enables asserted by the controller for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSignals {
  pub fetch: bool,
  pub clear_acc: bool,
  pub weight_load: bool,
  pub act_load: bool,
  pub dma_start: bool,
  pub pe_enable: bool,
  pub acc_drain: bool,
  pub pool_enable: bool,
  pub act_enable: bool,
  pub store_enable: bool,
  pub irq: bool,
  pub done: bool,
  pub fault: bool,
}

/// Signals asserted while sitting in `state`
pub fn signals(state: NpuState, inputs: &ControlInputs) -> ControlSignals {
  let mut s = ControlSignals::default();
  if inputs.abort {
    return s;
  }
  match state {
    NpuState::Idle => {},
    NpuState::Fetch => s.fetch = !inputs.fifo_empty,
    NpuState::Decode => match inputs.plan {
      Some(Plan::ClearAcc) => s.clear_acc = true,
      Some(Plan::Array { accumulate, .. }) => s.clear_acc = !accumulate,
      Some(Plan::Irq) => s.irq = true,
      _ => {},
    },
    NpuState::LoadWeight => s.weight_load = true,
    NpuState::LoadAct => match inputs.plan {
      Some(Plan::DmaLoad) => s.dma_start = true,
      Some(Plan::LoadWeight) => {},
      _ => s.act_load = true,
    },
    NpuState::Compute => {
      s.pe_enable = matches!(inputs.plan, Some(Plan::Array { vectors, .. }) if vectors > 0);
    },
    NpuState::Accumulate => s.acc_drain = matches!(inputs.plan, Some(Plan::Array { .. })),
    NpuState::Pool => s.pool_enable = true,
    NpuState::Activate => s.act_enable = true,
    NpuState::Store => match inputs.plan {
      Some(Plan::DmaStore) => s.dma_start = true,
      _ => s.store_enable = true,
    },
    NpuState::Done => s.done = true,
    NpuState::Error => s.fault = true,
  }
  s
}

/// Next state and the signals of the current state
pub fn transition(state: NpuState, inputs: &ControlInputs) -> (NpuState, ControlSignals) {
  let out = signals(state, inputs);
  if inputs.abort {
    return (NpuState::Idle, out);
  }
  if state.is_executing() && inputs.fault {
    return (NpuState::Error, out);
  }

  let stay_unless = |done: bool, next: NpuState| if done { next } else { state };
  let next = match state {
    NpuState::Idle => stay_unless(inputs.start && inputs.enable, NpuState::Fetch),
    NpuState::Fetch => stay_unless(!inputs.fifo_empty, NpuState::Decode),
    NpuState::Decode => {
      if inputs.decode_error {
        NpuState::Error
      } else {
        match inputs.plan {
          None => NpuState::Error,
          Some(Plan::Nop | Plan::WaitPe | Plan::Irq | Plan::ClearAcc) => NpuState::Fetch,
          Some(Plan::WaitDma) => stay_unless(inputs.dma_idle, NpuState::Fetch),
          Some(Plan::Halt) => NpuState::Done,
          Some(Plan::LoadWeight) | Some(Plan::Array { load_weights: true, .. }) => NpuState::LoadWeight,
          Some(Plan::Array { .. } | Plan::Pool | Plan::Vector | Plan::DmaLoad) => NpuState::LoadAct,
          Some(Plan::DmaStore | Plan::Drain) => NpuState::Store,
        }
      }
    },
    NpuState::LoadWeight => stay_unless(inputs.phase_done, NpuState::LoadAct),
    NpuState::LoadAct => {
      let next = match inputs.plan {
        Some(Plan::Array { .. } | Plan::Pool) => NpuState::Compute,
        Some(Plan::Vector) => NpuState::Activate,
        _ => NpuState::Fetch,
      };
      stay_unless(inputs.phase_done, next)
    },
    NpuState::Compute => stay_unless(inputs.phase_done, NpuState::Accumulate),
    NpuState::Accumulate => {
      let next = match inputs.plan {
        Some(Plan::Pool) => NpuState::Pool,
        _ => NpuState::Activate,
      };
      stay_unless(inputs.phase_done, next)
    },
    NpuState::Pool | NpuState::Activate => NpuState::Store,
    NpuState::Store => stay_unless(inputs.phase_done, NpuState::Fetch),
    NpuState::Done | NpuState::Error => NpuState::Idle,
  };
  (next, out)
}
