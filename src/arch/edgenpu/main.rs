use serde::{Deserialize, Serialize};
use sim::models::model_trait::{DevsModel, Reportable, ReportableModel, SerializableModel};
use sim::models::{Model, ModelMessage, ModelRecord};
use sim::simulator::{Connector, Services, Simulation};
use sim::utils::errors::SimulationError;
use std::f64::INFINITY;

use super::npu::{Npu, RunReport};
use super::regs::PerfCounters;
use crate::trace_record;

/// Request from the host side, carried as JSON on the `host_cmd` port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum HostCommand {
  WriteReg { offset: u32, value: u32 },
  Push { word: u64 },
  Start,
  Abort,
  Reset,
}

/// Sent on the `irq` port once a run has ended and DMA drained
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
  pub report: RunReport,
  pub error: Option<String>,
  pub output: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct RunStart {
  perf: PerfCounters,
  cycle: u64,
  runs_completed: u64,
}

// ===========================================
// NPU model: one internal event per clock
// ===========================================

#[derive(Clone)]
pub struct NpuModel {
  host_cmd_port: String,
  irq_port: String,
  npu: Npu,
  output_len: usize,
  active: Option<RunStart>,
  until_next_event: f64,
  records: Vec<ModelRecord>,
}

impl NpuModel {
  pub fn new(host_cmd_port: String, irq_port: String, npu: Npu, output_len: usize) -> Self {
    Self {
      host_cmd_port,
      irq_port,
      npu,
      output_len,
      active: None,
      until_next_event: INFINITY,
      records: Vec::new(),
    }
  }

  fn apply(&mut self, cmd: HostCommand) {
    match cmd {
      HostCommand::WriteReg { offset, value } => self.npu.write_reg(offset, value),
      HostCommand::Push { word } => {
        if let Err(e) = self.npu.push_instruction(word) {
          log::warn!("instruction {:#018x} dropped: {}", word, e);
        }
      },
      HostCommand::Start => {
        self.active = Some(RunStart {
          perf: self.npu.perf(),
          cycle: self.npu.cycle(),
          runs_completed: self.npu.runs_completed(),
        });
        self.npu.start();
      },
      HostCommand::Abort => self.npu.abort(),
      HostCommand::Reset => self.npu.reset(),
    }
  }

  fn outcome(&self, start: RunStart) -> RunOutcome {
    let done = self.npu.runs_completed() > start.runs_completed;
    let report = self.npu.report_since(start.perf, self.npu.cycle() - start.cycle, done);
    let error = if done {
      None
    } else {
      self.npu.last_error().map(|e| e.to_string())
    };
    let output = self
      .npu
      .memory()
      .output
      .read(0, self.output_len)
      .map(|b| b.to_vec())
      .unwrap_or_default();
    RunOutcome { report, error, output }
  }
}

impl DevsModel for NpuModel {
  fn events_ext(&mut self, incoming_message: &ModelMessage, services: &mut Services) -> Result<(), SimulationError> {
    if incoming_message.port_name != self.host_cmd_port {
      return Ok(());
    }
    let cmd: HostCommand =
      serde_json::from_str(&incoming_message.content).map_err(|_| SimulationError::InvalidModelState)?;
    trace_record!(self, services, "host_cmd", &incoming_message.content);
    self.apply(cmd);
    // pulses land on the next clock edge
    self.until_next_event = 1.0;
    Ok(())
  }

  fn events_int(&mut self, services: &mut Services) -> Result<Vec<ModelMessage>, SimulationError> {
    let mut messages = Vec::new();
    let before = self.npu.state();
    self.npu.advance_cycle();
    let after = self.npu.state();
    if before != after {
      trace_record!(self, services, "state", format!("{:?} -> {:?}", before, after));
    }

    if self.npu.is_quiescent() {
      if let Some(start) = self.active.take() {
        let outcome = self.outcome(start);
        trace_record!(
          self,
          services,
          "run_end",
          format!("done={} cycles={}", outcome.report.done, outcome.report.cycles)
        );
        messages.push(ModelMessage {
          content: serde_json::to_string(&outcome).map_err(|_| SimulationError::InvalidModelState)?,
          port_name: self.irq_port.clone(),
        });
      }
      self.until_next_event = INFINITY;
    } else {
      self.until_next_event = 1.0;
    }
    Ok(messages)
  }

  fn time_advance(&mut self, time_delta: f64) {
    self.until_next_event -= time_delta;
  }

  fn until_next_event(&self) -> f64 {
    self.until_next_event
  }
}

impl Reportable for NpuModel {
  fn status(&self) -> String {
    format!("state={:?} cycle={}", self.npu.state(), self.npu.cycle())
  }

  fn records(&self) -> &Vec<ModelRecord> {
    &self.records
  }
}

impl ReportableModel for NpuModel {}

impl SerializableModel for NpuModel {
  fn get_type(&self) -> &'static str {
    "NpuModel"
  }
}

// ===========================================
// Host: collects run outcomes
// ===========================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostModel {
  irq_port: String,
  outcomes: Vec<RunOutcome>,
  records: Vec<ModelRecord>,
}

impl HostModel {
  pub fn new(irq_port: String) -> Self {
    Self {
      irq_port,
      outcomes: Vec::new(),
      records: Vec::new(),
    }
  }
}

impl DevsModel for HostModel {
  fn events_ext(&mut self, incoming_message: &ModelMessage, services: &mut Services) -> Result<(), SimulationError> {
    if incoming_message.port_name == self.irq_port {
      let outcome: RunOutcome =
        serde_json::from_str(&incoming_message.content).map_err(|_| SimulationError::InvalidModelState)?;
      trace_record!(
        self,
        services,
        "irq",
        format!("done={} error_code={}", outcome.report.done, outcome.report.error_code)
      );
      self.outcomes.push(outcome);
    }
    Ok(())
  }

  fn events_int(&mut self, _services: &mut Services) -> Result<Vec<ModelMessage>, SimulationError> {
    Ok(Vec::new())
  }

  fn time_advance(&mut self, _time_delta: f64) {}

  fn until_next_event(&self) -> f64 {
    INFINITY
  }
}

impl Reportable for HostModel {
  fn status(&self) -> String {
    format!("runs={}", self.outcomes.len())
  }

  fn records(&self) -> &Vec<ModelRecord> {
    &self.records
  }
}

impl ReportableModel for HostModel {}

impl SerializableModel for HostModel {
  fn get_type(&self) -> &'static str {
    "HostModel"
  }
}

/// Two-model topology: `npu` raises run outcomes to `host`
pub fn create_simulation(npu: Npu, output_len: usize) -> Simulation {
  let models = vec![
    Model::new(
      String::from("npu"),
      Box::new(NpuModel::new(
        String::from("host_cmd"),
        String::from("irq"),
        npu,
        output_len,
      )),
    ),
    Model::new(String::from("host"), Box::new(HostModel::new(String::from("irq")))),
  ];

  let connectors = vec![Connector::new(
    String::from("npu_host_irq"),
    String::from("npu"),
    String::from("host"),
    String::from("irq"),
    String::from("irq"),
  )];

  Simulation::post(models, connectors)
}
