use sim::models::{Model, Reportable};
use sim::simulator::Simulation;

use crate::arch::edgenpu::RunReport;

pub fn print_simulation_records(simulation: &mut Simulation) {
  println!("\n--- Simulation Records ---");

  for model in simulation.models().iter() {
    print_model_records(model);
  }

  println!("--- End Records ---\n");
}

fn print_model_records(model: &Model) {
  let records = model.records();
  if !records.is_empty() {
    println!("\n[{}] {}", model.id(), model.status());
    for record in records {
      println!("  Time {:.1}: {} {}", record.time, record.action, record.subject);
    }
  }
}

pub fn format_run_report(report: &RunReport) -> String {
  let utilization = if report.cycles == 0 {
    0.0
  } else {
    100.0 * (report.cycles - report.stall_cycles.min(report.cycles)) as f64 / report.cycles as f64
  };
  format!(
    "state={:?} done={} cycles={} instructions={} macs={} stalls={} dma_bytes={} busy={:.1}% error_code={}",
    report.final_state,
    report.done,
    report.cycles,
    report.instructions,
    report.mac_ops,
    report.stall_cycles,
    report.dma_bytes,
    utilization,
    report.error_code
  )
}
