use log::LevelFilter;
use sim::models::model_trait::DevsModel;
use sim::simulator::{Message, Simulation};
use std::f64::INFINITY;
use std::fs::File;
use std::io::{self, BufWriter, Result, Write};

/// Nothing scheduled and no message in flight
pub fn is_quiescent(simulation: &mut Simulation) -> bool {
  next_event(simulation) == INFINITY && simulation.get_messages().is_empty()
}

fn next_event(simulation: &mut Simulation) -> f64 {
  simulation
    .models()
    .iter()
    .fold(INFINITY, |min, model| f64::min(min, model.until_next_event()))
}

fn trace_messages(messages: &[Message], trace_writer: &mut Option<BufWriter<File>>) -> Result<()> {
  if log::max_level() >= LevelFilter::Debug {
    for msg in messages {
      log::debug!(
        "[MSG] t={:.1} {}:{} -> {}:{} | {}",
        msg.time(),
        msg.source_id(),
        msg.source_port(),
        msg.target_id(),
        msg.target_port(),
        msg.content()
      );
    }
  }

  if let Some(writer) = trace_writer {
    for msg in messages {
      let trace_entry = serde_json::json!({
        "time": msg.time(),
        "source": msg.source_id(),
        "source_port": msg.source_port(),
        "target": msg.target_id(),
        "target_port": msg.target_port(),
        "content": msg.content()
      });
      writeln!(writer, "{}", trace_entry)?;
    }
    writer.flush()?;
  }
  Ok(())
}

/// Advance the simulation by one time unit: every zero-delay event at the
/// current time, then the step that moves the clock. Returns the messages
/// the models emitted along the way.
pub fn model_step(simulation: &mut Simulation, trace_writer: &mut Option<BufWriter<File>>) -> Result<Vec<Message>> {
  let mut emitted = Vec::new();
  let time0 = simulation.get_global_time();

  loop {
    if is_quiescent(simulation) {
      break;
    }
    let messages = simulation
      .step()
      .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("Simulation error: {:?}", e)))?;
    trace_messages(&messages, trace_writer)?;
    emitted.extend(messages);

    if simulation.get_global_time() > time0 {
      break;
    }
  }

  Ok(emitted)
}
