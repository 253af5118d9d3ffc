use sim::simulator::{Message, Simulation};

use crate::arch::edgenpu::HostCommand;

/// Inject a message into the named model at the current global time
///
/// `source_id` defaults to "host", both ports to "default".
pub fn inject_message(
  simulation: &mut Simulation,
  target_model: &str,
  source_id: Option<&str>,
  source_port: Option<&str>,
  target_port: Option<&str>,
  content: &str,
) {
  let msg = Message::new(
    source_id.unwrap_or("host").to_string(),
    source_port.unwrap_or("default").to_string(),
    target_model.to_string(),
    target_port.unwrap_or("default").to_string(),
    simulation.get_global_time(),
    content.to_string(),
  );
  simulation.inject_input(msg);
}

/// Send a host command to the `npu` model's `host_cmd` port
pub fn inject_host_command(simulation: &mut Simulation, cmd: &HostCommand) -> serde_json::Result<()> {
  let content = serde_json::to_string(cmd)?;
  inject_message(simulation, "npu", Some("host"), Some("host_cmd"), Some("host_cmd"), &content);
  Ok(())
}
