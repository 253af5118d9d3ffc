/// Append a trace entry to an NPU-side model and echo it at trace level
///
/// Entries are stamped with the simulation clock, so the host and NPU
/// models interleave by cycle in `print_simulation_records`.
/// ```ignore
/// trace_record!(self, services, "state", format!("{:?} -> {:?}", before, after));
/// ```
#[macro_export]
macro_rules! trace_record {
  ($model:expr, $services:expr, $action:expr, $subject:expr) => {{
    let record = ::sim::models::ModelRecord {
      time: $services.global_time(),
      action: $action.to_string(),
      subject: $subject.to_string(),
    };
    log::trace!("t={} {}: {}", record.time, record.action, record.subject);
    $model.records.push(record);
  }};
}
