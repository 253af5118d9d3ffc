/// Global logging configuration
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

static ENABLE_LOG: AtomicBool = AtomicBool::new(true);
static INIT: Once = Once::new();

/// Set logging enabled
pub fn set_log(enabled: bool) {
  ENABLE_LOG.store(enabled, Ordering::Relaxed);
}

/// Check if logging is enabled, default is true
pub fn is_log_enabled() -> bool {
  ENABLE_LOG.load(Ordering::Relaxed)
}

/// Install the env_logger backend once per process. `RUST_LOG` wins over
/// `level`; quiet mode caps output at warnings.
pub fn init_log(level: ::log::LevelFilter, quiet: bool) {
  set_log(!quiet);
  let level = if quiet { level.min(::log::LevelFilter::Warn) } else { level };
  INIT.call_once(|| {
    let _ = env_logger::Builder::new()
      .filter_level(level)
      .parse_default_env()
      .format_timestamp(None)
      .try_init();
  });
}

/// Print a log message with blue [Log] prefix
#[macro_export]
macro_rules! log_info {
  ($($arg:tt)*) => {
    if $crate::simulator::utils::log::is_log_enabled() {
      println!("\x1b[34m[Log]\x1b[0m {}", format!($($arg)*));
    }
  };
}
