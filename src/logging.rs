// Logging initialization driven by the config file's log_mode.
//
// The crate logs through the `log` facade; the host binary installs
// env_logger once at startup. `screen` sends lines to stdout, every other
// mode to stderr. RUST_LOG, when set, wins over the config so operators
// can raise verbosity without editing the deployment file.

use crate::config::LogMode;

/// Install the global logger for the given mode. Calling it a second time
/// is a no-op (the first installation wins).
pub fn init(mode: LogMode) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(mode.level_filter());
    if mode.to_stdout() {
        builder.target(env_logger::Target::Stdout);
    }
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    let _ = builder.try_init();
}
