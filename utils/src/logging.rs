// Logging setup
//
// Lines are printed as `[millis]<level> file:line - message`. The
// level filter comes from RUST_LOG and defaults to info.
use crate::timing::get_current_millis;
use std::io::Write;

/// Install the global logger
///
/// Safe to call more than once, later calls are ignored. Tests rely on
/// this since every test may try to initialize logging.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{:?}]<{}> {}:{} - {}",
                get_current_millis(),
                record.level().as_str().to_lowercase(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .try_init();
}

/// Install the logger for tests, capturing output per test
pub fn init_for_tests() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}
