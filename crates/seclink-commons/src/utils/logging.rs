use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize the process-wide logger. Safe to call more than once; only the
/// first call takes effect. Binaries call this at startup, tests may call it
/// to see log output with `RUST_LOG`.
pub fn init() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_millis()
            .init();
    });
}
