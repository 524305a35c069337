use std::sync::Once;

static INIT: Once = Once::new();

/// Logs go to stderr; stdout carries the protocol.
pub fn init_logging(level: log::LevelFilter) {
    INIT.call_once(|| {
        env_logger::Builder::from_default_env()
            .filter_level(level)
            .filter_module("rusqlite", log::LevelFilter::Warn)
            .target(env_logger::Target::Stderr)
            .format_timestamp_millis()
            .format_module_path(false)
            .init();

        log::info!("event=logging_init module=logging status=ok level={}", level);
    });
}
