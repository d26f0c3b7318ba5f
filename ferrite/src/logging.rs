//! Process logging built on `slog`. Components accept an optional parent
//! logger and derive a child with their own context; components built
//! without one stay silent.

use sloggers::Config;

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

const LEVELS: &[&str] = &["trace", "debug", "info", "warning", "error", "critical"];

/// Builds the process root logger. The level is taken from the
/// `FERRITE_LOG_LEVEL` environment variable and falls back to `info` when
/// unset or unrecognized.
pub fn init(name: &str) -> Logger {
    let level = std::env::var("FERRITE_LOG_LEVEL")
        .ok()
        .filter(|level| LEVELS.contains(&level.as_str()))
        .unwrap_or_else(|| "info".to_string());

    let toml = format!(
        "type = \"terminal\"\nlevel = \"{}\"\ndestination = \"stderr\"\n",
        level
    );

    let config: sloggers::LoggerConfig =
        serdeconv::from_toml_str(&toml).expect("logger config must parse");
    let logger = config.build_logger().expect("logger must build");

    logger.new(o!("name" => name.to_string()))
}

/// Derives a component logger from an optional parent.
pub(crate) fn child<'a, L>(log: L, module: &'static str) -> Logger
where
    L: Into<Option<&'a Logger>>,
{
    match log.into() {
        Some(log) => log.new(o!("module" => module)),
        None => Logger::root(Discard, o!()),
    }
}
