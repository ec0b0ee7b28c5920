use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;

use crate::verbosity::Verbosity;

/// Initialize `env_logger`.
///
/// `RUST_LOG` takes precedence when set. Otherwise dependencies log warnings
/// and our own crates log at the level chosen with `-v`/`-q`.
pub(crate) fn init_logging(verbose: &Verbosity) {
    let env = Env::default().filter_or("RUST_LOG", "warn");
    let mut builder = Builder::from_env(env);
    builder.format_module_path(false).format_target(false);

    if std::env::var("RUST_LOG").is_err() {
        let level = verbose.log_level_filter();
        builder
            .filter_level(LevelFilter::Warn)
            .filter_module("gambit", level)
            .filter_module("gambit_lib", level);
    }

    builder.format(|buf, record| {
        let timestamp = buf.timestamp_seconds();
        writeln!(buf, "{timestamp} [{}] {}", record.level(), record.args())
    });
    builder.init();
}
