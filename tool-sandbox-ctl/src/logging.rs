use console::style;
use env_logger::{Builder, Env};
use log::{Level, LevelFilter};
use std::io::Write;

/// Target the library writes audit records to
const AUDIT_TARGET: &str = "audit";

/// Initialize logging. `verbose` raises diagnostics to debug; `audit`
/// prints every capability check regardless of level.
pub fn init_logger(verbose: bool, audit: bool) {
    let env = Env::default().filter_or("RUST_LOG", if verbose { "debug" } else { "warn" });

    let mut builder = Builder::from_env(env);
    builder
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => format!("{}", style("ERROR").red().bold()),
                Level::Warn => format!("{}", style("WARN ").yellow().bold()),
                Level::Info => format!("{}", style("INFO ").green()),
                Level::Debug => format!("{}", style("DEBUG").cyan()),
                Level::Trace => format!("{}", style("TRACE").dim()),
            };
            if record.target() == AUDIT_TARGET {
                writeln!(buf, "{} {} {}", style("AUDIT").magenta().bold(), level, record.args())
            } else {
                writeln!(buf, "{} {}", level, record.args())
            }
        })
        .filter_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        });

    if audit {
        builder.filter(Some(AUDIT_TARGET), LevelFilter::Info);
    }
    builder.init();
}
