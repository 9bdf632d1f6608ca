//! Terminal logging for the control tool and the daemon it runs
//!
//! Records carry the pid: a forked child logs through the same stderr as the
//! daemon until it execs.

use console::{StyledObject, style};
use env_logger::{Builder, Env};
use log::Level;
use std::io::Write;

/// Workspace crates that `--verbose` raises to debug
const WORKSPACE_CRATES: [&str; 6] = [
    "appspawn",
    "appspawn_core",
    "appspawn_ctl",
    "appspawn_msg",
    "appspawn_permission",
    "appspawn_sandbox",
];

/// Filter used when `RUST_LOG` is unset
///
/// Verbose mode only opens up our own crates; dependencies stay at warn.
pub fn default_filter(verbose: bool) -> String {
    let mut directives = vec!["warn".to_string()];
    if verbose {
        directives.extend(WORKSPACE_CRATES.iter().map(|name| format!("{}=debug", name)));
    }
    directives.join(",")
}

fn level_tag(level: Level) -> StyledObject<&'static str> {
    match level {
        Level::Error => style("E").red().bold(),
        Level::Warn => style("W").yellow().bold(),
        Level::Info => style("I").green(),
        Level::Debug => style("D").cyan(),
        Level::Trace => style("T").dim(),
    }
}

/// Module path without the crate prefix, `appspawn::modules::env` -> `modules::env`
fn short_target(target: &str) -> &str {
    target.split_once("::").map_or(target, |(_, rest)| rest)
}

pub fn init_logger(verbose: bool) {
    let env = Env::default().filter_or("RUST_LOG", default_filter(verbose));

    Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {} {:>6} {} {}",
                style(buf.timestamp_millis()).dim(),
                level_tag(record.level()),
                std::process::id(),
                style(short_target(record.target())).dim(),
                record.args()
            )
        })
        .init();
}
