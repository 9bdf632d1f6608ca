//! appspawn controller CLI - run the spawning daemon or send it requests

mod cli;
mod commands;
mod logging;

use appspawn_core::DaemonConfig;
use clap::Parser;
use cli::{Cli, Commands};
use console::style;

fn main() {
    let cli = Cli::parse();

    logging::init_logger(cli.verbose);

    let config = match DaemonConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => fail(e),
    };

    let result = match cli.command {
        Commands::Serve => commands::serve(config),
        Commands::Spawn(args) => commands::spawn(&config, args),
        Commands::Status { pid } => commands::status(&config, pid),
        Commands::Dump => commands::dump(&config),
        Commands::Permissions => {
            commands::list_permissions(&config);
            Ok(())
        }
        Commands::Check => {
            commands::check_requirements(&config);
            Ok(())
        }
    };
    if let Err(e) = result {
        fail(e);
    }
}

fn fail(err: impl std::fmt::Display) -> ! {
    eprintln!("{} {}", style("error:").red().bold(), err);
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn spawn_takes_trailing_argv() {
        let cli = Cli::try_parse_from([
            "appspawn-ctl",
            "spawn",
            "tool",
            "--native",
            "-p",
            "internet",
            "--",
            "/usr/bin/tool",
            "--once",
        ])
        .unwrap();
        let Commands::Spawn(args) = cli.command else {
            panic!("expected spawn");
        };
        assert!(args.native);
        assert_eq!(args.permissions, vec!["internet"]);
        assert_eq!(args.argv, vec!["/usr/bin/tool", "--once"]);
    }
}
