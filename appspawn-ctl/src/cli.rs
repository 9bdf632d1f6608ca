use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "appspawn-ctl")]
#[command(version, about = "Run and talk to the application spawning daemon", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Start the daemon with a config file
    appspawn-ctl --config /etc/appspawn/daemon.json serve

    # Ask it for a process
    appspawn-ctl spawn com.example.app --uid 20010001 --gid 20010001 -p internet
    appspawn-ctl spawn tool --native -- /usr/bin/tool --once

    # Inspect
    appspawn-ctl status 4242
    appspawn-ctl permissions
    appspawn-ctl check
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Daemon configuration file (JSON); defaults apply when omitted
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground
    Serve,

    /// Request a new process
    Spawn(SpawnArgs),

    /// Exit status of a spawned process, killing it if still running
    Status {
        pid: i32,
    },

    /// Make the daemon log its in-flight requests and live processes
    Dump,

    /// List the permission names and their bit positions
    Permissions,

    /// Check host support for sandboxing
    Check,
}

#[derive(clap::Args, Debug)]
pub struct SpawnArgs {
    /// Process (bundle) name
    pub name: String,

    #[arg(long, default_value_t = 0)]
    pub uid: u32,

    #[arg(long, default_value_t = 0)]
    pub gid: u32,

    /// Bundle index, for cloned applications
    #[arg(long, value_name = "INDEX")]
    pub bundle_index: Option<u32>,

    /// Supplementary group
    #[arg(long = "group", value_name = "GID")]
    pub groups: Vec<u32>,

    /// Ability privilege level
    #[arg(long)]
    pub apl: Option<String>,

    /// Spawn without the application sandbox
    #[arg(long)]
    pub native: bool,

    /// Message flag (debuggable, no-sandbox, isolated-sandbox, ...)
    #[arg(short, long = "flag", value_name = "FLAG")]
    pub flags: Vec<String>,

    /// Sandbox permission to grant
    #[arg(short, long = "permission", value_name = "NAME")]
    pub permissions: Vec<String>,

    /// Environment entry for the child
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Program and arguments the child runs
    #[arg(last = true)]
    pub argv: Vec<String>,
}
