// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dyno-exec")]
#[command(about = "Remote shell, SOCKS proxy and port forwarding into running dynos")]
#[command(version)]
pub struct Cli {
    /// App to connect to
    #[arg(short, long, global = true, env = "HEROKU_APP")]
    pub app: Option<String>,

    /// Dyno to connect to (defaults to the configured dyno, usually web.1)
    #[arg(short, long, global = true)]
    pub dyno: Option<String>,

    /// Path to a configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Open an interactive shell, or run a single command, on the dyno
    Shell {
        /// Command to run instead of a login shell
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Start a local SOCKS proxy that connects from inside the dyno
    Socks {
        /// Local port to listen on
        #[arg(short, long, default_value_t = 1080)]
        port: u16,
    },

    /// Forward a local port to a port on the dyno
    Forward {
        /// Port to reach on the remote side
        remote_port: u16,

        /// Local port to listen on (defaults to the remote port)
        #[arg(short, long)]
        local_port: Option<u16>,

        /// Host to reach from inside the dyno
        #[arg(long, default_value = "localhost")]
        remote_host: String,
    },

    /// Copy a file from the dyno to the local machine
    Copy {
        /// Path of the file on the dyno
        remote_path: String,

        /// Local destination (defaults to the remote file name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show whether remote access is enabled and reachable
    Status,
}
