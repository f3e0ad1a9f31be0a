use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "ptywatch",
    about = "Run batch test/update scripts in a pseudo-terminal and classify their output",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a script and report classified results
    Run {
        /// Echo raw console output (escape sequences included)
        #[arg(long)]
        raw: bool,

        /// JSON pattern map for display grouping (overrides config)
        #[arg(long)]
        group_map: Option<PathBuf>,

        /// Do not forward stdin lines to the script
        #[arg(long)]
        no_stdin: bool,

        /// Command line to run, e.g. `run-tests.cmd --nightly`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Show effective configuration
    Config {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}
