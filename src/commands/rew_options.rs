use std::{ffi::OsString, path::PathBuf};
use structopt::{clap::AppSettings, StructOpt};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rew",
    about = "The deterministic replay and debug tool",
    after_help = "Use REW_LOG to control logging; e.g. REW_LOG=all:warn,replay_command:debug"
)]
#[structopt(global_settings =
&[AppSettings::AllowNegativeNumbers, AppSettings::UnifiedHelpMessage])]
pub struct RewOptions {
    /// Force rew to do some things that don't seem like good ideas, for example
    /// launching an interactive emergency debugger if stderr isn't a tty.
    #[structopt(short = "F", long)]
    pub force_things: bool,

    #[structopt(
        short = "S",
        long,
        help = "Suppress warnings about issues in the environment that rew has no control over."
    )]
    pub suppress_environment_warnings: bool,

    #[structopt(subcommand)]
    pub cmd: RewSubCommand,
}

#[derive(Clone, Debug, StructOpt)]
pub enum RewSubCommand {
    /// Replay a previously recorded trace.
    #[structopt(name = "replay")]
    Replay {
        /// Replay without debugger server
        #[structopt(short = "a", long = "autopilot")]
        autopilot: bool,

        /// Use <debugger-file> as the debugger command
        #[structopt(short = "d", long = "debugger")]
        debugger_file: Option<PathBuf>,

        /// Pass an option to the debugger
        #[structopt(short = "o", long = "debugger-option")]
        debugger_option: Option<OsString>,

        /// This is passed directly to gdb. It is here for convenience to support
        /// 'gdb --fullname' as suggested by GNU Emacs
        #[structopt(long = "fullname")]
        fullname: bool,

        /// This is passed directly to gdb. It is here for convenience to support
        /// 'gdb -i=mi' as suggested by GNU Emacs
        #[structopt(short = "i", long = "interpreter")]
        interpreter: Option<String>,

        /// Listen address for the debug server. Default listen address is set to
        /// localhost
        #[structopt(short = "h", long = "dbghost")]
        dbghost: Option<String>,

        /// Only start a debug server on <dbgport>, don't automatically launch
        /// the debugger client
        #[structopt(short = "s", long = "dbgport")]
        dbgport: Option<u16>,

        /// Execute gdb commands from <gdb-x-file>
        #[structopt(short = "x", long = "gdb-x")]
        gdb_x_file: Option<OsString>,

        /// Which directory is the trace data in? If omitted the latest trace
        /// dir is used
        trace_dir: Option<PathBuf>,
    },
}
