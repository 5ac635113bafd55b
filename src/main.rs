#![allow(dead_code)]
#![allow(unused_macros)]

#[macro_use]
extern crate lazy_static;

#[macro_use]
mod log;
mod commands;
mod flags;
mod gdb_connection;
mod kernel_metadata;
mod scoped_fd;
mod session;
mod sig;
mod util;

use crate::{
    commands::{
        exit_result::ExitResult,
        replay_command::ReplayCommand,
        rew_options::{RewOptions, RewSubCommand},
        RewCommand,
    },
    util::raise_resource_limits,
};
use structopt::StructOpt;

fn main() -> ExitResult<()> {
    raise_resource_limits();
    let options = RewOptions::from_args();

    match &options.cmd {
        RewSubCommand::Replay { .. } => ReplayCommand::new(&options).run(),
    }
}
