use crate::commands::rew_options::RewOptions;
use structopt::StructOpt;

lazy_static! {
    static ref FLAGS: Flags = init_flags();
}

/// Process-global settings mirrored out of the command line, reachable from
/// anywhere without threading them through every call.
#[derive(Clone)]
pub struct Flags {
    /// Force rew to do some things that it otherwise wouldn't, for
    /// example launching an emergency debugger when the output
    /// doesn't seem to be a tty.
    pub force_things: bool,
    /// Suppress warnings related to environmental features outside rew's
    /// control.
    pub suppress_environment_warnings: bool,
}

impl Flags {
    pub fn get() -> &'static Flags {
        &*FLAGS
    }
}

pub fn init_flags() -> Flags {
    let options = RewOptions::from_args();

    Flags {
        force_things: options.force_things,
        suppress_environment_warnings: options.suppress_environment_warnings,
    }
}
