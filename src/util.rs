use crate::log::LogWarn;
use nix::unistd::isatty;
use std::{env, os::unix::io::RawFd};

/// True when this process is itself running inside an outer rew.
pub fn running_under_rew() -> bool {
    env::var_os("RUNNING_UNDER_REW").is_some()
}

/// "Interactive" here means stderr (or the given fd) is a tty. Launching a
/// debugger that nobody can type at is worse than useless.
pub fn probably_not_interactive(maybe_fd: Option<RawFd>) -> bool {
    let fd = maybe_fd.unwrap_or(libc::STDERR_FILENO);
    !isatty(fd).unwrap_or(false)
}

/// Checkpointed sessions hold a lot of file descriptors open, so push
/// RLIMIT_NOFILE up to the hard limit while we can.
pub fn raise_resource_limits() {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } < 0 {
        fatal!("Can't get RLIMIT_NOFILE");
    }

    rlim.rlim_cur = rlim.rlim_max;
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) } < 0 {
        log!(LogWarn, "Can't raise RLIMIT_NOFILE to {}", rlim.rlim_max);
    }
}
