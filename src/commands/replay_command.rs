use super::rew_options::{RewOptions, RewSubCommand};
use crate::{
    commands::{
        exit_result::ExitResult,
        gdb_server::{ConnectionFlags, GdbServer},
        RewCommand,
    },
    flags::Flags,
    kernel_metadata::signal_name,
    log::{LogDebug, LogInfo},
    scoped_fd::ScopedFd,
    session::replay_session,
    session::replay_session::{BreakReason, ReplaySession, ReplayStatus, RunCommand},
    util::running_under_rew,
};
use libc::pid_t;
use nix::{
    errno::errno,
    fcntl::OFlag,
    sys::signal::{
        kill, sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
    },
    unistd::{fork, getpid, getppid, pipe2, ForkResult, Pid},
};
use std::{
    cell::RefCell,
    ffi::OsString,
    io,
    path::PathBuf,
    process,
    rc::Rc,
    sync::atomic::{AtomicI32, Ordering},
};

/// While a forked debugger server is alive, its pid. The parent's SIGINT
/// handler reads this; the parent writes it exactly once, right after the
/// fork.
static WAITING_FOR_CHILD: AtomicI32 = AtomicI32::new(0);

pub struct ReplayCommand {
    /// Run the whole replay with no debugger server at all.
    autopilot: bool,

    /// Only open a debug socket, don't launch the debugger too.
    dont_launch_debugger: bool,

    /// IP port to listen on for debug connections.
    dbg_port: Option<u16>,

    /// IP host to listen on for debug connections.
    dbg_host: String,

    /// Specify a custom gdb binary with -d
    gdb_binary_file_path: PathBuf,

    /// Pass these options to gdb
    gdb_options: Vec<OsString>,

    trace_dir: Option<PathBuf>,
}

impl Default for ReplayCommand {
    fn default() -> Self {
        Self {
            autopilot: false,
            dont_launch_debugger: false,
            dbg_port: None,
            dbg_host: "127.0.0.1".into(),
            gdb_binary_file_path: "gdb".into(),
            gdb_options: vec![],
            trace_dir: None,
        }
    }
}

impl ReplayCommand {
    pub fn new(options: &RewOptions) -> ReplayCommand {
        match options.cmd.clone() {
            RewSubCommand::Replay {
                autopilot,
                debugger_file,
                debugger_option,
                fullname,
                interpreter,
                dbghost,
                dbgport,
                gdb_x_file,
                trace_dir,
            } => {
                let mut flags = ReplayCommand::default();

                if autopilot {
                    flags.autopilot = true;
                    flags.dont_launch_debugger = true;
                }

                if let Some(file) = debugger_file {
                    flags.gdb_binary_file_path = file;
                }

                if let Some(option) = debugger_option {
                    flags.gdb_options.push(option);
                }

                if let Some(host) = dbghost {
                    flags.dbg_host = host;
                    flags.dont_launch_debugger = true;
                }

                if dbgport.is_some() {
                    flags.dbg_port = dbgport;
                    flags.dont_launch_debugger = true;
                }

                if let Some(x_file) = gdb_x_file {
                    flags.gdb_options.push("-x".into());
                    flags.gdb_options.push(x_file);
                }

                if fullname {
                    flags.gdb_options.push("--fullname".into());
                }

                if let Some(interp) = interpreter {
                    flags.gdb_options.push("-i".into());
                    flags.gdb_options.push(OsString::from(interp));
                }

                flags.trace_dir = trace_dir;

                flags
            }
        }
    }

    fn connection_flags(&self, write_pipe: std::rc::Weak<RefCell<ScopedFd>>) -> ConnectionFlags {
        ConnectionFlags {
            dbg_port: self.dbg_port,
            dbg_host: self.dbg_host.clone(),
            debugger_params_write_pipe: write_pipe,
        }
    }

    fn serve_replay_no_debugger(&self) -> io::Result<()> {
        let session = replay_session::create(self.trace_dir.as_deref());
        match replay_loop(&mut *session.borrow_mut()) {
            Ok(step_count) => {
                log!(LogDebug, "Replayed the trace in {} steps", step_count);
            }
            Err(reason) => {
                fatal!(
                    "Replay stopped for {:?} but no debugger is attached to service it",
                    reason
                );
            }
        }

        log!(LogInfo, "Replayer successfully finished");
        Ok(())
    }

    fn replay(&self) -> io::Result<i32> {
        // If we're not going to autolaunch the debugger, don't go through
        // the rigamarole to set that up. All it does is complicate the
        // process tree and confuse users.
        if self.dont_launch_debugger {
            if self.autopilot {
                self.serve_replay_no_debugger()?;
            } else {
                GdbServer::serve_replay_with_debugger(
                    self.trace_dir.as_deref(),
                    &self.connection_flags(std::rc::Weak::new()),
                );
            }
            return Ok(0);
        }

        // Install the handler before forking so a ctrl-C during setup is
        // still translated for the server.
        install_signal_handler();

        let (params_pipe_read_fd, params_pipe_write_fd) = match pipe2(OFlag::O_CLOEXEC) {
            Ok(fds) => fds,
            Err(e) => fatal!("Couldn't open debugger params pipe: {}", e),
        };

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                // Ensure only the parent has the read end of the pipe open.
                // Then if the parent dies, our writes to the pipe error out.
                drop(ScopedFd::from_raw(params_pipe_read_fd));
                let debugger_params_write_pipe =
                    Rc::new(RefCell::new(ScopedFd::from_raw(params_pipe_write_fd)));
                // The parent process (gdb) must be able to receive SIGINTs
                // to interrupt non-stopped tracees. But the debugger server
                // isn't set up to handle SIGINT, so block it here; SIGTERM
                // is what stops this role.
                set_sig_blockedness(Signal::SIGINT, SigmaskHow::SIG_BLOCK);
                GdbServer::serve_replay_with_debugger(
                    self.trace_dir.as_deref(),
                    &self.connection_flags(Rc::downgrade(&debugger_params_write_pipe)),
                );
                drop(debugger_params_write_pipe);
                process::exit(0);
            }
            Ok(ForkResult::Parent { child }) => {
                WAITING_FOR_CHILD.store(child.as_raw(), Ordering::SeqCst);
                // Ensure only the child has the write end of the pipe open.
                // Then if the child dies, our reads from the pipe return
                // EOF instead of blocking forever.
                drop(ScopedFd::from_raw(params_pipe_write_fd));
                log!(LogDebug, "{}: forked debugger server {}", getpid(), child);

                {
                    let params_pipe_read_fd = ScopedFd::from_raw(params_pipe_read_fd);
                    if let Err(e) = GdbServer::launch_gdb(
                        &params_pipe_read_fd,
                        &self.gdb_binary_file_path,
                        &self.gdb_options,
                    ) {
                        clean_fatal!("Couldn't launch the debugger: {}", e);
                    }
                }

                let exit_code = wait_for_debugger_server(child.as_raw());
                log!(LogInfo, "Debugger server died.  Exiting.");
                Ok(exit_code)
            }
            Err(e) => fatal!("fork failed: {}", e),
        }
    }
}

impl RewCommand for ReplayCommand {
    fn run(&mut self) -> ExitResult<()> {
        if running_under_rew() {
            if !Flags::get().suppress_environment_warnings {
                eprintln!(
                    "rew: rew pid {} running under parent {}. Good luck.",
                    getpid(),
                    getppid()
                );
            }
            if self.trace_dir.is_none() {
                return ExitResult::err_from(
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "No trace-dir supplied. You'll try to replay the recording of this rew \
                        and have a bad time. Bailing out.",
                    ),
                    3,
                );
            }
        }

        match self.replay() {
            Ok(0) => ExitResult::Ok(()),
            // The server's exit status is our exit status; a supervisor
            // watching us is really watching the whole session.
            Ok(exit_code) => process::exit(exit_code),
            Err(e) => ExitResult::err_from(e, 1),
        }
    }
}

/// Drive `session` forward until the recording is exhausted. Returns the
/// number of steps taken, or the break reason if the session stopped for
/// something only a debugger could service. No step is attempted past such
/// a stop.
fn replay_loop(session: &mut dyn ReplaySession) -> Result<u64, BreakReason> {
    let mut step_count: u64 = 0;
    loop {
        let result = session.replay_step(RunCommand::RunContinue);
        step_count += 1;

        if result.status == ReplayStatus::ReplayExited {
            return Ok(step_count);
        }
        debug_assert_eq!(result.status, ReplayStatus::ReplayContinue);
        match result.break_reason {
            BreakReason::BreakNone | BreakReason::BreakSignal(_) => (),
            reason => return Err(reason),
        }
    }
}

extern "C" fn handle_signal(sig: libc::c_int) {
    match sig {
        libc::SIGINT => {
            // Translate the SIGINT into SIGTERM for the debugger server,
            // because it's blocking SIGINT. We don't use SIGINT for
            // anything, so all it's meant to do is kill us, and SIGTERM
            // works just as well for that.
            let child = WAITING_FOR_CHILD.load(Ordering::SeqCst);
            if child > 0 {
                kill(Pid::from_raw(child), Signal::SIGTERM).unwrap_or(());
            }
        }
        _ => fatal!("Unhandled signal {}", signal_name(sig)),
    }
}

fn install_signal_handler() {
    let sa = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    if unsafe { sigaction(Signal::SIGINT, &sa) }.is_err() {
        fatal!("Couldn't set sigaction for SIGINT");
    }
}

/// Set the blocked-ness of `sig` for this process.
fn set_sig_blockedness(sig: Signal, how: SigmaskHow) {
    let mut sset = SigSet::empty();
    sset.add(sig);
    if sigprocmask(how, Some(&sset), None).is_err() {
        fatal!("Didn't change sigmask");
    }
}

/// Wait until the debugger server `child` is gone and translate how it died
/// into an exit code: a normal exit passes its status through unchanged,
/// death by signal becomes 1. A wait interrupted by a signal is simply
/// retried; any other wait failure is unrecoverable.
fn wait_for_debugger_server(child: pid_t) -> i32 {
    loop {
        let mut raw_status: i32 = 0;
        let ret = unsafe { libc::waitpid(child, &mut raw_status, 0) };
        let err = errno();
        log!(
            LogDebug,
            "{}: waitpid({}) returned {} ({}); status: {:#x}",
            getpid(),
            child,
            ret,
            err,
            raw_status
        );
        if ret != child {
            if err == libc::EINTR {
                continue;
            }
            fatal!("waitpid({}) failed", child);
        }
        if libc::WIFEXITED(raw_status) {
            return libc::WEXITSTATUS(raw_status);
        }
        if libc::WIFSIGNALED(raw_status) {
            return 1;
        }
        // A stop report isn't a death; keep waiting.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{
        replay_session::{ReplayResult, ReplaySessionSharedPtr},
        task::TaskSharedPtr,
    };
    use crate::sig;
    use nix::unistd::ForkResult;
    use std::{thread, time::Duration};

    struct ScriptedSession {
        script: Vec<ReplayResult>,
        steps_taken: usize,
    }

    impl ScriptedSession {
        fn new(script: Vec<ReplayResult>) -> ScriptedSession {
            ScriptedSession {
                script,
                steps_taken: 0,
            }
        }
    }

    impl ReplaySession for ScriptedSession {
        fn replay_step(&mut self, cmd: RunCommand) -> ReplayResult {
            assert_eq!(cmd, RunCommand::RunContinue);
            let result = self.script[self.steps_taken];
            self.steps_taken += 1;
            result
        }

        fn clone_session(&self) -> ReplaySessionSharedPtr {
            unreachable!()
        }

        fn current_task(&self) -> Option<TaskSharedPtr> {
            None
        }
    }

    fn continue_with(break_reason: BreakReason) -> ReplayResult {
        ReplayResult {
            status: ReplayStatus::ReplayContinue,
            break_reason,
        }
    }

    fn exited() -> ReplayResult {
        ReplayResult {
            status: ReplayStatus::ReplayExited,
            break_reason: BreakReason::BreakNone,
        }
    }

    #[test]
    fn replays_to_completion_and_counts_steps() {
        let mut session = ScriptedSession::new(vec![
            continue_with(BreakReason::BreakNone),
            continue_with(BreakReason::BreakSignal(sig::SIGCHLD)),
            continue_with(BreakReason::BreakNone),
            exited(),
        ]);
        assert_eq!(replay_loop(&mut session), Ok(4));
        assert_eq!(session.steps_taken, 4);
    }

    #[test]
    fn replaying_the_same_script_again_takes_the_same_steps() {
        let script = vec![continue_with(BreakReason::BreakNone), exited()];
        let mut first = ScriptedSession::new(script.clone());
        let mut second = ScriptedSession::new(script);
        assert_eq!(
            replay_loop(&mut first).unwrap(),
            replay_loop(&mut second).unwrap()
        );
    }

    #[test]
    fn an_unexpected_break_reason_stops_the_loop_cold() {
        let mut session = ScriptedSession::new(vec![
            continue_with(BreakReason::BreakNone),
            continue_with(BreakReason::BreakBreakpoint),
            // Never reached; stepping past the breakpoint would be a bug.
            exited(),
        ]);
        assert_eq!(
            replay_loop(&mut session),
            Err(BreakReason::BreakBreakpoint)
        );
        assert_eq!(session.steps_taken, 2);
    }

    #[test]
    fn server_exit_status_passes_through() {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe { libc::_exit(7) },
            ForkResult::Parent { child } => {
                assert_eq!(wait_for_debugger_server(child.as_raw()), 7);
            }
        }
    }

    #[test]
    fn death_by_signal_becomes_exit_code_one() {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => loop {
                unsafe { libc::pause() };
            },
            ForkResult::Parent { child } => {
                kill(child, Signal::SIGKILL).unwrap();
                assert_eq!(wait_for_debugger_server(child.as_raw()), 1);
            }
        }
    }

    #[test]
    fn interrupted_waits_are_retried() {
        // A handled signal with SA_RESTART unset makes waitpid fail with
        // EINTR rather than killing us.
        extern "C" fn noop(_sig: libc::c_int) {}
        let sa = SigAction::new(
            SigHandler::Handler(noop),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGUSR1, &sa) }.unwrap();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe {
                libc::usleep(300_000);
                libc::_exit(5);
            },
            ForkResult::Parent { child } => {
                let waiter = unsafe { libc::pthread_self() };
                let pinger = thread::spawn(move || {
                    for _ in 0..10 {
                        thread::sleep(Duration::from_millis(20));
                        unsafe { libc::pthread_kill(waiter, libc::SIGUSR1) };
                    }
                });
                assert_eq!(wait_for_debugger_server(child.as_raw()), 5);
                pinger.join().unwrap();
            }
        }
    }

    #[test]
    fn sigint_is_translated_to_sigterm_for_the_tracked_server() {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => loop {
                unsafe { libc::pause() };
            },
            ForkResult::Parent { child } => {
                WAITING_FOR_CHILD.store(child.as_raw(), Ordering::SeqCst);
                handle_signal(libc::SIGINT);
                // SIGTERM lands even if the child hasn't reached pause yet.
                assert_eq!(wait_for_debugger_server(child.as_raw()), 1);
                WAITING_FOR_CHILD.store(0, Ordering::SeqCst);
            }
        }
    }
}
