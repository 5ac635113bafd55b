use crate::{session::task::TaskSharedPtr, sig::Sig};
use std::{cell::RefCell, path::Path, rc::Rc};

pub type ReplaySessionSharedPtr = Rc<RefCell<dyn ReplaySession>>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunCommand {
    RunContinue,
    RunSinglestep,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReplayStatus {
    /// Some execution was replayed and the replay can be resumed.
    ReplayContinue,
    /// All tracees are dead and the session is over.
    ReplayExited,
}

/// Why a replay step gave control back before the recording ran out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BreakReason {
    BreakNone,
    /// A signal recorded in the trace was emulated.
    BreakSignal(Sig),
    /// A breakpoint the debugger planted was hit.
    BreakBreakpoint,
    /// A watchpoint the debugger planted fired.
    BreakWatchpoint,
}

#[derive(Copy, Clone, Debug)]
pub struct ReplayResult {
    pub status: ReplayStatus,
    pub break_reason: BreakReason,
}

/// One deterministic replay of one recorded trace.
///
/// Stepping is the whole interface: callers resume the session and get told
/// why it stopped. Once `ReplayExited` has been reported, stepping again is
/// a caller bug.
pub trait ReplaySession {
    /// Advance the replay according to `cmd` and report the outcome.
    fn replay_step(&mut self, cmd: RunCommand) -> ReplayResult;

    /// Fork off an independent copy of this session in its current state.
    /// Checkpoints are built out of these.
    fn clone_session(&self) -> ReplaySessionSharedPtr;

    /// The task scheduled for the current trace frame, if any tracee is
    /// still live.
    fn current_task(&self) -> Option<TaskSharedPtr>;
}

/// Create a replay session bound to the trace in `trace_dir`, or to the
/// latest trace when `None`.
pub fn create(_maybe_trace_dir: Option<&Path>) -> ReplaySessionSharedPtr {
    // @TODO Hook up the execution engine once it lands. Callers only rely
    // on the stepping contract above.
    unimplemented!()
}

/// Signals that can stop a tracee during replay without being part of the
/// recording. Nobody should treat these as real stop reasons.
pub fn is_ignored_signal(sig: Sig) -> bool {
    match sig.as_raw() {
        // SIGCHLD can arrive after tasks die during replay. We don't care
        // about SIGCHLD unless it was recorded, in which case its delivery
        // is emulated.
        libc::SIGCHLD => true,
        // SIGWINCH arrives when the user resizes the terminal window. Not
        // relevant to replay.
        libc::SIGWINCH => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sig;
    use std::convert::TryFrom;

    #[test]
    fn chld_and_winch_are_ignored() {
        assert!(is_ignored_signal(sig::SIGCHLD));
        assert!(is_ignored_signal(sig::SIGWINCH));
    }

    #[test]
    fn everything_else_is_not() {
        assert!(!is_ignored_signal(sig::SIGINT));
        assert!(!is_ignored_signal(sig::SIGTERM));
        assert!(!is_ignored_signal(sig::SIGURG));
        assert!(!is_ignored_signal(sig::SIGKILL));
        for raw in 1..0x80 {
            if raw == libc::SIGCHLD || raw == libc::SIGWINCH {
                continue;
            }
            assert!(!is_ignored_signal(Sig::try_from(raw).unwrap()));
        }
    }
}
