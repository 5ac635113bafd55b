use libc::pid_t;
use std::{cell::RefCell, rc::Rc};

pub type TaskSharedPtr = Rc<RefCell<dyn Task>>;

/// One traced thread scheduled inside a replay session. The replayer never
/// owns tasks; it borrows whichever one the session has scheduled.
pub trait Task {
    /// The tid of this task in the replay.
    fn tid(&self) -> pid_t;

    /// The thread-group id of this task (the pid a user sees).
    fn tgid(&self) -> pid_t;

    /// Remove every breakpoint planted in this task's address space,
    /// including internal ones the task may have overshot. A debugger
    /// attaching afterwards must never observe or trip them.
    fn destroy_all_breakpoints(&mut self);
}
