use crate::{
    gdb_connection::{
        decode_dbg_command, read_debugger_params, write_debugger_params, DbgCommand,
        DebuggerParams, GdbConnection, GdbConnectionFeatures, GdbRequest,
        DBG_COMMAND_MAGIC_ADDRESS,
    },
    log::{LogDebug, LogInfo, LogWarn},
    scoped_fd::ScopedFd,
    session::{
        replay_session,
        replay_session::ReplaySessionSharedPtr,
        task::TaskSharedPtr,
    },
};
use libc::pid_t;
use nix::{
    errno::Errno,
    sys::socket::{
        bind, listen, setsockopt, socket, sockopt, AddressFamily, InetAddr, IpAddr, SockAddr,
        SockFlag, SockType,
    },
    unistd::getpid,
};
use std::{
    cell::RefCell,
    collections::HashMap,
    convert::TryInto,
    env,
    ffi::OsString,
    fs, io,
    path::Path,
    process::Command,
    rc::Weak,
};

const LOCALHOST_ADDR: &str = "127.0.0.1";

pub struct ConnectionFlags {
    /// `None` to let the server probe for a port itself, starting from a
    /// tid-seeded base.
    pub dbg_port: Option<u16>,
    pub dbg_host: String,
    /// If not Weak::new(), then once the server is listening its connection
    /// parameters are published through this pipe. `GdbServer::launch_gdb`
    /// is given the other end of the pipe and starts gdb against them.
    pub debugger_params_write_pipe: Weak<RefCell<ScopedFd>>,
}

impl Default for ConnectionFlags {
    fn default() -> ConnectionFlags {
        ConnectionFlags {
            dbg_port: None,
            dbg_host: LOCALHOST_ADDR.into(),
            debugger_params_write_pipe: Weak::new(),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum ProbePort {
    DontProbe,
    ProbePort,
}

pub struct GdbServer {
    /// None until the debugger connection is established; never changes
    /// afterwards.
    dbg: Option<GdbConnection>,
    /// When dbg is set, the thread-group being debugged. We don't support
    /// switching gdb between debuggee processes.
    debuggee_tguid: pid_t,
    /// The session being served. Emergency servers attach to one stopped
    /// task instead and have no session.
    session: Option<ReplaySessionSharedPtr>,
    /// Client-created checkpoints, indexed by the client's own numbering.
    checkpoints: HashMap<u32, ReplaySessionSharedPtr>,
}

impl GdbServer {
    /// Create a gdbserver serving the replay of `session`.
    pub fn new(session: ReplaySessionSharedPtr) -> GdbServer {
        GdbServer {
            dbg: None,
            debuggee_tguid: 0,
            session: Some(session),
            checkpoints: HashMap::new(),
        }
    }

    fn new_from(dbg: GdbConnection, tgid: pid_t) -> GdbServer {
        GdbServer {
            dbg: Some(dbg),
            debuggee_tguid: tgid,
            session: None,
            checkpoints: HashMap::new(),
        }
    }

    fn dbg(&self) -> &GdbConnection {
        self.dbg.as_ref().unwrap()
    }

    fn dbg_mut(&mut self) -> &mut GdbConnection {
        self.dbg.as_mut().unwrap()
    }

    /// Create a replay session for `maybe_trace_dir` and serve it to a
    /// single debugger client. Returns when the client ends the session.
    pub fn serve_replay_with_debugger(maybe_trace_dir: Option<&Path>, flags: &ConnectionFlags) {
        let session = replay_session::create(maybe_trace_dir);
        let mut server = GdbServer::new(session);
        server.serve_replay(flags);
    }

    fn serve_replay(&mut self, flags: &ConnectionFlags) {
        let t = {
            let session = self.session.as_ref().unwrap();
            let maybe_t = session.borrow().current_task();
            match maybe_t {
                Some(t) => t,
                None => fatal!("No tasks left in the replay session"),
            }
        };
        let (tid, tgid) = (t.borrow().tid(), t.borrow().tgid());

        let mut port = match flags.dbg_port {
            Some(port) => port,
            None => choose_listen_port(tid),
        };
        let probe = if flags.dbg_port.is_none() {
            ProbePort::ProbePort
        } else {
            ProbePort::DontProbe
        };
        let listen_fd = open_socket(&flags.dbg_host, &mut port, probe);

        match flags.debugger_params_write_pipe.upgrade() {
            Some(write_pipe) => {
                // The client launcher is blocked on the other end of the
                // pipe. Publishing only after listen() succeeded means the
                // parameters always name a live endpoint.
                let params = DebuggerParams {
                    host: flags.dbg_host.clone(),
                    port,
                    pid: tid,
                    tgid,
                };
                if let Err(e) = write_debugger_params(&write_pipe.borrow(), &params) {
                    fatal!("Couldn't publish debugger params: {}", e);
                }
            }
            None => {
                // Nobody launches a client for us in this mode; tell the
                // user where to point one.
                eprintln!(
                    "Launch the debugger with\n  gdb -l 10000 -ex 'target extended-remote {}:{}'\nto attach to tgid {} (task {}).",
                    flags.dbg_host, port, tgid, tid
                );
            }
        }

        log!(LogDebug, "limiting debugger traffic to tgid {}", tgid);
        let dbg = await_connection(&t, &listen_fd, GdbConnectionFeatures::default());
        self.dbg = Some(dbg);
        self.debuggee_tguid = tgid;
        self.process_debugger_requests(&t);
    }

    /// exec()s gdb using parameters read from `params_pipe_fd` (sent through
    /// the pipe handed to `serve_replay_with_debugger`), with our command
    /// macros loaded, and runs it to completion.
    pub fn launch_gdb(
        params_pipe_fd: &ScopedFd,
        gdb_binary_file_path: &Path,
        gdb_options: &[OsString],
    ) -> io::Result<()> {
        let params = read_debugger_params(params_pipe_fd)?;

        let script_path = env::temp_dir().join(format!("rew-gdb-cmds-{}", getpid()));
        fs::write(&script_path, gdb_rew_macros())?;

        let mut cmd = Command::new(gdb_binary_file_path);
        // The replay side can be slow to answer while it reconstructs
        // state; keep gdb from timing out on it.
        cmd.arg("-l").arg("10000");
        cmd.arg("-x").arg(&script_path);
        cmd.args(gdb_options);
        cmd.arg("-ex").arg(format!(
            "target extended-remote {}:{}",
            params.host, params.port
        ));

        log!(
            LogInfo,
            "Launching {:?} against tgid {} on {}:{}",
            gdb_binary_file_path,
            params.tgid,
            params.host,
            params.port
        );
        let status = cmd.status()?;
        log!(LogDebug, "Debugger exited with {:?}", status);
        Ok(())
    }

    /// Start a debugging connection for `t` and return when there are no
    /// more requests to process (usually because the debugger detaches).
    ///
    /// This helper doesn't attempt to determine whether blocking on a
    /// debugger connection is a good idea. It will always open the debug
    /// socket and block awaiting a connection.
    pub fn emergency_debug(t: &TaskSharedPtr) {
        // We don't know whether `t` overshot an internal breakpoint. If it
        // did, cover that breakpoint up; the attaching debugger must not
        // observe it.
        t.borrow_mut().destroy_all_breakpoints();

        let (tid, tgid) = (t.borrow().tid(), t.borrow().tgid());
        let mut port = choose_listen_port(tid);
        let listen_fd = open_socket(LOCALHOST_ADDR, &mut port, ProbePort::ProbePort);
        eprintln!(
            "Debug server listening; attach with\n  gdb -l 10000 -ex 'target extended-remote {}:{}'\n(task {}, tgid {}).",
            LOCALHOST_ADDR, port, tid, tgid
        );

        // Reverse execution needs the full timeline, which an emergency
        // stop doesn't have.
        let dbg = await_connection(
            t,
            &listen_fd,
            GdbConnectionFeatures {
                reverse_execution: false,
            },
        );
        let mut server = GdbServer::new_from(dbg, tgid);
        server.process_debugger_requests(t);
    }

    /// Serve the connected client until it ends the session.
    pub fn process_debugger_requests(&mut self, t: &TaskSharedPtr) {
        loop {
            let req = self.dbg_mut().get_request();
            if !self.dispatch_debugger_request(t, req) {
                return;
            }
        }
    }

    /// Process a single debugger request. Returns false once the session is
    /// over.
    fn dispatch_debugger_request(&mut self, _t: &TaskSharedPtr, req: GdbRequest) -> bool {
        match req {
            GdbRequest::SetMem { addr, value } if addr == DBG_COMMAND_MAGIC_ADDRESS => {
                let ok = self.handle_dbg_command(&value);
                self.dbg_mut().reply_set_mem(ok);
                true
            }
            GdbRequest::Detach => {
                self.dbg_mut().reply_detach();
                false
            }
            _ => unimplemented!(),
        }
    }

    /// A memory write aimed at [`DBG_COMMAND_MAGIC_ADDRESS`] carries a
    /// checkpoint command from the client-side macros, not tracee data.
    fn handle_dbg_command(&mut self, value: &[u8]) -> bool {
        let encoded = match value.try_into() {
            Ok(bytes) => u32::from_le_bytes(bytes),
            Err(_) => {
                log!(
                    LogWarn,
                    "Debugger command write of {} bytes; expected 4",
                    value.len()
                );
                return false;
            }
        };

        match decode_dbg_command(encoded) {
            Some(DbgCommand::CreateCheckpoint(index)) => match &self.session {
                Some(session) => {
                    log!(LogDebug, "Creating checkpoint {}", index);
                    let checkpoint = session.borrow().clone_session();
                    self.checkpoints.insert(index, checkpoint);
                    true
                }
                None => {
                    log!(LogWarn, "No replay session here; can't checkpoint");
                    false
                }
            },
            Some(DbgCommand::DeleteCheckpoint(index)) => {
                // Deleting a checkpoint that doesn't exist is a no-op.
                self.checkpoints.remove(&index);
                true
            }
            None => {
                log!(LogWarn, "Unrecognized debugger command {:#010x}", encoded);
                false
            }
        }
    }
}

/// Seed the listening port with the tid so concurrent servers spread out
/// over the probe space instead of racing for one port.
fn choose_listen_port(tid: pid_t) -> u16 {
    1024 + (tid % 31000) as u16
}

/// Open a listening TCP socket on `host`. With `ProbePort`, `port` is a
/// starting point and successive ports are tried until one binds; the
/// chosen port is written back through `port`.
fn open_socket(host: &str, port: &mut u16, probe: ProbePort) -> ScopedFd {
    let listen_fd = match socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    ) {
        Ok(fd) => ScopedFd::from_raw(fd),
        Err(e) => fatal!("Couldn't create socket: {}", e),
    };

    let parsed_host: std::net::IpAddr = match host.parse() {
        Ok(addr) => addr,
        Err(_) => fatal!("Couldn't parse listen address `{}'", host),
    };

    loop {
        let addr = SockAddr::new_inet(InetAddr::new(IpAddr::from_std(&parsed_host), *port));
        let res = setsockopt(listen_fd.as_raw(), sockopt::ReuseAddr, &true)
            .and_then(|_| bind(listen_fd.as_raw(), &addr))
            .and_then(|_| listen(listen_fd.as_raw(), 1));
        match res {
            Ok(()) => return listen_fd,
            Err(Errno::EADDRINUSE) if probe == ProbePort::ProbePort => {
                *port = if *port == u16::MAX { 1024 } else { *port + 1 };
            }
            Err(e) => fatal!("Couldn't bind to port {}: {}", *port, e),
        }
    }
}

/// Wait for exactly one debugger client to connect on `listen_fd`. The
/// session that follows is limited to traffic about `t`'s thread group.
fn await_connection(
    t: &TaskSharedPtr,
    listen_fd: &ScopedFd,
    features: GdbConnectionFeatures,
) -> GdbConnection {
    let mut dbg = GdbConnection::new(t.borrow().tgid(), features);
    dbg.await_debugger(listen_fd);
    dbg
}

lazy_static! {
    static ref GDB_REW_MACROS: String = gdb_rew_macros_init();
}

/// Command definitions loaded into the gdb client at launch, implementing
/// functionality outside of the stock remote protocol. The checkpoint
/// commands talk to the server by storing an opcode-tagged word to the
/// scratch address; the trailing expression makes each command echo the
/// checkpoint number instead of the encoded message.
pub fn gdb_rew_macros() -> &'static str {
    &*GDB_REW_MACROS
}

fn gdb_rew_macros_init() -> String {
    // SIGURG is repurposed for internal signalling, so gdb must keep
    // reporting it instead of silently continuing past it.
    let s: &'static str = r##"define checkpoint
  init-if-undefined $_next_checkpoint_index = 1
  p (*(int*)29298 = 0x01000000 | $_next_checkpoint_index), $_next_checkpoint_index++
end
document checkpoint
create a checkpoint at the current position in the replay
end
define delete checkpoint
  p (*(int*)29298 = 0x02000000 | $arg0), $arg0
end
document delete checkpoint
delete the checkpoint numbered N
end
define restart
  run c$arg0
end
document restart
restart at checkpoint N
checkpoints are created with the 'checkpoint' command
end
handle SIGURG stop
set prompt (rew)
"##;
    s.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gdb_connection::{
            DBG_COMMAND_MSG_CREATE_CHECKPOINT, DBG_COMMAND_MSG_DELETE_CHECKPOINT,
        },
        session::replay_session::{
            BreakReason, ReplayResult, ReplaySession, ReplayStatus, RunCommand,
        },
    };
    use std::rc::Rc;

    struct NullSession;

    impl ReplaySession for NullSession {
        fn replay_step(&mut self, _cmd: RunCommand) -> ReplayResult {
            ReplayResult {
                status: ReplayStatus::ReplayExited,
                break_reason: BreakReason::BreakNone,
            }
        }

        fn clone_session(&self) -> ReplaySessionSharedPtr {
            Rc::new(RefCell::new(NullSession))
        }

        fn current_task(&self) -> Option<TaskSharedPtr> {
            None
        }
    }

    fn server_with_session() -> GdbServer {
        let session: ReplaySessionSharedPtr = Rc::new(RefCell::new(NullSession));
        GdbServer::new(session)
    }

    #[test]
    fn checkpoint_writes_create_and_delete() {
        let mut server = server_with_session();

        let create = (DBG_COMMAND_MSG_CREATE_CHECKPOINT | 1).to_le_bytes();
        assert!(server.handle_dbg_command(&create));
        assert!(server.checkpoints.contains_key(&1));

        let delete = (DBG_COMMAND_MSG_DELETE_CHECKPOINT | 1).to_le_bytes();
        assert!(server.handle_dbg_command(&delete));
        assert!(!server.checkpoints.contains_key(&1));
    }

    #[test]
    fn deleting_a_missing_checkpoint_is_a_noop() {
        let mut server = server_with_session();
        let delete = (DBG_COMMAND_MSG_DELETE_CHECKPOINT | 7).to_le_bytes();
        assert!(server.handle_dbg_command(&delete));
    }

    #[test]
    fn junk_command_words_are_rejected() {
        let mut server = server_with_session();
        assert!(!server.handle_dbg_command(&0x7f00_0001u32.to_le_bytes()));
        assert!(!server.handle_dbg_command(&[0u8; 2]));
        assert!(server.checkpoints.is_empty());
    }

    #[test]
    fn emergency_servers_refuse_checkpoints() {
        let dbg = GdbConnection::new(100, GdbConnectionFeatures::default());
        let mut server = GdbServer::new_from(dbg, 100);
        let create = (DBG_COMMAND_MSG_CREATE_CHECKPOINT | 1).to_le_bytes();
        assert!(!server.handle_dbg_command(&create));
    }

    #[test]
    fn macros_match_the_wire_constants() {
        let macros = gdb_rew_macros();
        assert!(macros.contains(&format!(
            "(*(int*){} = {:#010x} |",
            DBG_COMMAND_MAGIC_ADDRESS, DBG_COMMAND_MSG_CREATE_CHECKPOINT
        )));
        assert!(macros.contains(&format!(
            "(*(int*){} = {:#010x} |",
            DBG_COMMAND_MAGIC_ADDRESS, DBG_COMMAND_MSG_DELETE_CHECKPOINT
        )));
        // The client-side index starts at 1 and SIGURG stays visible.
        assert!(macros.contains("init-if-undefined $_next_checkpoint_index = 1"));
        assert!(macros.contains("handle SIGURG stop"));
    }

    #[test]
    fn probe_ports_stay_unprivileged() {
        assert!(choose_listen_port(1) >= 1024);
        assert!(choose_listen_port(123_456) >= 1024);
    }
}
