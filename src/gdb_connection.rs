use crate::scoped_fd::ScopedFd;
use libc::pid_t;
use nix::{
    sys::socket::{accept4, setsockopt, sockopt, SockFlag},
    unistd,
};
use serde::{Deserialize, Serialize};
use std::io;

/// Writes to this tracee address are not memory writes at all: they carry
/// commands issued by the debugger-side macro definitions. The address and
/// the 32-bit layout below are a stable contract with those macros; change
/// either and every already-distributed macro blob breaks.
pub const DBG_COMMAND_MAGIC_ADDRESS: usize = 29298;

/// High byte of the 32-bit command word is the opcode, low 24 bits the
/// checkpoint index.
pub const DBG_COMMAND_MSG_MASK: u32 = 0xff00_0000;
pub const DBG_COMMAND_MSG_CREATE_CHECKPOINT: u32 = 0x0100_0000;
pub const DBG_COMMAND_MSG_DELETE_CHECKPOINT: u32 = 0x0200_0000;
pub const DBG_COMMAND_PARAM_MASK: u32 = 0x00ff_ffff;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DbgCommand {
    CreateCheckpoint(u32),
    DeleteCheckpoint(u32),
}

/// Decode one 32-bit word written to [`DBG_COMMAND_MAGIC_ADDRESS`].
pub fn decode_dbg_command(encoded: u32) -> Option<DbgCommand> {
    let param = encoded & DBG_COMMAND_PARAM_MASK;
    match encoded & DBG_COMMAND_MSG_MASK {
        DBG_COMMAND_MSG_CREATE_CHECKPOINT => Some(DbgCommand::CreateCheckpoint(param)),
        DBG_COMMAND_MSG_DELETE_CHECKPOINT => Some(DbgCommand::DeleteCheckpoint(param)),
        _ => None,
    }
}

/// Everything a debugger client needs to reach a listening server. Written
/// exactly once to the params pipe, as a single newline-terminated JSON
/// object, and only after listen() has succeeded.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DebuggerParams {
    pub host: String,
    pub port: u16,
    pub pid: pid_t,
    pub tgid: pid_t,
}

pub fn write_debugger_params(fd: &ScopedFd, params: &DebuggerParams) -> io::Result<()> {
    let mut buf = serde_json::to_vec(params)?;
    buf.push(b'\n');
    let mut written = 0;
    while written < buf.len() {
        match unistd::write(fd.as_raw(), &buf[written..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "params pipe closed while publishing",
                ))
            }
            Ok(n) => written += n,
            Err(e) => return Err(nix_to_io(e)),
        }
    }
    Ok(())
}

/// Blocks until the peer publishes its parameters or dies. The payload is
/// far below PIPE_BUF, so the peer's single write arrives whole; a read of
/// zero bytes can only mean the write end closed with nothing published.
pub fn read_debugger_params(fd: &ScopedFd) -> io::Result<DebuggerParams> {
    let mut buf = [0u8; 4096];
    let nread = unistd::read(fd.as_raw(), &mut buf).map_err(nix_to_io)?;
    if nread == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "debugger server died before publishing its connection parameters",
        ));
    }

    // Split always yields at least one piece.
    let line = buf[..nread].split(|&b| b == b'\n').next().unwrap();
    serde_json::from_slice(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

#[derive(Copy, Clone)]
pub struct GdbConnectionFeatures {
    pub reverse_execution: bool,
}

impl Default for GdbConnectionFeatures {
    fn default() -> Self {
        Self {
            reverse_execution: true,
        }
    }
}

/// A request from the debugger host that needs a response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GdbRequest {
    /// Read `len` bytes of tracee memory starting at `addr`.
    GetMem { addr: usize, len: usize },
    /// Write `value` into tracee memory at `addr`.
    SetMem { addr: usize, value: Vec<u8> },
    /// Resume execution of the tracee.
    Cont,
    /// Stop whatever the tracee is currently doing.
    Interrupt,
    /// End the debugging session.
    Detach,
}

/// This struct wraps up the state of the gdb remote protocol, so that we can
/// offer a (mostly) stateless interface to clients.
pub struct GdbConnection {
    /// gdb and rew don't work well together in multi-process debugging
    /// scenarios, so we pretend only this thread group exists when talking
    /// to gdb.
    tgid: pid_t,
    sock_fd: ScopedFd,
    features_: GdbConnectionFeatures,
}

impl GdbConnection {
    pub fn new(tgid: pid_t, features: GdbConnectionFeatures) -> GdbConnection {
        GdbConnection {
            tgid,
            sock_fd: ScopedFd::new(),
            features_: features,
        }
    }

    pub fn tgid(&self) -> pid_t {
        self.tgid
    }

    pub fn features(&self) -> GdbConnectionFeatures {
        self.features_
    }

    /// Wait for a debugger client to connect on `listen_fd`. Blocks
    /// indefinitely; there is no timeout and no retry.
    pub fn await_debugger(&mut self, listen_fd: &ScopedFd) {
        match accept4(listen_fd.as_raw(), SockFlag::SOCK_CLOEXEC) {
            Ok(fd) => self.sock_fd = ScopedFd::from_raw(fd),
            Err(e) => fatal!("Failed to accept debugger connection: {}", e),
        }
        // Keep the request/response ping-pong snappy.
        setsockopt(self.sock_fd.as_raw(), sockopt::TcpNoDelay, &true).unwrap_or(());
    }

    /// Return the current request made by the debugger host. Blocks until
    /// there is a request that needs a response or execution should be
    /// resumed.
    pub fn get_request(&mut self) -> GdbRequest {
        // @TODO Packet parsing is the next piece of the protocol layer to
        // land; the request types above are already what it decodes into.
        unimplemented!()
    }

    /// `ok` is true if a SET_MEM request succeeded, false otherwise. This
    /// must be called for every SET_MEM request, regardless of
    /// success/failure or special interpretation.
    pub fn reply_set_mem(&mut self, _ok: bool) {
        unimplemented!()
    }

    /// There's no functional reason to reply to the detach request, but
    /// some gdb versions time out awaiting a response.
    pub fn reply_detach(&mut self) {
        unimplemented!()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::{fcntl::OFlag, unistd::pipe2};

    #[test]
    fn decodes_checkpoint_creation() {
        assert_eq!(
            decode_dbg_command(0x0100_0001),
            Some(DbgCommand::CreateCheckpoint(1))
        );
        assert_eq!(
            decode_dbg_command(0x0200_0005),
            Some(DbgCommand::DeleteCheckpoint(5))
        );
    }

    #[test]
    fn index_occupies_the_low_24_bits() {
        assert_eq!(
            decode_dbg_command(0x01ff_ffff),
            Some(DbgCommand::CreateCheckpoint(0x00ff_ffff))
        );
    }

    #[test]
    fn unknown_opcodes_decode_to_nothing() {
        assert_eq!(decode_dbg_command(0x7f00_0001), None);
        assert_eq!(decode_dbg_command(0), None);
        assert_eq!(decode_dbg_command(0x00ff_ffff), None);
    }

    #[test]
    fn params_round_trip_through_a_pipe() {
        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let read_pipe = ScopedFd::from_raw(read_fd);
        let write_pipe = ScopedFd::from_raw(write_fd);

        let params = DebuggerParams {
            host: "127.0.0.1".into(),
            port: 33077,
            pid: 1234,
            tgid: 1230,
        };
        write_debugger_params(&write_pipe, &params).unwrap();
        assert_eq!(read_debugger_params(&read_pipe).unwrap(), params);
    }

    #[test]
    fn a_dead_peer_reads_as_eof_not_a_hang() {
        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let read_pipe = ScopedFd::from_raw(read_fd);
        // The server role dying unpublished closes the only write end.
        drop(ScopedFd::from_raw(write_fd));

        let err = read_debugger_params(&read_pipe).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn fork_discipline_makes_peer_death_observable() {
        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).unwrap();
        match unsafe { unistd::fork() }.unwrap() {
            unistd::ForkResult::Child => {
                // The server role: inherits the write end, dies without
                // ever publishing.
                unsafe { libc::_exit(0) }
            }
            unistd::ForkResult::Parent { child } => {
                let read_pipe = ScopedFd::from_raw(read_fd);
                // Close our copy of the write end right away; the child's
                // copy is now the only one keeping the pipe writable.
                drop(ScopedFd::from_raw(write_fd));

                let err = read_debugger_params(&read_pipe).unwrap_err();
                assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
                nix::sys::wait::waitpid(child, None).unwrap();
            }
        }
    }

    #[test]
    fn garbage_on_the_pipe_is_rejected() {
        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let read_pipe = ScopedFd::from_raw(read_fd);
        let write_pipe = ScopedFd::from_raw(write_fd);

        unistd::write(write_pipe.as_raw(), b"not json\n").unwrap();
        let err = read_debugger_params(&read_pipe).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
