use self::exit_result::ExitResult;

pub mod exit_result;
pub mod gdb_server;
pub mod replay_command;
pub mod rew_options;

pub trait RewCommand {
    fn run(&mut self) -> ExitResult<()>;
}
