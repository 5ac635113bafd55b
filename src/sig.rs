use crate::kernel_metadata::signal_name;
use fmt::Formatter;
use io::ErrorKind;
use nix::sys::signal::Signal;
use std::{convert::TryFrom, fmt, fmt::Display, io};

pub const SIGINT: Sig = Sig(libc::SIGINT);
pub const SIGKILL: Sig = Sig(libc::SIGKILL);
pub const SIGTERM: Sig = Sig(libc::SIGTERM);
pub const SIGCHLD: Sig = Sig(libc::SIGCHLD);
pub const SIGURG: Sig = Sig(libc::SIGURG);
pub const SIGWINCH: Sig = Sig(libc::SIGWINCH);

/// A signal number known to be in the valid range.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Sig(i32);

impl Sig {
    pub fn as_str(&self) -> String {
        signal_name(self.0)
    }

    pub fn as_raw(self) -> i32 {
        self.0
    }

    /// Nix can't deal with realtime signals as of writing this so this
    /// method could fatally fail.
    pub fn as_nix_signal(&self) -> Signal {
        match Signal::try_from(self.0) {
            Ok(s) => s,
            Err(e) => fatal!("Could not convert `{}` to nix signal: {:?}", self.0, e),
        }
    }
}

impl TryFrom<i32> for Sig {
    type Error = io::Error;

    fn try_from(sig: i32) -> Result<Self, Self::Error> {
        if sig > 0 && sig < 0x80 {
            Ok(Sig(sig))
        } else {
            Err(io::Error::new(
                ErrorKind::Other,
                format!("Invalid signal `{}`", sig),
            ))
        }
    }
}

impl Display for Sig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_signals() {
        assert!(Sig::try_from(0).is_err());
        assert!(Sig::try_from(-3).is_err());
        assert!(Sig::try_from(0x80).is_err());
        assert_eq!(Sig::try_from(libc::SIGTERM).unwrap(), SIGTERM);
    }

    #[test]
    fn displays_kernel_names() {
        assert_eq!(SIGWINCH.to_string(), "SIGWINCH");
        assert_eq!(SIGURG.to_string(), "SIGURG");
    }
}
