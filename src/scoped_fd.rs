use nix::unistd::close;
use std::os::unix::io::RawFd;

/// An owned file descriptor, closed when the owner goes out of scope.
///
/// We DON'T want this to be Copy or Clone because of the Drop.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> Self {
        ScopedFd { fd: -1 }
    }

    pub fn from_raw(fd: RawFd) -> Self {
        ScopedFd { fd }
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // We swallow any error on close
            close(self.fd).unwrap_or(());
        }

        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Hand the descriptor to someone else; this ScopedFd no longer closes it.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::{
        fcntl::{fcntl, FcntlArg, OFlag},
        unistd::pipe2,
    };

    #[test]
    fn drop_closes_the_descriptor() {
        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).unwrap();
        {
            let _read = ScopedFd::from_raw(read_fd);
            let _write = ScopedFd::from_raw(write_fd);
            assert!(fcntl(read_fd, FcntlArg::F_GETFD).is_ok());
        }
        assert!(fcntl(read_fd, FcntlArg::F_GETFD).is_err());
        assert!(fcntl(write_fd, FcntlArg::F_GETFD).is_err());
    }

    #[test]
    fn extract_relinquishes_ownership() {
        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let mut fd = ScopedFd::from_raw(read_fd);
        assert_eq!(fd.extract(), read_fd);
        assert!(!fd.is_open());
        drop(fd);
        assert!(fcntl(read_fd, FcntlArg::F_GETFD).is_ok());
        close(read_fd).unwrap();
        close(write_fd).unwrap();
    }
}
