//! Raw terminal mode for the serial console.
//!
//! The guest console is bound to stdin/stdout. Before binding, stdin is
//! switched to raw mode so keystrokes reach the guest byte for byte.

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;

/// Raw mode on a terminal, restored on drop.
pub struct RawModeGuard {
    fd: RawFd,
    original: libc::termios,
}

impl RawModeGuard {
    /// Put stdin into raw mode.
    ///
    /// Returns `Ok(None)` when stdin is not a terminal.
    pub fn stdin() -> io::Result<Option<Self>> {
        Self::enable(libc::STDIN_FILENO)
    }

    /// Put `fd` into raw mode.
    pub fn enable(fd: RawFd) -> io::Result<Option<Self>> {
        // SAFETY: isatty only inspects the fd.
        if unsafe { libc::isatty(fd) } != 1 {
            tracing::debug!(fd, "not a terminal, leaving console mode unchanged");
            return Ok(None);
        }

        let mut original: MaybeUninit<libc::termios> = MaybeUninit::uninit();
        // SAFETY: tcgetattr fills the termios struct on success.
        if unsafe { libc::tcgetattr(fd, original.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: initialized by the successful tcgetattr above.
        let original = unsafe { original.assume_init() };

        let raw = raw_attributes(&original);
        // SAFETY: raw is a valid termios derived from the current settings.
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } != 0 {
            return Err(io::Error::last_os_error());
        }

        tracing::debug!(fd, "terminal switched to raw mode");
        Ok(Some(Self { fd, original }))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        // SAFETY: restores the settings captured in enable().
        if unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, &self.original) } != 0 {
            tracing::debug!(fd = self.fd, error = %io::Error::last_os_error(), "failed to restore terminal");
        }
    }
}

/// Settings with canonical mode, echo and CR-to-NL translation disabled.
fn raw_attributes(original: &libc::termios) -> libc::termios {
    let mut raw = *original;
    raw.c_lflag &= !(libc::ICANON | libc::ECHO);
    raw.c_iflag &= !libc::ICRNL;
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_attributes_clear_flags() {
        // SAFETY: termios is plain data; all-zero is a valid value.
        let mut original: libc::termios = unsafe { std::mem::zeroed() };
        original.c_lflag = libc::ICANON | libc::ECHO | libc::ISIG;
        original.c_iflag = libc::ICRNL | libc::IXON;

        let raw = raw_attributes(&original);
        assert_eq!(raw.c_lflag & (libc::ICANON | libc::ECHO), 0);
        assert_eq!(raw.c_iflag & libc::ICRNL, 0);
        // Untouched flags survive.
        assert_ne!(raw.c_lflag & libc::ISIG, 0);
        assert_ne!(raw.c_iflag & libc::IXON, 0);
    }

    #[test]
    fn test_non_terminal_is_noop() {
        let file = tempfile::tempfile().unwrap();
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&file);
        assert!(RawModeGuard::enable(fd).unwrap().is_none());
    }
}
