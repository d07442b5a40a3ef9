//! Raw byte channel to the serial device.
//!
//! This module is the only place in the crate that performs physical I/O
//! syscalls. It hands bytes back and forth without interpreting them:
//! escape sequences, pacing and charset discipline all live above it.
//!
//! `SerialChannel` opens a tty device exclusively, switches it to raw mode
//! and exposes poll-bounded reads plus partial-write-tolerant writes. The
//! `ByteChannel` trait is the seam the output pump and input reader are
//! written against, so tests can drive them with in-memory channels.

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::debug;
use nix::fcntl::OFlag;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::stat::Mode;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
use nix::unistd::{read, write};
use thiserror::Error;

/// Largest burst drained from the device in a single read.
const READ_BUF_SIZE: usize = 512;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("device {path} unavailable: {source}")]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to set raw mode: {0}")]
    RawMode(#[source] nix::Error),

    #[error("poll failed: {0}")]
    Poll(#[source] nix::Error),

    #[error("read failed: {0}")]
    Read(#[source] nix::Error),

    #[error("write failed: {0}")]
    Write(#[source] nix::Error),

    #[error("device closed by peer")]
    Disconnected,

    #[error("channel is closed")]
    Closed,
}

/// Uninterpreted byte transport to the terminal device.
///
/// Writes are exclusive to the output pump and reads to the input reader;
/// both sides may hold the same channel because every method takes
/// `&self`.
pub trait ByteChannel: Send + Sync {
    /// Write as many bytes as the device will take right now.
    ///
    /// A short (or zero) count means the far end asserted flow control or
    /// the buffer filled; callers must loop over the remainder. Zero is
    /// not an error.
    fn write(&self, buf: &[u8]) -> Result<usize, ChannelError>;

    /// Read whatever is available, blocking at most `timeout`.
    ///
    /// An empty result means the timeout expired, not an error.
    fn read_available(&self, timeout: Duration) -> Result<Vec<u8>, ChannelError>;

    /// Stop the channel. Idempotent.
    fn close(&self);
}

/// The real device channel over a tty path.
#[derive(Debug)]
pub struct SerialChannel {
    fd: OwnedFd,
    path: PathBuf,
    closed: AtomicBool,
}

impl SerialChannel {
    /// Open `path` exclusively and put it in raw mode.
    ///
    /// Fails with `DeviceUnavailable` if the device does not exist or is
    /// already claimed by another process.
    pub fn open(path: &Path) -> Result<Self, ChannelError> {
        let raw_fd = nix::fcntl::open(
            path,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|source| ChannelError::DeviceUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
        // SAFETY: raw_fd was just returned by a successful open()
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        // SAFETY: TIOCEXCL is a valid ioctl for a tty fd and takes no
        // argument
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCEXCL) };
        if rc < 0 {
            return Err(ChannelError::DeviceUnavailable {
                path: path.to_path_buf(),
                source: nix::Error::last(),
            });
        }

        let mut termios = tcgetattr(&fd).map_err(ChannelError::RawMode)?;
        cfmakeraw(&mut termios);
        tcsetattr(&fd, SetArg::TCSANOW, &termios).map_err(ChannelError::RawMode)?;

        debug!("opened serial channel on {}", path.display());
        Ok(SerialChannel {
            fd,
            path: path.to_path_buf(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteChannel for SerialChannel {
    fn write(&self, buf: &[u8]) -> Result<usize, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        match write(self.fd.as_raw_fd(), buf) {
            Ok(n) => Ok(n),
            // Flow control asserted or kernel buffer full: report a zero
            // write, the pump retries the remainder.
            Err(nix::Error::EAGAIN) => Ok(0),
            Err(e) => Err(ChannelError::Write(e)),
        }
    }

    fn read_available(&self, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }

        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let borrowed = self.fd.as_fd();
        let mut fds = [PollFd::new(&borrowed, PollFlags::POLLIN)];
        let n = poll(&mut fds, timeout_ms).map_err(ChannelError::Poll)?;
        let readable = n > 0
            && fds[0]
                .revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP));
        if !readable {
            return Ok(Vec::new());
        }

        let mut buf = [0u8; READ_BUF_SIZE];
        match read(self.fd.as_raw_fd(), &mut buf) {
            Ok(0) => Err(ChannelError::Disconnected),
            Ok(n) => Ok(buf[..n].to_vec()),
            // Readiness can evaporate between poll and read.
            Err(nix::Error::EAGAIN) => Ok(Vec::new()),
            Err(nix::Error::EIO) => Err(ChannelError::Disconnected),
            Err(e) => Err(ChannelError::Read(e)),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("closed serial channel on {}", self.path.display());
        }
    }
}
