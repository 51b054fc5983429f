//! The driver side of an interface process: its own stdin and stdout.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use nix::fcntl::{FcntlArg, OFlag, fcntl};

use crate::error::IntError;
use crate::{ReadOutcome, Upstream, WriteOutcome};

/// Put a descriptor into non-blocking mode, preserving its other flags.
pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<(), IntError> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(fcntl_err)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(fcntl_err)?;
    Ok(())
}

fn fcntl_err(errno: nix::errno::Errno) -> IntError {
    IntError::PrinterError {
        context: "fcntl() on pipe failed".to_owned(),
        source: Some(io::Error::from_raw_os_error(errno as i32)),
    }
}

/// The standard pipe pair the driver connects to an interface process:
/// job data arrives on stdin, printer messages leave on stdout.
pub struct StdUpstream {
    input: io::Stdin,
    output: io::Stdout,
}

impl StdUpstream {
    /// Wrap stdin and stdout, switching both to non-blocking mode so the
    /// engine only ever blocks in the multiplexer.
    pub fn new() -> Result<Self, IntError> {
        let input = io::stdin();
        let output = io::stdout();
        set_nonblocking(input.as_fd())?;
        set_nonblocking(output.as_fd())?;
        Ok(Self { input, output })
    }

    /// The descriptor to register for read readiness.
    pub fn input_fd(&self) -> BorrowedFd<'_> {
        self.input.as_fd()
    }

    /// The descriptor to register for write readiness.
    pub fn output_fd(&self) -> BorrowedFd<'_> {
        self.output.as_fd()
    }
}

impl Upstream for StdUpstream {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, IntError> {
        match self.input.read(buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(IntError::Upstream(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, IntError> {
        match self.output.write(buf) {
            Ok(n) => Ok(WriteOutcome::Wrote(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(WriteOutcome::WouldBlock),
            Err(e) => Err(IntError::Upstream(e)),
        }
    }
}
