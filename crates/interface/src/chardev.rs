//! Shared open logic for character-device printer ports.
//!
//! The parallel, USB, and serial transports all talk to a device node with
//! the same contract: the node must be a character device, it is opened
//! exclusively and non-blocking, a busy port is retried patiently before
//! reporting "engaged", and every other open failure classifies into the
//! exit taxonomy.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use jetpipe_core::context::Codes;
use jetpipe_core::CommandContext;
use nix::libc;
use nix::sys::stat::{SFlag, stat};

use crate::error::{IntError, classify};
use crate::{Link, ReadOutcome, WriteOutcome};

/// How many times to retry a busy port, two seconds apart, before giving
/// the driver an "engaged" exit and letting its scheduler back off.
const BUSY_RETRIES: u32 = 30;
const BUSY_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// The keepalive byte for raw PostScript channels: control-T asks the
/// interpreter for a one-line status report.
const CONTROL_T: u8 = 0x14;

/// Open a printer device node under the character-device contract.
///
/// The port is opened read-write only when the feedback channel is on;
/// otherwise write-only, since reading a unidirectional port would block
/// forever on some drivers.
pub fn open_port(path: &Path, ctx: &CommandContext) -> Result<File, IntError> {
    let port = path.display().to_string();

    // A failed stat() is ignored; open() classifies the error better.
    if let Ok(st) = stat(path) {
        let fmt = SFlag::from_bits_truncate(st.st_mode & SFlag::S_IFMT.bits());
        if fmt != SFlag::S_IFCHR {
            return Err(IntError::InvalidAddress(format!(
                "\"{port}\" is not a character device"
            )));
        }
    }

    let mut opts = OpenOptions::new();
    opts.write(true)
        .read(ctx.feedback)
        .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY | libc::O_EXCL);

    open_with_retries(&port, BUSY_RETRIES, BUSY_RETRY_INTERVAL, || opts.open(path))
}

/// Retry a busy port a bounded number of times. An exhausted budget still
/// classifies the EBUSY as engaged, not as a dead printer.
fn open_with_retries(
    port: &str,
    retries: u32,
    interval: Duration,
    mut open: impl FnMut() -> io::Result<File>,
) -> Result<File, IntError> {
    let mut attempt = 0u32;
    loop {
        match open() {
            Ok(file) => return Ok(file),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < retries => {
                attempt += 1;
                tracing::debug!(attempt, port, "port busy, retrying");
                std::thread::sleep(interval);
            }
            Err(e) => return Err(classify("open", port, e)),
        }
    }
}

/// Reject the signal job-break methods for transports whose connection
/// cannot carry the handshake.
pub fn reject_signal_jobbreak(ctx: &CommandContext, transport: &str) -> Result<(), IntError> {
    if ctx.jobbreak.uses_signal() {
        return Err(IntError::IncompatibleJob(format!(
            "the \"signal\" jobbreak methods do not work with the {transport} transport"
        )));
    }
    Ok(())
}

/// Reject jobs that need fully transparent binary transmission on ports
/// that cannot guarantee it.
pub fn reject_binary_codes(ctx: &CommandContext, transport: &str) -> Result<(), IntError> {
    if ctx.codes == Codes::Binary {
        return Err(IntError::IncompatibleJob(format!(
            "the codes setting \"Binary\" does not work with the {transport} transport"
        )));
    }
    Ok(())
}

/// A [`Link`] over an open character device.
pub struct CharDevLink {
    file: File,
}

impl CharDevLink {
    /// Wrap an already-opened port.
    pub fn new(file: File) -> Self {
        Self { file }
    }

    /// The descriptor for readiness registration.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Link for CharDevLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, IntError> {
        match self.file.read(buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(IntError::PrinterError {
                context: "read from printer port failed".to_owned(),
                source: Some(e),
            }),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, IntError> {
        match self.file.write(buf) {
            Ok(n) => Ok(WriteOutcome::Wrote(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(WriteOutcome::WouldBlock),
            Err(e) => Err(IntError::PrinterError {
                context: "write to printer port failed".to_owned(),
                source: Some(e),
            }),
        }
    }

    fn keepalive(&mut self) -> Result<(), IntError> {
        // A refused keepalive is not worth an error; it was optional traffic.
        match self.file.write(&[CONTROL_T]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(IntError::PrinterError {
                context: "write to printer port failed".to_owned(),
                source: Some(e),
            }),
        }
    }
}
