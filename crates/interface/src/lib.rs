//! The data-transfer engine behind jetpipe's printer interface programs.
//!
//! An interface program's whole job is to move bytes between the spooler
//! driver (over a pipe pair) and one printer (over some transport), and to
//! report what happened in the driver's vocabulary: `%%[ ... ]%%` feedback
//! lines, operator alerts, and a taxonomy exit code. This crate supplies the
//! shared machinery — the [`engine`] copy loop, the [`mux`] readiness wait,
//! [`jobbreak`] control — and one [`Link`] implementation per transport:
//! parallel and USB ports, serial lines, raw TCP, AppleTalk PAP, and the
//! Axis PROS protocol.
//!
//! Transports differ wildly in how they connect, but once connected they all
//! present the same narrow [`Link`] capability to the same engine.

#![warn(missing_docs)]

/// The bidirectional copy loop and the per-job session driver.
pub mod engine;
/// The `IntError` taxonomy and OS-error classification.
pub mod error;
/// Job-break handshake and cancellation flags.
pub mod jobbreak;
/// Readiness waiting over the four engine endpoints.
pub mod mux;
/// `name=value` option-string parsing shared by all transports.
pub mod options;
/// The driver side of the pipe pair.
pub mod upstream;

/// Shared open/classify logic for character-device ports.
pub mod chardev;
/// Parallel port transport.
pub mod parallel;
/// AppleTalk Printer Access Protocol transport.
pub mod pap;
/// Axis PROS protocol transport.
#[cfg(feature = "tcp")]
pub mod pros;
/// Serial port transport.
#[cfg(feature = "serial")]
pub mod serial;
/// Raw TCP (jetdirect-style) transport.
#[cfg(feature = "tcp")]
pub mod tcp;
/// USB line-printer port transport.
pub mod usb;

pub use engine::{CopyOutcome, EngineOptions, run_copy_job, run_session};
pub use error::{IntError, classify, report_failure};
pub use jobbreak::{BreakHandle, JobBreak};
pub use mux::{Interest, Multiplexer, PollMultiplexer, Ready};
pub use upstream::StdUpstream;

use jetpipe_core::feedback::PrinterFault;

// ── Traits ──────────────────────────────────────────────────────────────

/// Outcome of one non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were placed at the front of the buffer.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// The other side has closed; no more data will come.
    Closed,
}

/// Outcome of one non-blocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// This many bytes were accepted (possibly fewer than offered).
    Wrote(usize),
    /// The other side cannot accept anything right now.
    WouldBlock,
}

/// One open connection to a printer.
///
/// Every transport ends up here after its connect dance: a pair of
/// non-blocking byte channels plus a few protocol hooks the engine calls at
/// the right moments. Raw ports take all the defaults; the protocol
/// transports (PAP, PROS) override the end-of-job and flow-control hooks.
pub trait Link {
    /// Read printer-to-host data. Protocol transports return only payload
    /// here, consuming control messages internally.
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, IntError>;

    /// Write job data toward the printer.
    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, IntError>;

    /// Mark the end of the current job on the wire.
    fn end_of_job(&mut self) -> Result<(), IntError> {
        Ok(())
    }

    /// Whether the end-of-job marker has been acknowledged. The engine keeps
    /// servicing reads until this reports `true`.
    fn job_done(&self) -> bool {
        true
    }

    /// Whether the remote end is ready to receive job data. Protocols with a
    /// job-acceptance handshake hold this at `false` until it completes.
    fn ready_for_data(&self) -> bool {
        true
    }

    /// Largest write the connection will accept, for flow-quantum protocols.
    fn max_write(&self) -> usize {
        usize::MAX
    }

    /// Emit the transport's keepalive when the engine has been idle for the
    /// configured interval.
    fn keepalive(&mut self) -> Result<(), IntError> {
        Ok(())
    }

    /// Out-of-band port status check, fired on the engine's status timer.
    fn poll_status(&mut self) -> Result<Option<PrinterFault>, IntError> {
        Ok(None)
    }
}

/// The driver side: job data in, printer messages out.
pub trait Upstream {
    /// Read job data from the driver. `Closed` means the job stream is over.
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, IntError>;

    /// Relay printer output back to the driver.
    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, IntError>;
}
