//! Advisory `%%[ ... ]%%` lines written toward the spooler driver.
//!
//! The driver scans the interface's output pipe for lines in the PostScript
//! message convention and relays them to the job log and the queue display.
//! Interfaces emit them for conditions the printer itself cannot report,
//! such as "still trying to connect". The vocabulary is fixed; the driver
//! matches these strings literally.

use std::fmt;
use std::io::{self, Write};

/// A printer-side condition worth telling the operator about.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterFault {
    /// The printer reports itself off line.
    Offline,
    /// The printer is out of paper.
    OutOfPaper,
    /// A fault the port can detect but not identify.
    Miscellaneous,
}

impl fmt::Display for PrinterFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PrinterFault::Offline => "off line",
            PrinterFault::OutOfPaper => "out of paper",
            PrinterFault::Miscellaneous => "miscellaneous error",
        })
    }
}

/// One advisory line in the fixed vocabulary.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackLine {
    /// Attempting to reach the printer; shown while retries are in progress.
    Connecting,
    /// The connection is up and the job is about to flow.
    Connected,
    /// The printer answered but is serving someone else.
    StatusBusy,
    /// A detected printer fault.
    PrinterError(PrinterFault),
}

impl fmt::Display for FeedbackLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedbackLine::Connecting => write!(f, "%%[ PPR connecting ]%%"),
            FeedbackLine::Connected => write!(f, "%%[ PPR connected ]%%"),
            FeedbackLine::StatusBusy => write!(f, "%%[ status: busy ]%%"),
            FeedbackLine::PrinterError(fault) => {
                write!(f, "%%[ PrinterError: {fault} ]%%")
            }
        }
    }
}

/// Writes advisory lines toward the driver, flushing after each one.
///
/// The flush matters: the driver may sit in a blocking read on this pipe
/// while the interface is stuck in a connect retry loop, and a buffered
/// "connecting" message would defeat its purpose.
pub struct FeedbackWriter<W: Write> {
    sink: W,
}

impl FeedbackWriter<io::Stdout> {
    /// A writer on standard output, where the driver reads.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> FeedbackWriter<W> {
    /// A writer on an arbitrary sink (tests use a buffer).
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    /// Emit one advisory line and flush.
    pub fn send(&mut self, line: FeedbackLine) -> io::Result<()> {
        writeln!(self.sink, "{line}")?;
        self.sink.flush()
    }

    /// Relay status text the printer itself composed, such as an
    /// AppleTalk status string already in `%%[ ... ]%%` form.
    pub fn send_verbatim(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.sink, "{}", text.trim_end())?;
        self.sink.flush()
    }

    /// Take back the sink.
    pub fn into_inner(self) -> W {
        self.sink
    }
}
