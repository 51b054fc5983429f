//! Parallel port transport.
//!
//! The address is a device node such as `/dev/lp0`. Beyond the shared
//! character-device contract this transport can read the port's status
//! lines (selected, paper-out, error) and pulse the reset line, both via
//! the line-printer driver's ioctls.

use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

use jetpipe_core::context::Jobbreak;
use jetpipe_core::feedback::{FeedbackLine, FeedbackWriter, PrinterFault};
use jetpipe_core::CommandContext;
use nix::libc;

use crate::chardev::{CharDevLink, open_port, reject_binary_codes, reject_signal_jobbreak};
use crate::engine::EngineOptions;
use crate::error::IntError;
use crate::options::{self, parse_bool, parse_interval};
use crate::{Link, ReadOutcome, WriteOutcome};

// Status lines reported by the Linux lp driver.
const LP_POUTPA: i32 = 0x20; // out-of-paper, active high
const LP_PSELECD: i32 = 0x10; // selected, active high
const LP_PERRORP: i32 = 0x08; // error, active low

nix::ioctl_read_bad!(lp_get_status, 0x060b, libc::c_int);
nix::ioctl_none_bad!(lp_reset, 0x060c);

/// Options accepted by the parallel transport.
#[derive(Debug, Clone)]
pub struct ParallelOptions {
    /// Keepalive interval while the outbound side is idle.
    pub idle_status_interval: Option<Duration>,
    /// Interval between port status-line checks during the job.
    pub status_interval: Option<Duration>,
    /// Pulse the reset line before the job.
    pub reset_before: bool,
    /// Pulse the reset line if the job is canceled.
    pub reset_on_cancel: bool,
}

impl ParallelOptions {
    /// Parse the option string, applying this transport's defaults.
    ///
    /// The idle keepalive defaults to 15 seconds when the feedback channel
    /// is open and control-D handshaking is in use; it is forced off for
    /// non-PostScript jobs, which would misinterpret the control byte.
    pub fn parse(ctx: &CommandContext) -> Result<Self, IntError> {
        let default_idle = (ctx.status_queries_usable() && ctx.jobbreak == Jobbreak::ControlD)
            .then(|| Duration::from_secs(15));
        let mut opts = Self {
            idle_status_interval: default_idle,
            status_interval: None,
            reset_before: true,
            reset_on_cancel: false,
        };

        for pair in options::parse_pairs(&ctx.options)? {
            match pair.name.as_str() {
                "idle_status_interval" => opts.idle_status_interval = parse_interval(&pair)?,
                "status_interval" => opts.status_interval = parse_interval(&pair)?,
                "reset_before" => opts.reset_before = parse_bool(&pair)?,
                "reset_on_cancel" => opts.reset_on_cancel = parse_bool(&pair)?,
                _ => return Err(options::unrecognized(&pair)),
            }
        }

        if !ctx.status_queries_usable() {
            opts.idle_status_interval = None;
        }
        Ok(opts)
    }

    /// The engine settings these options imply.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            idle_status_interval: self.idle_status_interval,
            status_interval: self.status_interval,
            preamble: Vec::new(),
        }
    }
}

/// Map raw lp driver status bits to the reportable fault, if any.
///
/// Off line masks the other conditions; a printer that is off line because
/// it ran out of paper should first be reported off line.
fn fault_from_raw(raw: i32) -> Option<PrinterFault> {
    if raw & LP_PSELECD == 0 {
        Some(PrinterFault::Offline)
    } else if raw & LP_POUTPA != 0 {
        Some(PrinterFault::OutOfPaper)
    } else if raw & LP_PERRORP == 0 {
        Some(PrinterFault::Miscellaneous)
    } else {
        None
    }
}

/// A [`Link`] over an open parallel port.
pub struct ParallelLink {
    dev: CharDevLink,
    reset_on_cancel: bool,
}

impl ParallelLink {
    /// Open the port, optionally reset it, and verify the status lines.
    ///
    /// A pre-job fault is reported on the feedback channel and comes back
    /// as an "engaged" error so the driver retries once the operator has
    /// dealt with the printer.
    pub fn open<W: Write>(
        ctx: &CommandContext,
        opts: &ParallelOptions,
        fb: &mut FeedbackWriter<W>,
    ) -> Result<Self, IntError> {
        reject_signal_jobbreak(ctx, "parallel")?;
        reject_binary_codes(ctx, "parallel")?;

        let file = open_port(Path::new(&ctx.address), ctx)?;
        let link = Self {
            dev: CharDevLink::new(file),
            reset_on_cancel: opts.reset_on_cancel,
        };

        if opts.reset_before {
            link.reset()?;
        }

        if let Some(fault) = link.port_fault()? {
            let _ = fb.send(FeedbackLine::PrinterError(fault));
            return Err(IntError::Engaged(format!("printer reports {fault}")));
        }

        Ok(link)
    }

    /// The underlying device, for readiness registration.
    pub fn dev(&self) -> &CharDevLink {
        &self.dev
    }

    /// Read the port status lines.
    pub fn port_fault(&self) -> Result<Option<PrinterFault>, IntError> {
        let fd = self.dev.fd().as_raw_fd();
        let mut raw: libc::c_int = 0;
        // Safety: fd is an open lp device and raw is a valid out-pointer.
        unsafe { lp_get_status(fd, &mut raw) }.map_err(ioctl_err)?;
        Ok(fault_from_raw(raw))
    }

    /// Pulse the reset line.
    pub fn reset(&self) -> Result<(), IntError> {
        let fd = self.dev.fd().as_raw_fd();
        // Safety: fd is an open lp device.
        unsafe { lp_reset(fd) }.map_err(ioctl_err)?;
        Ok(())
    }

    /// Cleanup after a canceled job.
    pub fn handle_cancel(&self) -> Result<(), IntError> {
        if self.reset_on_cancel {
            self.reset()?;
        }
        Ok(())
    }
}

fn ioctl_err(errno: nix::errno::Errno) -> IntError {
    IntError::PrinterError {
        context: "parallel port ioctl failed".to_owned(),
        source: Some(std::io::Error::from_raw_os_error(errno as i32)),
    }
}

impl Link for ParallelLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, IntError> {
        self.dev.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, IntError> {
        self.dev.write(buf)
    }

    fn keepalive(&mut self) -> Result<(), IntError> {
        self.dev.keepalive()
    }

    fn poll_status(&mut self) -> Result<Option<PrinterFault>, IntError> {
        self.port_fault()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(options: &str) -> CommandContext {
        let mut ctx = CommandContext::new("prn", "/dev/lp0");
        ctx.options = options.to_owned();
        ctx
    }

    #[test]
    fn defaults() {
        let opts = ParallelOptions::parse(&ctx_with("")).unwrap();
        assert!(opts.reset_before);
        assert!(!opts.reset_on_cancel);
        assert_eq!(opts.idle_status_interval, None);
        assert_eq!(opts.status_interval, None);
    }

    #[test]
    fn keepalive_default_needs_feedback_and_control_d() {
        let mut ctx = ctx_with("");
        ctx.feedback = true;
        ctx.jobbreak = Jobbreak::ControlD;
        let opts = ParallelOptions::parse(&ctx).unwrap();
        assert_eq!(opts.idle_status_interval, Some(Duration::from_secs(15)));

        // A foreign job language forces it back off.
        ctx.barbarlang = "pcl".into();
        let opts = ParallelOptions::parse(&ctx).unwrap();
        assert_eq!(opts.idle_status_interval, None);
    }

    #[test]
    fn option_overrides() {
        let opts =
            ParallelOptions::parse(&ctx_with("reset_before=no reset_on_cancel=yes status_interval=5"))
                .unwrap();
        assert!(!opts.reset_before);
        assert!(opts.reset_on_cancel);
        assert_eq!(opts.status_interval, Some(Duration::from_secs(5)));
    }

    #[test]
    fn unknown_option_rejected() {
        assert!(matches!(
            ParallelOptions::parse(&ctx_with("spee=9600")),
            Err(IntError::InvalidOption(_))
        ));
    }

    #[test]
    fn fault_mapping() {
        // Selected, no paper-out, no error: healthy.
        assert_eq!(fault_from_raw(LP_PSELECD | LP_PERRORP), None);
        // Deselected dominates everything.
        assert_eq!(
            fault_from_raw(LP_POUTPA | LP_PERRORP),
            Some(PrinterFault::Offline)
        );
        assert_eq!(
            fault_from_raw(LP_PSELECD | LP_POUTPA | LP_PERRORP),
            Some(PrinterFault::OutOfPaper)
        );
        assert_eq!(
            fault_from_raw(LP_PSELECD),
            Some(PrinterFault::Miscellaneous)
        );
    }
}
