//! Serial port transport.
//!
//! The address is a device node such as `/dev/ttyS0`. Line settings come
//! from the options; the port is opened exclusive and non-blocking, and the
//! printer's modem lines can be watched before the job starts so an
//! off-line printer is reported instead of silently stalling.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

use jetpipe_core::context::{Codes, Jobbreak};
use jetpipe_core::feedback::{FeedbackLine, FeedbackWriter, PrinterFault};
use jetpipe_core::CommandContext;
use serialport::{DataBits, FlowControl, Parity, SerialPort, TTYPort};

use crate::chardev::{reject_binary_codes, reject_signal_jobbreak};
use crate::engine::EngineOptions;
use crate::error::{IntError, classify};
use crate::options;
use crate::{Link, ReadOutcome, WriteOutcome};

const CONTROL_T: u8 = 0x14;

const BUSY_RETRIES: u32 = 30;
const BUSY_RETRY_INTERVAL: Duration = Duration::from_secs(2);

const ONLINE_WAIT_TRIES: u32 = 20;
const ONLINE_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// The line speeds a POSIX tty accepts. Kept sorted for binary search.
const VALID_SPEEDS: &[u32] = &[
    300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800,
];

/// Which modem lines must be asserted before the job starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlineCheck {
    /// Data Set Ready (the usual printer-ready line).
    Dsr,
    /// Clear To Send.
    Cts,
    /// Both DSR and CTS.
    DsrAndCts,
    /// Skip the check; trust the cable.
    None,
}

/// Options accepted by the serial transport.
#[derive(Debug, Clone)]
pub struct SerialOptions {
    /// Line speed in bits per second.
    pub speed: u32,
    /// Data bits per character.
    pub bits: DataBits,
    /// Parity setting.
    pub parity: Parity,
    /// Software (XON/XOFF) flow control.
    pub xonxoff: bool,
    /// Hardware (RTS/CTS) flow control.
    pub rtscts: bool,
    /// Modem lines checked before the job starts.
    pub online: OnlineCheck,
    /// Keepalive interval while the outbound side is idle.
    pub idle_status_interval: Option<Duration>,
}

impl SerialOptions {
    /// Parse the option string, applying this transport's defaults.
    pub fn parse(ctx: &CommandContext) -> Result<Self, IntError> {
        let default_idle = (ctx.status_queries_usable() && ctx.jobbreak == Jobbreak::ControlD)
            .then(|| Duration::from_secs(15));
        let mut opts = Self {
            speed: 9600,
            bits: DataBits::Eight,
            parity: Parity::None,
            xonxoff: true,
            rtscts: false,
            online: OnlineCheck::Dsr,
            idle_status_interval: default_idle,
        };

        for pair in options::parse_pairs(&ctx.options)? {
            match pair.name.as_str() {
                "speed" => {
                    let speed = options::parse_u32(&pair)?;
                    if VALID_SPEEDS.binary_search(&speed).is_err() {
                        return Err(IntError::InvalidOption(format!(
                            "\"speed={speed}\" is not a speed this system supports"
                        )));
                    }
                    opts.speed = speed;
                }
                "bits" => {
                    opts.bits = match pair.value.as_str() {
                        "7" => DataBits::Seven,
                        "8" => DataBits::Eight,
                        _ => {
                            return Err(IntError::InvalidOption(
                                "\"bits=\" must be 7 or 8".to_owned(),
                            ));
                        }
                    }
                }
                "parity" => {
                    opts.parity = match pair.value.as_str() {
                        "none" => Parity::None,
                        "even" => Parity::Even,
                        "odd" => Parity::Odd,
                        _ => {
                            return Err(IntError::InvalidOption(
                                "\"parity=\" must be none, even, or odd".to_owned(),
                            ));
                        }
                    }
                }
                "xonxoff" => opts.xonxoff = options::parse_bool(&pair)?,
                "rtscts" => opts.rtscts = options::parse_bool(&pair)?,
                "online" => {
                    opts.online = match pair.value.as_str() {
                        "dsr" => OnlineCheck::Dsr,
                        "cts" => OnlineCheck::Cts,
                        "dsr+cts" | "cts+dsr" => OnlineCheck::DsrAndCts,
                        "none" => OnlineCheck::None,
                        _ => {
                            return Err(IntError::InvalidOption(
                                "\"online=\" must be dsr, cts, dsr+cts, or none".to_owned(),
                            ));
                        }
                    }
                }
                "idle_status_interval" => {
                    opts.idle_status_interval = options::parse_interval(&pair)?;
                }
                _ => return Err(options::unrecognized(&pair)),
            }
        }

        if opts.xonxoff && opts.rtscts {
            return Err(IntError::InvalidOption(
                "\"xonxoff=\" and \"rtscts=\" cannot both be on".to_owned(),
            ));
        }
        // A 7-bit line can only carry jobs declared clean-7-bit (or left
        // undeclared); everything else needs all eight bits through.
        if opts.bits == DataBits::Seven
            && !matches!(ctx.codes, Codes::Unknown | Codes::Clean7Bit)
        {
            return Err(IntError::IncompatibleJob(
                "this job needs an 8-bit channel but the port is set for 7 data bits".to_owned(),
            ));
        }
        if !ctx.status_queries_usable() {
            opts.idle_status_interval = None;
        }
        Ok(opts)
    }

    fn flow_control(&self) -> FlowControl {
        if self.xonxoff {
            FlowControl::Software
        } else if self.rtscts {
            FlowControl::Hardware
        } else {
            FlowControl::None
        }
    }

    /// The engine settings these options imply.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            idle_status_interval: self.idle_status_interval,
            status_interval: None,
            preamble: Vec::new(),
        }
    }
}

/// A [`Link`] over an open serial port.
pub struct SerialLink {
    port: TTYPort,
}

impl SerialLink {
    /// Open and configure the port, then wait for the printer to come on
    /// line.
    pub fn open<W: Write>(
        ctx: &CommandContext,
        opts: &SerialOptions,
        fb: &mut FeedbackWriter<W>,
    ) -> Result<Self, IntError> {
        reject_signal_jobbreak(ctx, "serial")?;
        reject_binary_codes(ctx, "serial")?;

        let builder = serialport::new(&ctx.address, opts.speed)
            .data_bits(opts.bits)
            .parity(opts.parity)
            .flow_control(opts.flow_control())
            .timeout(Duration::ZERO);

        let mut attempt = 0u32;
        let mut port = loop {
            match builder.clone().open_native() {
                Ok(port) => break port,
                Err(e) => {
                    let io_err: io::Error = e.into();
                    if io_err.raw_os_error() == Some(nix::libc::EBUSY) && attempt < BUSY_RETRIES {
                        attempt += 1;
                        tracing::debug!(attempt, port = %ctx.address, "port busy, retrying");
                        std::thread::sleep(BUSY_RETRY_INTERVAL);
                        continue;
                    }
                    return Err(classify("open", &ctx.address, io_err));
                }
            }
        };
        port.set_exclusive(true)
            .map_err(|e| classify("open", &ctx.address, e.into()))?;

        let mut link = Self { port };
        link.wait_online(opts, fb)?;
        Ok(link)
    }

    /// The descriptor for readiness registration.
    pub fn fd(&self) -> BorrowedFd<'_> {
        // Safety: the raw fd belongs to the TTYPort we own and stays open
        // for the lifetime of the borrow.
        unsafe { BorrowedFd::borrow_raw(self.port.as_raw_fd()) }
    }

    fn online_now(&mut self, check: OnlineCheck) -> Result<bool, IntError> {
        match check {
            OnlineCheck::None => Ok(true),
            OnlineCheck::Dsr => self.port.read_data_set_ready().map_err(line_err),
            OnlineCheck::Cts => self.port.read_clear_to_send().map_err(line_err),
            OnlineCheck::DsrAndCts => {
                Ok(self.port.read_data_set_ready().map_err(line_err)?
                    && self.port.read_clear_to_send().map_err(line_err)?)
            }
        }
    }

    /// Give the printer a couple of seconds to assert its ready lines,
    /// then report it off line.
    fn wait_online<W: Write>(
        &mut self,
        opts: &SerialOptions,
        fb: &mut FeedbackWriter<W>,
    ) -> Result<(), IntError> {
        if opts.online == OnlineCheck::None {
            return Ok(());
        }
        for _ in 0..ONLINE_WAIT_TRIES {
            if self.online_now(opts.online)? {
                return Ok(());
            }
            std::thread::sleep(ONLINE_WAIT_INTERVAL);
        }
        let _ = fb.send(FeedbackLine::PrinterError(PrinterFault::Offline));
        Err(IntError::Engaged("printer is off line".to_owned()))
    }
}

fn line_err(e: serialport::Error) -> IntError {
    IntError::PrinterError {
        context: "reading serial port modem lines failed".to_owned(),
        source: Some(e.into()),
    }
}

impl Link for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, IntError> {
        match self.port.read(buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            // With a zero timeout an empty port reports TimedOut.
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(ReadOutcome::WouldBlock)
            }
            Err(e) => Err(IntError::PrinterError {
                context: "read from printer port failed".to_owned(),
                source: Some(e),
            }),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, IntError> {
        match self.port.write(buf) {
            Ok(n) => Ok(WriteOutcome::Wrote(n)),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(WriteOutcome::WouldBlock)
            }
            Err(e) => Err(IntError::PrinterError {
                context: "write to printer port failed".to_owned(),
                source: Some(e),
            }),
        }
    }

    fn keepalive(&mut self) -> Result<(), IntError> {
        match self.port.write(&[CONTROL_T]) {
            Ok(_) => Ok(()),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(())
            }
            Err(e) => Err(IntError::PrinterError {
                context: "write to printer port failed".to_owned(),
                source: Some(e),
            }),
        }
    }
}
