//! PROS protocol transport.
//!
//! PROS is the job-submission protocol spoken by Axis print servers on TCP
//! port 35. Every message is a one-byte opcode; a set data bit means a
//! 16-bit big-endian length and payload follow. The client logs in with a
//! block of identification messages, streams job data, and marks the end of
//! each job with an EOF message which the server acknowledges once the data
//! has really left the printer port.
//!
//! The address is `queue@host[:port]`; with no `@` the whole address is the
//! host and the queue defaults to `LPT1`.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use jetpipe_core::feedback::{FeedbackLine, FeedbackWriter, PrinterFault};
use jetpipe_core::CommandContext;

use crate::chardev::reject_signal_jobbreak;
use crate::engine::EngineOptions;
use crate::error::IntError;
use crate::options;
use crate::tcp::{self, TcpOptions};
use crate::{Link, ReadOutcome, WriteOutcome};

/// The IANA port of the PROS service.
pub const DEFAULT_PORT: u16 = 35;

const DEFAULT_QUEUE: &str = "LPT1";
const DEFAULT_PASSWORD: &str = "netprinter";

/// The server drops clients that go quiet after EOF; a periodic NOP keeps
/// the session alive while we wait for the final acknowledgement.
const NOP_INTERVAL: Duration = Duration::from_secs(55);

/// Largest payload staged into a single data message.
const MAX_DATA: usize = 4096;

/// A message with this bit carries a length-prefixed payload.
const DATA_BIT: u8 = 0x80;
/// An error message with this bit ends the job.
const FATAL_BIT: u8 = 0x40;

/// Client message opcodes.
mod client {
    pub(super) const EOF: u8 = 32;
    pub(super) const UID: u8 = 33;
    pub(super) const HST: u8 = 34;
    pub(super) const PRN: u8 = 35;
    pub(super) const PAS: u8 = 36;
    pub(super) const DTP: u8 = 37;
    pub(super) const NOP: u8 = 38;
}

/// Server message opcodes (after masking the data and fatal bits).
mod server {
    pub(super) const JOK: u8 = 48;
    pub(super) const JST: u8 = 49;
    pub(super) const ACC: u8 = 50;
    pub(super) const DFP: u8 = 51;
    pub(super) const BSY: u8 = 52;

    // Error report codes.
    pub(super) const POC: u8 = 3;
    pub(super) const OFL: u8 = 7;
    pub(super) const EOP: u8 = 8;
}

/// Encode one message: opcode, then a big-endian length and payload when
/// there is one.
fn pack(code: u8, payload: &[u8]) -> Vec<u8> {
    if payload.is_empty() {
        return vec![code];
    }
    debug_assert!(payload.len() <= usize::from(u16::MAX));
    let len = payload.len() as u16;
    let mut out = Vec::with_capacity(3 + payload.len());
    out.push(code | DATA_BIT);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// One decoded server message.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    code: u8,
    payload: Vec<u8>,
}

/// Incremental message decoder. TCP gives no framing guarantees, so a
/// message may arrive split across reads; undecoded bytes carry over.
#[derive(Debug, Default)]
struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next_frame(&mut self) -> Option<Frame> {
        let code = *self.buf.first()?;
        if code & DATA_BIT == 0 {
            self.buf.drain(..1);
            return Some(Frame {
                code,
                payload: Vec::new(),
            });
        }
        if self.buf.len() < 3 {
            return None;
        }
        let len = usize::from(u16::from_be_bytes([self.buf[1], self.buf[2]]));
        if self.buf.len() < 3 + len {
            return None;
        }
        let payload = self.buf[3..3 + len].to_vec();
        self.buf.drain(..3 + len);
        Some(Frame { code, payload })
    }
}

/// Split `queue@host[:port]` into its queue and host parts.
fn split_address(address: &str) -> (&str, &str) {
    match address.split_once('@') {
        Some((queue, host)) => (queue, host),
        None => (DEFAULT_QUEUE, address),
    }
}

/// Options accepted by the PROS transport.
#[derive(Debug, Clone)]
pub struct ProsOptions {
    /// The shared TCP connection options.
    pub tcp: TcpOptions,
    /// Password sent in the login block.
    pub password: String,
}

impl ProsOptions {
    /// Parse the option string, applying this transport's defaults.
    pub fn parse(ctx: &CommandContext) -> Result<Self, IntError> {
        let mut tcp = TcpOptions::defaults(ctx);
        // The NOP tickle is protocol traffic, not a status query, so it
        // stays on even without a feedback channel.
        tcp.idle_status_interval = Some(NOP_INTERVAL);
        let mut password = DEFAULT_PASSWORD.to_owned();

        for pair in options::parse_pairs(&ctx.options)? {
            if pair.name == "password" {
                password = pair.value.clone();
                continue;
            }
            if !tcp.apply(&pair)? {
                return Err(options::unrecognized(&pair));
            }
        }
        Ok(Self { tcp, password })
    }

    /// The engine settings these options imply.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            idle_status_interval: self.tcp.idle_status_interval,
            status_interval: None,
            preamble: Vec::new(),
        }
    }
}

/// Session state driven by decoded server messages.
#[derive(Debug, Default)]
struct ProsState {
    /// The server has accepted the job and wants data.
    accepting_data: bool,
    /// The EOF of the current job has been acknowledged.
    job_acked: bool,
    /// Bytes destined for the driver's feedback channel.
    pending: VecDeque<u8>,
}

impl ProsState {
    fn queue_line(&mut self, line: &FeedbackLine) {
        self.pending.extend(line.to_string().bytes());
        self.pending.push_back(b'\n');
    }

    fn dispatch(&mut self, frame: &Frame) -> Result<(), IntError> {
        let fatal = frame.code & FATAL_BIT != 0;
        let base = frame.code & !(DATA_BIT | FATAL_BIT);
        match base {
            server::JST => self.accepting_data = true,
            server::JOK => self.job_acked = true,
            server::ACC => {
                tracing::debug!(
                    report = %String::from_utf8_lossy(&frame.payload),
                    "accounting report"
                );
            }
            server::DFP => self.pending.extend(frame.payload.iter().copied()),
            server::BSY => self.queue_line(&FeedbackLine::StatusBusy),
            server::POC => {
                return Err(IntError::Engaged(
                    "the print server's port is occupied".to_owned(),
                ));
            }
            server::OFL if !fatal => {
                self.queue_line(&FeedbackLine::PrinterError(PrinterFault::Offline));
            }
            server::EOP if !fatal => {
                self.queue_line(&FeedbackLine::PrinterError(PrinterFault::OutOfPaper));
            }
            other if fatal => {
                return Err(IntError::PrinterError {
                    context: format!("the print server reported fatal error {other}"),
                    source: None,
                });
            }
            other => tracing::debug!(code = other, "ignoring server message"),
        }
        Ok(())
    }

    fn drain(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        for slot in buf.iter_mut().take(n) {
            // The count above guarantees the queue is non-empty here.
            if let Some(byte) = self.pending.pop_front() {
                *slot = byte;
            }
        }
        n
    }
}

/// A [`Link`] speaking the PROS protocol over a connected socket.
pub struct ProsLink {
    stream: TcpStream,
    decoder: FrameDecoder,
    state: ProsState,
    /// A staged data message not yet fully on the wire.
    wire: Vec<u8>,
    wire_off: usize,
    staged: usize,
    eof_sent: bool,
}

impl ProsLink {
    /// Connect to the print server and send the login block.
    pub fn open<W: Write>(
        ctx: &CommandContext,
        opts: &ProsOptions,
        fb: &mut FeedbackWriter<W>,
    ) -> Result<Self, IntError> {
        reject_signal_jobbreak(ctx, "pros")?;

        let (queue, host) = split_address(&ctx.address);
        if queue.is_empty() || host.is_empty() {
            return Err(IntError::InvalidAddress(format!(
                "malformed printer address \"{}\"",
                ctx.address
            )));
        }
        let addr = tcp::parse_address(host, DEFAULT_PORT)?;
        let stream = tcp::connect(addr, &opts.tcp, fb)?;

        let mut link = Self {
            stream,
            decoder: FrameDecoder::default(),
            state: ProsState::default(),
            wire: Vec::new(),
            wire_off: 0,
            staged: 0,
            eof_sent: false,
        };
        link.send_login(queue, &opts.password)?;
        Ok(link)
    }

    /// The descriptor for readiness registration.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }

    fn send_login(&mut self, queue: &str, password: &str) -> Result<(), IntError> {
        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_owned());
        let user = std::env::var("USER").unwrap_or_else(|_| "ppr".to_owned());

        let mut block = Vec::new();
        block.extend_from_slice(&pack(client::HST, hostname.as_bytes()));
        block.extend_from_slice(&pack(client::UID, user.as_bytes()));
        block.extend_from_slice(&pack(client::PRN, queue.as_bytes()));
        block.extend_from_slice(&pack(client::PAS, password.as_bytes()));
        self.send_blocking(&block)
    }

    /// Write a complete message, briefly switching the socket to blocking
    /// mode. Used only outside the copy loop, where stalling is acceptable.
    fn send_blocking(&mut self, bytes: &[u8]) -> Result<(), IntError> {
        self.stream.set_nonblocking(false).map_err(wire_err)?;
        let result = self.stream.write_all(bytes).map_err(wire_err);
        self.stream.set_nonblocking(true).map_err(wire_err)?;
        result
    }

    fn pump_frames(&mut self) -> Result<(), IntError> {
        while let Some(frame) = self.decoder.next_frame() {
            self.state.dispatch(&frame)?;
        }
        Ok(())
    }
}

fn wire_err(e: io::Error) -> IntError {
    IntError::PrinterError {
        context: "write to print server failed".to_owned(),
        source: Some(e),
    }
}

impl Link for ProsLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, IntError> {
        let drained = self.state.drain(buf);
        if drained > 0 {
            return Ok(ReadOutcome::Data(drained));
        }

        let mut scratch = [0u8; 512];
        match self.stream.read(&mut scratch) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => {
                self.decoder.push(&scratch[..n]);
                self.pump_frames()?;
                match self.state.drain(buf) {
                    0 => Ok(ReadOutcome::WouldBlock),
                    n => Ok(ReadOutcome::Data(n)),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(IntError::PrinterError {
                context: "read from print server failed".to_owned(),
                source: Some(e),
            }),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, IntError> {
        if self.wire.is_empty() {
            let take = buf.len().min(MAX_DATA);
            self.wire = pack(client::DTP, &buf[..take]);
            self.wire_off = 0;
            self.staged = take;
        }
        match self.stream.write(&self.wire[self.wire_off..]) {
            Ok(n) => {
                self.wire_off += n;
                if self.wire_off == self.wire.len() {
                    self.wire.clear();
                    self.wire_off = 0;
                    Ok(WriteOutcome::Wrote(self.staged))
                } else {
                    // Partial message on the wire; the payload is committed
                    // but not yet deliverable, so report no progress.
                    Ok(WriteOutcome::Wrote(0))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(WriteOutcome::WouldBlock),
            Err(e) => Err(wire_err(e)),
        }
    }

    fn end_of_job(&mut self) -> Result<(), IntError> {
        self.state.job_acked = false;
        self.send_blocking(&pack(client::EOF, &[]))?;
        self.eof_sent = true;
        Ok(())
    }

    fn job_done(&self) -> bool {
        self.state.job_acked
    }

    fn ready_for_data(&self) -> bool {
        self.state.accepting_data
    }

    fn max_write(&self) -> usize {
        MAX_DATA
    }

    fn keepalive(&mut self) -> Result<(), IntError> {
        if !self.eof_sent {
            return Ok(());
        }
        match self.stream.write(&pack(client::NOP, &[])) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(wire_err(e)),
        }
    }
}
