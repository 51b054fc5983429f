//! Raw TCP transport for jetdirect-style print servers.
//!
//! The address is `host[:port]`. Data is shoved down the socket unframed;
//! whatever comes back is printer feedback. The interesting part is the
//! connect dance: pocket print servers refuse connections while busy with
//! another client, so refusal is retried and then reported as "engaged"
//! rather than as an error.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use jetpipe_core::context::Jobbreak;
use jetpipe_core::feedback::{FeedbackLine, FeedbackWriter};
use jetpipe_core::CommandContext;
use socket2::{Domain, Socket, Type};

use crate::engine::EngineOptions;
use crate::error::IntError;
use crate::options::{self, parse_bool, parse_interval, parse_u32};
use crate::{Link, ReadOutcome, WriteOutcome};

/// The conventional raw-socket print port.
pub const DEFAULT_PORT: u16 = 9100;

const CONTROL_T: u8 = 0x14;
const REFUSED_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Options accepted by the TCP transport.
#[derive(Debug, Clone)]
pub struct TcpOptions {
    /// Report a refused connection as "engaged" (printer busy) rather than
    /// as a printer error.
    pub refused_engaged: bool,
    /// How many times to retry a refused connection before giving up.
    pub refused_retries: u32,
    /// Hard deadline on each connection attempt. The print server's own
    /// notion of a timeout cannot be trusted.
    pub connect_timeout: Duration,
    /// Requested SO_SNDBUF size.
    pub sndbuf_size: Option<usize>,
    /// Bind the local end to this port; some print servers only accept
    /// connections from privileged or otherwise fixed source ports.
    pub source_port: Option<u16>,
    /// Seconds to linger after closing; pocket print servers drop
    /// connections made too soon after the previous job.
    pub sleep: Option<Duration>,
    /// Keepalive interval while the outbound side is idle.
    pub idle_status_interval: Option<Duration>,
}

impl TcpOptions {
    /// The defaults before any option string is applied.
    pub(crate) fn defaults(ctx: &CommandContext) -> Self {
        let default_idle = (ctx.status_queries_usable() && ctx.jobbreak == Jobbreak::ControlD)
            .then(|| Duration::from_secs(15));
        Self {
            refused_engaged: true,
            refused_retries: 5,
            connect_timeout: Duration::from_secs(20),
            sndbuf_size: None,
            source_port: None,
            sleep: None,
            idle_status_interval: default_idle,
        }
    }

    /// Apply one option pair. Returns false for names this transport does
    /// not know, so protocols layered on TCP can handle their own options
    /// while sharing these.
    pub(crate) fn apply(&mut self, pair: &options::OptionPair) -> Result<bool, IntError> {
        match pair.name.as_str() {
            "refused" => match pair.value.as_str() {
                "engaged" => self.refused_engaged = true,
                "error" => self.refused_engaged = false,
                _ => {
                    return Err(IntError::InvalidOption(
                        "\"refused=\" must be \"engaged\" or \"error\"".to_owned(),
                    ));
                }
            },
            "refused_retries" => self.refused_retries = parse_u32(pair)?,
            "connect_timeout" => {
                let secs = parse_u32(pair)?;
                if secs == 0 {
                    return Err(IntError::InvalidOption(
                        "\"connect_timeout=\" must be positive".to_owned(),
                    ));
                }
                self.connect_timeout = Duration::from_secs(u64::from(secs));
            }
            "sndbuf_size" => {
                let size = parse_u32(pair)?;
                if size == 0 {
                    return Err(IntError::InvalidOption(
                        "\"sndbuf_size=\" must be positive".to_owned(),
                    ));
                }
                self.sndbuf_size = Some(size as usize);
            }
            "source_port" => {
                let port = parse_u32(pair)?;
                let port = u16::try_from(port).map_err(|_| {
                    IntError::InvalidOption("\"source_port=\" must fit a TCP port".to_owned())
                })?;
                self.source_port = Some(port);
            }
            "sleep" => self.sleep = parse_interval(pair)?,
            "idle_status_interval" => self.idle_status_interval = parse_interval(pair)?,
            // Accepted for queue compatibility; the engine's keepalive
            // covers the same need.
            "keepalive" => {
                let _ = parse_bool(pair)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Parse the option string, applying this transport's defaults.
    pub fn parse(ctx: &CommandContext) -> Result<Self, IntError> {
        let mut opts = Self::defaults(ctx);
        for pair in options::parse_pairs(&ctx.options)? {
            if !opts.apply(&pair)? {
                return Err(options::unrecognized(&pair));
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
            status_interval: None,
            preamble: Vec::new(),
        }
    }
}

/// Parse `host[:port]` into a socket address, resolving names via DNS.
///
/// Whitespace anywhere in the address is a configuration mistake (a pasted
/// hostname with a trailing tab has burned people before) and is rejected
/// rather than trimmed.
pub fn parse_address(address: &str, default_port: u16) -> Result<SocketAddr, IntError> {
    if address.is_empty() || address.contains(char::is_whitespace) {
        return Err(IntError::InvalidAddress(format!(
            "malformed printer address \"{address}\""
        )));
    }

    let (host, port) = match address.rsplit_once(':') {
        Some((host, port_str)) => {
            let port: u16 = port_str.parse().map_err(|_| {
                IntError::InvalidAddress(format!("bad port number \"{port_str}\""))
            })?;
            (host, port)
        }
        None => (address, default_port),
    };
    if host.is_empty() {
        return Err(IntError::InvalidAddress(format!(
            "malformed printer address \"{address}\""
        )));
    }

    // Numeric addresses never touch the resolver.
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut addrs = (host, port).to_socket_addrs().map_err(|_| IntError::LookupFailed {
        name: host.to_owned(),
        transient: true,
    })?;
    addrs.next().ok_or_else(|| IntError::LookupFailed {
        name: host.to_owned(),
        transient: true,
    })
}

/// Connect with a hard deadline and the refusal-retry policy.
pub fn connect<W: Write>(
    addr: SocketAddr,
    opts: &TcpOptions,
    fb: &mut FeedbackWriter<W>,
) -> Result<TcpStream, IntError> {
    let _ = fb.send(FeedbackLine::Connecting);

    let mut attempt = 0u32;
    loop {
        // A fresh socket per attempt; a socket that has failed a connect
        // is in an indeterminate state on several platforms.
        let socket =
            Socket::new(Domain::for_address(addr), Type::STREAM, None).map_err(IntError::Starved)?;
        socket.set_keepalive(true).map_err(sockopt_err)?;
        if let Some(size) = opts.sndbuf_size {
            socket.set_send_buffer_size(size).map_err(sockopt_err)?;
        }
        if let Some(port) = opts.source_port {
            let local: SocketAddr = match addr {
                SocketAddr::V4(_) => (std::net::Ipv4Addr::UNSPECIFIED, port).into(),
                SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, port).into(),
            };
            socket.set_reuse_address(true).map_err(sockopt_err)?;
            socket.bind(&local.into()).map_err(sockopt_err)?;
        }

        match socket.connect_timeout(&addr.into(), opts.connect_timeout) {
            Ok(()) => {
                let _ = fb.send(FeedbackLine::Connected);
                let stream: TcpStream = socket.into();
                stream.set_nonblocking(true).map_err(sockopt_err)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(IntError::NotResponding {
                    what: format!("{addr} (no answer within {:?})", opts.connect_timeout),
                    source: Some(e),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                if attempt < opts.refused_retries {
                    attempt += 1;
                    tracing::debug!(attempt, %addr, "connection refused, retrying");
                    std::thread::sleep(REFUSED_RETRY_INTERVAL);
                    continue;
                }
                return Err(if opts.refused_engaged {
                    IntError::Engaged(format!("{addr} refused the connection"))
                } else {
                    IntError::PrinterError {
                        context: format!("{addr} refused the connection"),
                        source: Some(e),
                    }
                });
            }
            Err(e) => {
                return Err(IntError::NotResponding {
                    what: addr.to_string(),
                    source: Some(e),
                });
            }
        }
    }
}

/// A [`Link`] over a connected raw socket.
pub struct TcpLink {
    stream: TcpStream,
    sleep_after_close: Option<Duration>,
}

impl TcpLink {
    /// Parse the context's address, connect, and wrap the stream.
    pub fn open<W: Write>(
        ctx: &CommandContext,
        opts: &TcpOptions,
        fb: &mut FeedbackWriter<W>,
    ) -> Result<Self, IntError> {
        let addr = parse_address(&ctx.address, DEFAULT_PORT)?;
        let stream = connect(addr, opts, fb)?;
        Ok(Self {
            stream,
            sleep_after_close: opts.sleep,
        })
    }

    /// The descriptor for readiness registration.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }

    /// Close the connection and give the print server its recovery pause.
    pub fn shutdown(self) {
        let sleep = self.sleep_after_close;
        drop(self.stream);
        if let Some(pause) = sleep {
            tracing::debug!(?pause, "pausing for print server recovery");
            std::thread::sleep(pause);
        }
    }
}

fn sockopt_err(e: io::Error) -> IntError {
    IntError::PrinterError {
        context: "socket configuration failed".to_owned(),
        source: Some(e),
    }
}

impl Link for TcpLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, IntError> {
        match self.stream.read(buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(IntError::PrinterError {
                context: "read from printer connection failed".to_owned(),
                source: Some(e),
            }),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, IntError> {
        match self.stream.write(buf) {
            Ok(n) => Ok(WriteOutcome::Wrote(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(WriteOutcome::WouldBlock),
            Err(e) => Err(IntError::PrinterError {
                context: "write to printer connection failed".to_owned(),
                source: Some(e),
            }),
        }
    }

    fn keepalive(&mut self) -> Result<(), IntError> {
        // Optional traffic; a failure here will surface on the next real write.
        let _ = self.stream.write(&[CONTROL_T]);
        Ok(())
    }
}
