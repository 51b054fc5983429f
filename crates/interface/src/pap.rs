//! AppleTalk Printer Access Protocol transport.
//!
//! The address is an NBP entity, `name:type@zone`. Before a connection can
//! be opened the entity must be resolved to a network address by NBP
//! lookup; resolved addresses are cached on disk because lookups broadcast
//! to the whole zone.
//!
//! The famous wrinkle is renaming. A LaserWriter fresh out of reset
//! registers under the type `LaserWriter`; a spooler that wants the printer
//! for itself looks it up under its own queue type, and when that fails,
//! finds it under `LaserWriter`, connects, and downloads a snippet that
//! changes the advertised type before reconnecting under the proper name.
//!
//! The actual datagram plumbing lives behind [`PapTransport`] so the
//! connection state machine stays independent of any particular AppleTalk
//! stack.

use std::fmt;
use std::io::Write;
use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use std::time::Duration;

use jetpipe_core::feedback::FeedbackWriter;
use jetpipe_core::CommandContext;

use crate::engine::EngineOptions;
use crate::error::IntError;
use crate::options;
use crate::{Link, ReadOutcome, WriteOutcome};

/// An NBP name may not exceed this many characters per field.
const NBP_FIELD_MAX: usize = 32;

/// The type a printer registers under until somebody renames it.
const GENERIC_TYPE: &str = "LaserWriter";

/// A cached address older than this must be confirmed before use.
const CACHE_FRESH: Duration = Duration::from_secs(20);

/// PAP flow quantum granularity and the protocol's ceiling on it.
const QUANTUM_BYTES: usize = 512;
const MAX_QUANTUM: u8 = 8;

const BUSY_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// The ExitServer job that changes a printer's advertised NBP type.
const RENAME_JOB: &str = "%!PS-Adobe-3.0 ExitServer\n\
0 serverdict begin exitserver\n\
statusdict begin\n\
currentdict /appletalktype known{/appletalktype}{/product}ifelse\n\
({}) def\n\
end\n\
%%EOF\n";

// ── Entity names ──

/// A parsed NBP entity, `name:type@zone`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PapEntity {
    /// Object name.
    pub name: String,
    /// Registered type.
    pub entity_type: String,
    /// Zone, `*` meaning the local zone.
    pub zone: String,
}

impl PapEntity {
    /// Parse an address of the form `name:type@zone`. The zone may be
    /// omitted, in which case the local zone is meant.
    pub fn parse(address: &str) -> Result<Self, IntError> {
        let bad = || IntError::InvalidAddress(format!("malformed printer address \"{address}\""));

        let (front, zone) = match address.split_once('@') {
            Some((front, zone)) => (front, zone),
            None => (address, "*"),
        };
        let (name, entity_type) = front.split_once(':').ok_or_else(bad)?;

        for field in [name, entity_type, zone] {
            if field.is_empty() || field.len() > NBP_FIELD_MAX {
                return Err(bad());
            }
        }
        Ok(Self {
            name: name.to_owned(),
            entity_type: entity_type.to_owned(),
            zone: zone.to_owned(),
        })
    }

    /// The same entity under a different type.
    fn with_type(&self, entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_owned(),
            ..self.clone()
        }
    }
}

impl fmt::Display for PapEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.name, self.entity_type, self.zone)
    }
}

// ── Address cache ──

/// A resolved AppleTalk network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PapAddr {
    /// Network number.
    pub net: u16,
    /// Node on that network.
    pub node: u8,
    /// PAP listener socket on that node.
    pub socket: u8,
}

/// What the cache knows about a printer's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    /// Nothing cached; a full lookup is needed.
    Unknown,
    /// Cached but old; confirm it is still right before connecting.
    MustConfirm(PapAddr),
    /// Cached and fresh enough to trust outright.
    Recent(PapAddr),
}

fn state_for(addr: PapAddr, age: Duration) -> CacheState {
    if age < CACHE_FRESH {
        CacheState::Recent(addr)
    } else {
        CacheState::MustConfirm(addr)
    }
}

/// Disk cache of one printer's resolved address.
struct AddressCache {
    path: Option<PathBuf>,
}

impl AddressCache {
    fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    fn load(&self) -> CacheState {
        let Some(path) = &self.path else {
            return CacheState::Unknown;
        };
        let Ok(text) = std::fs::read_to_string(path) else {
            return CacheState::Unknown;
        };
        let Some(addr) = parse_cache_line(&text) else {
            return CacheState::Unknown;
        };
        let age = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .unwrap_or(Duration::MAX);
        state_for(addr, age)
    }

    fn store(&self, addr: PapAddr) {
        if let Some(path) = &self.path {
            let line = format!("{} {} {}\n", addr.net, addr.node, addr.socket);
            if let Err(e) = std::fs::write(path, line) {
                tracing::debug!(error = %e, "could not update the address cache");
            }
        }
    }

    fn forget(&self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn parse_cache_line(text: &str) -> Option<PapAddr> {
    let mut fields = text.split_whitespace();
    let net = fields.next()?.parse().ok()?;
    let node = fields.next()?.parse().ok()?;
    let socket = fields.next()?.parse().ok()?;
    Some(PapAddr { net, node, socket })
}

// ── Transport seam ──

/// The result of a PAP connection attempt.
#[derive(Debug, Clone)]
pub enum PapOpen {
    /// The printer is serving another client. The status string is in the
    /// printer's own `%%[ ... ]%%` form.
    Busy {
        /// Printer-composed status text.
        status: String,
    },
    /// Connected.
    Open {
        /// The flow quantum the printer offered.
        remote_quantum: u8,
        /// Printer-composed status text at open time.
        status: String,
    },
}

/// The datagram-level operations of an AppleTalk stack.
///
/// One connection at a time; `open` replaces any previous connection.
pub trait PapTransport {
    /// NBP lookup. An empty answer means no such printer; more than one
    /// answer means the name is ambiguous.
    fn lookup(&mut self, entity: &PapEntity) -> Result<Vec<PapAddr>, IntError>;
    /// Confirm a previously resolved address. `None` means the printer no
    /// longer answers there.
    fn confirm(&mut self, entity: &PapEntity, addr: PapAddr)
    -> Result<Option<PapAddr>, IntError>;
    /// Open a PAP connection.
    fn open(&mut self, addr: PapAddr) -> Result<PapOpen, IntError>;
    /// Read feedback data from the open connection.
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, IntError>;
    /// Write job data; `eof` marks the end of the job.
    fn write(&mut self, buf: &[u8], eof: bool) -> Result<WriteOutcome, IntError>;
    /// Close the open connection.
    fn close(&mut self) -> Result<(), IntError>;
    /// The descriptor to poll for readiness, if the stack exposes one.
    fn fd(&self) -> Option<BorrowedFd<'_>>;
}

// ── Options ──

/// Options accepted by the PAP transport.
#[derive(Debug, Clone)]
pub struct PapOptions {
    /// Whether the printer understands the PostScript rename job. Off for
    /// PAP devices that merely imitate a LaserWriter.
    pub is_laserwriter: bool,
    /// How many times to retry a busy connection before reporting engaged.
    pub open_retries: u32,
    /// How many NBP lookups to attempt before declaring the printer absent.
    pub lookup_retries: u32,
    /// Pause between lookup attempts.
    pub lookup_interval: Duration,
    /// Keepalive interval while the outbound side is idle.
    pub idle_status_interval: Option<Duration>,
    /// Where to cache the resolved address, if anywhere.
    pub address_cache: Option<PathBuf>,
}

impl PapOptions {
    /// Parse the option string, applying this transport's defaults.
    pub fn parse(ctx: &CommandContext) -> Result<Self, IntError> {
        let mut opts = Self {
            is_laserwriter: true,
            open_retries: 0,
            lookup_retries: 8,
            lookup_interval: Duration::from_secs(1),
            idle_status_interval: None,
            address_cache: None,
        };

        for pair in options::parse_pairs(&ctx.options)? {
            match pair.name.as_str() {
                "is_laserwriter" => opts.is_laserwriter = options::parse_bool(&pair)?,
                "open_retries" => opts.open_retries = options::parse_u32(&pair)?,
                "lookup_retries" => {
                    let n = options::parse_u32(&pair)?;
                    if n == 0 {
                        return Err(IntError::InvalidOption(
                            "\"lookup_retries=\" must be at least 1".to_owned(),
                        ));
                    }
                    opts.lookup_retries = n;
                }
                "lookup_interval" => {
                    let secs = options::parse_u32(&pair)?;
                    if secs == 0 {
                        return Err(IntError::InvalidOption(
                            "\"lookup_interval=\" must be at least 1".to_owned(),
                        ));
                    }
                    opts.lookup_interval = Duration::from_secs(u64::from(secs));
                }
                "idle_status_interval" => {
                    opts.idle_status_interval = options::parse_interval(&pair)?;
                }
                "address_cache" => opts.address_cache = Some(PathBuf::from(&pair.value)),
                _ => return Err(options::unrecognized(&pair)),
            }
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

// ── Connection state machine ──

/// A [`Link`] over an open PAP connection.
#[derive(Debug)]
pub struct PapLink<T: PapTransport> {
    transport: T,
    /// Write quantum granted by the printer, clamped to the protocol max.
    wlen: usize,
    awaiting_ack: bool,
    acked: bool,
}

impl<T: PapTransport> PapLink<T> {
    /// Resolve the printer's address, connect, and rename the printer if
    /// that is what it takes to find it.
    pub fn open<W: Write>(
        transport: T,
        ctx: &CommandContext,
        opts: &PapOptions,
        fb: &mut FeedbackWriter<W>,
    ) -> Result<Self, IntError> {
        let entity = PapEntity::parse(&ctx.address)?;
        let cache = AddressCache::new(opts.address_cache.clone());

        let mut link = Self {
            transport,
            wlen: QUANTUM_BYTES,
            awaiting_ack: false,
            acked: false,
        };
        link.connect(&entity, &cache, opts, fb)?;
        Ok(link)
    }

    /// The descriptor for readiness registration, if the stack has one.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.transport.fd()
    }

    fn connect<W: Write>(
        &mut self,
        wanted: &PapEntity,
        cache: &AddressCache,
        opts: &PapOptions,
        fb: &mut FeedbackWriter<W>,
    ) -> Result<(), IntError> {
        let mut entity = wanted.clone();
        let mut renamed = false;

        loop {
            let addr = self.resolve(&entity, cache, opts)?;

            let Some(addr) = addr else {
                // Nobody answers to this name. Perhaps the printer has
                // been reset and is back to calling itself a LaserWriter.
                if entity.entity_type == GENERIC_TYPE || renamed || !opts.is_laserwriter {
                    if renamed {
                        tracing::error!(
                            printer = %wanted,
                            "printer not found, and not under \"{GENERIC_TYPE}\" either"
                        );
                        return Err(IntError::NotResponding {
                            what: format!(
                                "\"{wanted}\" does not answer, nor does \"{}\"",
                                wanted.with_type(GENERIC_TYPE)
                            ),
                            source: None,
                        });
                    }
                    tracing::error!(printer = %entity, "printer not found");
                    return Err(IntError::NotResponding {
                        what: format!("\"{entity}\" does not answer NBP lookups"),
                        source: None,
                    });
                }
                tracing::info!(
                    printer = %wanted,
                    "not found under its own type, trying \"{GENERIC_TYPE}\""
                );
                entity = wanted.with_type(GENERIC_TYPE);
                continue;
            };

            let (remote_quantum, status) = self.open_with_retries(addr, opts, fb)?;
            // Whatever the printer said at open time goes to the operator
            // if it was complaining about something.
            if status.contains("PrinterError:") {
                let _ = fb.send_verbatim(&status);
            }
            self.wlen = usize::from(remote_quantum.min(MAX_QUANTUM).max(1)) * QUANTUM_BYTES;

            if entity.entity_type != wanted.entity_type {
                // Connected under the generic type; teach the printer its
                // proper name, then start over under that name.
                self.rename_printer(&wanted.entity_type)?;
                self.transport.close()?;
                cache.forget();
                renamed = true;
                entity = wanted.clone();
                continue;
            }
            return Ok(());
        }
    }

    /// Resolve the entity via the cache, confirming or re-looking-up as
    /// its freshness demands. `None` means the printer is not out there.
    fn resolve(
        &mut self,
        entity: &PapEntity,
        cache: &AddressCache,
        opts: &PapOptions,
    ) -> Result<Option<PapAddr>, IntError> {
        match cache.load() {
            CacheState::Recent(addr) => return Ok(Some(addr)),
            CacheState::MustConfirm(addr) => {
                if let Some(confirmed) = self.transport.confirm(entity, addr)? {
                    cache.store(confirmed);
                    return Ok(Some(confirmed));
                }
                cache.forget();
            }
            CacheState::Unknown => {}
        }

        for attempt in 0..opts.lookup_retries {
            if attempt > 0 {
                std::thread::sleep(opts.lookup_interval);
            }
            let answers = self.transport.lookup(entity)?;
            match answers.len() {
                0 => {}
                1 => {
                    cache.store(answers[0]);
                    return Ok(Some(answers[0]));
                }
                n => {
                    return Err(IntError::PrinterError {
                        context: format!("{n} printers answer to the name \"{entity}\""),
                        source: None,
                    });
                }
            }
        }
        Ok(None)
    }

    fn open_with_retries<W: Write>(
        &mut self,
        addr: PapAddr,
        opts: &PapOptions,
        fb: &mut FeedbackWriter<W>,
    ) -> Result<(u8, String), IntError> {
        let mut attempt = 0u32;
        loop {
            match self.transport.open(addr)? {
                PapOpen::Busy { status } => {
                    let _ = fb.send_verbatim(&status);
                    if attempt < opts.open_retries {
                        attempt += 1;
                        std::thread::sleep(BUSY_RETRY_INTERVAL);
                        continue;
                    }
                    return Err(IntError::Engaged(
                        "the printer is serving another client".to_owned(),
                    ));
                }
                PapOpen::Open {
                    remote_quantum,
                    status,
                } => return Ok((remote_quantum, status)),
            }
        }
    }

    /// Download the job that changes the printer's advertised type, then
    /// wait out its replies.
    fn rename_printer(&mut self, new_type: &str) -> Result<(), IntError> {
        let job = RENAME_JOB.replacen("{}", new_type, 1);
        self.write_fully(job.as_bytes(), true)?;
        loop {
            let mut scratch = [0u8; 512];
            match self.transport.read(&mut scratch)? {
                ReadOutcome::Data(_) => {}
                ReadOutcome::WouldBlock => std::thread::sleep(Duration::from_millis(50)),
                ReadOutcome::Closed => return Ok(()),
            }
        }
    }

    /// Push a whole buffer through the flow-controlled connection.
    fn write_fully(&mut self, mut buf: &[u8], eof: bool) -> Result<(), IntError> {
        loop {
            let chunk = &buf[..buf.len().min(self.wlen)];
            let this_eof = eof && chunk.len() == buf.len();
            match self.transport.write(chunk, this_eof)? {
                WriteOutcome::Wrote(n) => {
                    buf = &buf[n..];
                    if buf.is_empty() && (this_eof || !eof) {
                        return Ok(());
                    }
                }
                WriteOutcome::WouldBlock => std::thread::sleep(Duration::from_millis(50)),
            }
        }
    }
}

impl<T: PapTransport> Link for PapLink<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, IntError> {
        match self.transport.read(buf)? {
            ReadOutcome::Closed if self.awaiting_ack => {
                // The printer's EOF acknowledges our end-of-job.
                self.acked = true;
                self.awaiting_ack = false;
                Ok(ReadOutcome::WouldBlock)
            }
            outcome => Ok(outcome),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, IntError> {
        self.transport.write(buf, false)
    }

    fn end_of_job(&mut self) -> Result<(), IntError> {
        self.acked = false;
        self.awaiting_ack = true;
        self.write_fully(&[], true)
    }

    fn job_done(&self) -> bool {
        self.acked
    }

    fn max_write(&self) -> usize {
        self.wlen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_parses_with_and_without_zone() {
        let e = PapEntity::parse("Sales LW:MyQueue@2nd Floor").unwrap();
        assert_eq!(e.name, "Sales LW");
        assert_eq!(e.entity_type, "MyQueue");
        assert_eq!(e.zone, "2nd Floor");
        assert_eq!(e.to_string(), "Sales LW:MyQueue@2nd Floor");

        let e = PapEntity::parse("Sales LW:LaserWriter").unwrap();
        assert_eq!(e.zone, "*");
    }

    #[test]
    fn entity_rejects_malformed_addresses() {
        assert!(PapEntity::parse("no type here").is_err());
        assert!(PapEntity::parse(":LaserWriter@*").is_err());
        let long = "x".repeat(NBP_FIELD_MAX + 1);
        assert!(PapEntity::parse(&format!("{long}:LaserWriter@*")).is_err());
    }

    #[test]
    fn cache_freshness_threshold() {
        let addr = PapAddr {
            net: 10,
            node: 129,
            socket: 2,
        };
        assert_eq!(
            state_for(addr, Duration::from_secs(5)),
            CacheState::Recent(addr)
        );
        assert_eq!(
            state_for(addr, Duration::from_secs(25)),
            CacheState::MustConfirm(addr)
        );
        assert_eq!(parse_cache_line("10 129 2\n"), Some(addr));
        assert_eq!(parse_cache_line("garbage"), None);
    }

    // ── Mock transport ──

    use std::collections::VecDeque;

    #[derive(Debug, Default)]
    struct MockTransport {
        lookups: VecDeque<Vec<PapAddr>>,
        opens: VecDeque<PapOpen>,
        reads: VecDeque<ReadOutcome>,
        seen_lookups: Vec<String>,
        written: Vec<(Vec<u8>, bool)>,
        closes: u32,
    }

    impl MockTransport {
        fn addr() -> PapAddr {
            PapAddr {
                net: 7,
                node: 3,
                socket: 128,
            }
        }
    }

    impl PapTransport for MockTransport {
        fn lookup(&mut self, entity: &PapEntity) -> Result<Vec<PapAddr>, IntError> {
            self.seen_lookups.push(entity.entity_type.clone());
            Ok(self.lookups.pop_front().unwrap_or_default())
        }

        fn confirm(
            &mut self,
            _entity: &PapEntity,
            addr: PapAddr,
        ) -> Result<Option<PapAddr>, IntError> {
            Ok(Some(addr))
        }

        fn open(&mut self, _addr: PapAddr) -> Result<PapOpen, IntError> {
            Ok(self.opens.pop_front().expect("unexpected open"))
        }

        fn read(&mut self, _buf: &mut [u8]) -> Result<ReadOutcome, IntError> {
            Ok(self.reads.pop_front().unwrap_or(ReadOutcome::WouldBlock))
        }

        fn write(&mut self, buf: &[u8], eof: bool) -> Result<WriteOutcome, IntError> {
            self.written.push((buf.to_vec(), eof));
            Ok(WriteOutcome::Wrote(buf.len()))
        }

        fn close(&mut self) -> Result<(), IntError> {
            self.closes += 1;
            Ok(())
        }

        fn fd(&self) -> Option<BorrowedFd<'_>> {
            None
        }
    }

    fn quick_opts() -> PapOptions {
        PapOptions {
            is_laserwriter: true,
            open_retries: 0,
            lookup_retries: 1,
            lookup_interval: Duration::from_millis(1),
            idle_status_interval: None,
            address_cache: None,
        }
    }

    fn open_ok() -> PapOpen {
        PapOpen::Open {
            remote_quantum: 8,
            status: "%%[ status: idle ]%%".to_owned(),
        }
    }

    #[test]
    fn finds_printer_under_its_own_type() {
        let transport = MockTransport {
            lookups: VecDeque::from([vec![MockTransport::addr()]]),
            opens: VecDeque::from([open_ok()]),
            ..MockTransport::default()
        };
        let ctx = CommandContext::new("prn", "Sales LW:MyQueue@*");
        let mut fb = FeedbackWriter::new(Vec::new());

        let link = PapLink::open(transport, &ctx, &quick_opts(), &mut fb).unwrap();
        assert_eq!(link.transport.seen_lookups, vec!["MyQueue"]);
        assert_eq!(link.transport.closes, 0);
    }

    #[test]
    fn renames_a_reset_printer_exactly_once() {
        let transport = MockTransport {
            // Miss under MyQueue, hit under LaserWriter, hit under MyQueue.
            lookups: VecDeque::from([
                vec![],
                vec![MockTransport::addr()],
                vec![MockTransport::addr()],
            ]),
            opens: VecDeque::from([open_ok(), open_ok()]),
            // Replies to the rename job, then the printer's EOF.
            reads: VecDeque::from([ReadOutcome::Data(4), ReadOutcome::Closed]),
            ..MockTransport::default()
        };
        let ctx = CommandContext::new("prn", "Sales LW:MyQueue@*");
        let mut fb = FeedbackWriter::new(Vec::new());

        let link = PapLink::open(transport, &ctx, &quick_opts(), &mut fb).unwrap();
        assert_eq!(
            link.transport.seen_lookups,
            vec!["MyQueue", "LaserWriter", "MyQueue"]
        );
        assert_eq!(link.transport.closes, 1);

        let (job, eof) = &link.transport.written[0];
        let job = std::str::from_utf8(job).unwrap();
        assert!(job.contains("appletalktype"));
        assert!(job.contains("(MyQueue)"));
        assert!(*eof);
    }

    #[test]
    fn generic_type_miss_never_renames() {
        let transport = MockTransport::default();
        let ctx = CommandContext::new("prn", "Sales LW:LaserWriter@*");
        let mut fb = FeedbackWriter::new(Vec::new());

        let err = PapLink::open(transport, &ctx, &quick_opts(), &mut fb).unwrap_err();
        assert!(matches!(err, IntError::NotResponding { .. }));
        assert_eq!(err.exit(), jetpipe_core::Exit::NotResponding);
    }

    #[test]
    fn non_laserwriter_miss_never_renames() {
        let transport = MockTransport::default();
        let ctx = CommandContext::new("prn", "Sales LW:MyQueue@*");
        let mut fb = FeedbackWriter::new(Vec::new());
        let mut opts = quick_opts();
        opts.is_laserwriter = false;

        let err = PapLink::open(transport, &ctx, &opts, &mut fb).unwrap_err();
        assert!(matches!(err, IntError::NotResponding { .. }));
    }

    #[test]
    fn busy_printer_relays_status_and_reports_engaged() {
        let transport = MockTransport {
            lookups: VecDeque::from([vec![MockTransport::addr()]]),
            opens: VecDeque::from([PapOpen::Busy {
                status: "%%[ status: busy; source: AppleTalk ]%%".to_owned(),
            }]),
            ..MockTransport::default()
        };
        let ctx = CommandContext::new("prn", "Sales LW:MyQueue@*");
        let mut fb = FeedbackWriter::new(Vec::new());

        let err = PapLink::open(transport, &ctx, &quick_opts(), &mut fb).unwrap_err();
        assert!(matches!(err, IntError::Engaged(_)));
    }

    #[test]
    fn ambiguous_name_is_an_error() {
        let transport = MockTransport {
            lookups: VecDeque::from([vec![MockTransport::addr(), MockTransport::addr()]]),
            ..MockTransport::default()
        };
        let ctx = CommandContext::new("prn", "Sales LW:MyQueue@*");
        let mut fb = FeedbackWriter::new(Vec::new());

        let err = PapLink::open(transport, &ctx, &quick_opts(), &mut fb).unwrap_err();
        assert!(matches!(err, IntError::PrinterError { .. }));
    }

    #[test]
    fn write_quantum_follows_the_printer_up_to_the_cap() {
        for (remote, expect) in [(2u8, 1024usize), (8, 4096), (12, 4096)] {
            let transport = MockTransport {
                lookups: VecDeque::from([vec![MockTransport::addr()]]),
                opens: VecDeque::from([PapOpen::Open {
                    remote_quantum: remote,
                    status: String::new(),
                }]),
                ..MockTransport::default()
            };
            let ctx = CommandContext::new("prn", "Sales LW:MyQueue@*");
            let mut fb = FeedbackWriter::new(Vec::new());
            let link = PapLink::open(transport, &ctx, &quick_opts(), &mut fb).unwrap();
            assert_eq!(link.max_write(), expect);
        }
    }

    #[test]
    fn open_time_complaints_reach_the_operator() {
        let transport = MockTransport {
            lookups: VecDeque::from([vec![MockTransport::addr()]]),
            opens: VecDeque::from([PapOpen::Open {
                remote_quantum: 8,
                status: "%%[ PrinterError: out of paper ]%%".to_owned(),
            }]),
            ..MockTransport::default()
        };
        let ctx = CommandContext::new("prn", "Sales LW:MyQueue@*");
        let mut fb = FeedbackWriter::new(Vec::new());

        PapLink::open(transport, &ctx, &quick_opts(), &mut fb).unwrap();
        let out = String::from_utf8(fb.into_inner()).unwrap();
        assert_eq!(out, "%%[ PrinterError: out of paper ]%%\n");
    }

    #[test]
    fn printer_eof_acknowledges_the_job() {
        let transport = MockTransport {
            lookups: VecDeque::from([vec![MockTransport::addr()]]),
            opens: VecDeque::from([open_ok()]),
            reads: VecDeque::from([ReadOutcome::Closed]),
            ..MockTransport::default()
        };
        let ctx = CommandContext::new("prn", "Sales LW:MyQueue@*");
        let mut fb = FeedbackWriter::new(Vec::new());
        let mut link = PapLink::open(transport, &ctx, &quick_opts(), &mut fb).unwrap();

        link.end_of_job().unwrap();
        assert!(!link.job_done());
        let mut buf = [0u8; 16];
        assert!(matches!(
            link.read(&mut buf).unwrap(),
            ReadOutcome::WouldBlock
        ));
        assert!(link.job_done());

        // The end-of-job write carried the EOF mark.
        let (last, eof) = link.transport.written.last().unwrap();
        assert!(last.is_empty());
        assert!(*eof);
    }
}
