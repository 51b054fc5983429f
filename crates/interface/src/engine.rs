//! The bidirectional copy loop shared by every transport.
//!
//! One engine moves job data from the driver to the printer and, when the
//! feedback channel is open, printer messages back to the driver. Each
//! direction is a tiny two-state machine (filling its buffer, then emptying
//! it) and the engine performs at most one operation per direction per
//! round, between waits in the [`Multiplexer`].
//!
//! The engine owns three awkward responsibilities that used to be duplicated
//! per transport: keepalive timing while the outbound side is idle, the
//! end-of-job handshake (including the job-break variant that keeps the
//! connection open for the next job), and defense against ports that claim
//! write readiness and then accept nothing.

use std::time::{Duration, Instant};

use jetpipe_core::CommandContext;
use jetpipe_core::feedback::FeedbackLine;

use crate::error::IntError;
use crate::jobbreak::JobBreak;
use crate::mux::{Interest, Multiplexer};
use crate::{Link, ReadOutcome, Upstream, WriteOutcome};

/// Buffer size per direction.
const BUF_SIZE: usize = 8192;

/// How many consecutive false readiness claims we tolerate from the port,
/// per direction, before concluding the hardware or driver stack is broken.
/// The next one is fatal and non-retryable.
const MISBEHAVIOR_LIMIT: u32 = 10;

/// Timing and preamble settings for one engine run.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Send the transport keepalive after this much outbound idle time.
    /// `None` means the engine never synthesizes traffic.
    pub idle_status_interval: Option<Duration>,
    /// Run the transport's out-of-band status check this often.
    pub status_interval: Option<Duration>,
    /// Bytes to send ahead of the first job data (port init sequences).
    pub preamble: Vec<u8>,
}

/// What one completed copy run means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOutcome {
    /// `true` if the run ended at a job-break boundary and the driver will
    /// send another job over the same connection.
    pub more_jobs: bool,
}

enum Phase {
    /// Normal transfer; upstream may still produce data.
    Streaming,
    /// Upstream is done; flush what remains in the outbound buffer.
    Draining { more_jobs: bool },
    /// End-of-job sent; wait for the protocol to acknowledge it.
    AwaitAck { more_jobs: bool },
}

/// One direction's buffer: fills from its source, then drains to its sink.
struct Channel {
    buf: Box<[u8]>,
    off: usize,
    len: usize,
}

impl Channel {
    fn new() -> Self {
        Self {
            buf: vec![0u8; BUF_SIZE].into_boxed_slice(),
            off: 0,
            len: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.off >= self.len
    }

    fn pending(&self) -> &[u8] {
        &self.buf[self.off..self.len]
    }

    fn space(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    fn filled(&mut self, n: usize) {
        self.off = 0;
        self.len = n;
    }

    fn load(&mut self, bytes: &[u8]) {
        self.buf[..bytes.len()].copy_from_slice(bytes);
        self.filled(bytes.len());
    }

    fn consume(&mut self, n: usize) {
        self.off += n;
        if self.is_empty() {
            self.off = 0;
            self.len = 0;
        }
    }
}

/// Copy one job between the driver and the printer.
///
/// Returns when the job stream ends: either the driver closed its pipe
/// (`more_jobs == false`) or a job-break was requested and the boundary has
/// been acknowledged on the wire (`more_jobs == true`).
pub fn run_copy_job<L, U, M>(
    link: &mut L,
    upstream: &mut U,
    mux: &mut M,
    ctx: &CommandContext,
    opts: &EngineOptions,
    ctl: &JobBreak,
) -> Result<CopyOutcome, IntError>
where
    L: Link,
    U: Upstream,
    M: Multiplexer,
{
    if opts.preamble.len() > BUF_SIZE {
        return Err(IntError::InvalidOption(
            "port initialization sequence is too long".to_owned(),
        ));
    }

    let feedback = ctx.feedback;
    let mut xmit = Channel::new(); // driver -> printer
    let mut recv = Channel::new(); // printer -> driver
    let mut phase = Phase::Streaming;
    // One false-readiness count per port direction; driver-pipe
    // backpressure is never counted.
    let mut false_ready_write = 0u32;
    let mut false_ready_read = 0u32;

    if !opts.preamble.is_empty() {
        xmit.load(&opts.preamble);
    }

    // The keepalive is armed only while the outbound buffer is empty;
    // arrival of more job data disarms it.
    let mut keepalive_due = match opts.idle_status_interval {
        Some(interval) if xmit.is_empty() => Some(Instant::now() + interval),
        _ => None,
    };
    let mut status_due = opts.status_interval.map(|i| Instant::now() + i);

    loop {
        if ctl.cancel_pending() {
            return Err(IntError::Canceled);
        }

        // Phase maintenance.
        if let Phase::Draining { more_jobs } = phase {
            if xmit.is_empty() {
                link.end_of_job()?;
                tracing::debug!(more_jobs, "end of job sent");
                phase = Phase::AwaitAck { more_jobs };
            }
        }
        if let Phase::AwaitAck { more_jobs } = phase {
            if link.job_done() && recv.is_empty() {
                return Ok(CopyOutcome { more_jobs });
            }
        }

        let break_pending = matches!(phase, Phase::Streaming) && ctl.break_pending();

        // What to wait for this round.
        let mut interest = Interest::default();
        if feedback {
            if recv.is_empty() {
                interest.link_read = true;
            } else {
                interest.upstream_write = true;
            }
        } else if matches!(phase, Phase::AwaitAck { .. }) || !link.ready_for_data() {
            // Protocol replies must still be consumed (and discarded).
            interest.link_read = true;
        }
        match phase {
            Phase::Streaming => {
                if xmit.is_empty() {
                    if link.ready_for_data() {
                        interest.upstream_read = true;
                    }
                } else {
                    interest.link_write = true;
                }
            }
            Phase::Draining { .. } => interest.link_write = true,
            Phase::AwaitAck { .. } => interest.link_read = true,
        }

        // Deadline: the sooner of the two timers; zero when a job-break is
        // waiting so the drain decision is not delayed.
        let now = Instant::now();
        let mut deadline: Option<Instant> = None;
        for due in [keepalive_due, status_due].into_iter().flatten() {
            deadline = Some(deadline.map_or(due, |d: Instant| d.min(due)));
        }
        let timeout = if break_pending {
            Some(Duration::ZERO)
        } else {
            deadline.map(|d| d.saturating_duration_since(now))
        };

        let ready = mux.wait(interest, timeout)?;

        // Timers.
        let now = Instant::now();
        if let Some(due) = keepalive_due {
            if now >= due && xmit.is_empty() {
                link.keepalive()?;
                tracing::debug!("keepalive sent");
                keepalive_due = opts.idle_status_interval.map(|i| now + i);
            }
        }
        if let Some(due) = status_due {
            if now >= due {
                if let Some(fault) = link.poll_status()? {
                    tracing::warn!(%fault, "printer fault");
                    if feedback && recv.is_empty() {
                        let line = format!("{}\n", FeedbackLine::PrinterError(fault));
                        recv.load(line.as_bytes());
                    }
                }
                status_due = opts.status_interval.map(|i| now + i);
            }
        }

        // Printer-to-driver direction first: what the printer has to say can
        // gate what we are allowed to send it.
        if feedback {
            if recv.is_empty() {
                if ready.link_read {
                    match link.read(recv.space())? {
                        ReadOutcome::Data(n) => {
                            false_ready_read = 0;
                            recv.filled(n);
                        }
                        ReadOutcome::WouldBlock => {
                            false_ready_read += 1;
                            tracing::debug!(false_ready_read, "port claimed readable but had no data");
                            if false_ready_read > MISBEHAVIOR_LIMIT {
                                return Err(IntError::Misbehaving);
                            }
                        }
                        ReadOutcome::Closed => return Err(closed_early(&phase)),
                    }
                }
            } else if ready.upstream_write {
                match upstream.write(recv.pending())? {
                    // Driver backpressure is normal, never counted.
                    WriteOutcome::Wrote(n) => recv.consume(n),
                    WriteOutcome::WouldBlock => {}
                }
            }
        } else if ready.link_read {
            // No feedback channel: consume and discard protocol replies.
            let mut scratch = [0u8; 512];
            match link.read(&mut scratch)? {
                ReadOutcome::Data(_) => false_ready_read = 0,
                ReadOutcome::WouldBlock => {
                    false_ready_read += 1;
                    if false_ready_read > MISBEHAVIOR_LIMIT {
                        return Err(IntError::Misbehaving);
                    }
                }
                ReadOutcome::Closed => return Err(closed_early(&phase)),
            }
        }

        // Driver-to-printer direction.
        if xmit.is_empty() {
            if matches!(phase, Phase::Streaming) && link.ready_for_data() {
                if ready.upstream_read {
                    match upstream.read(xmit.space())? {
                        ReadOutcome::Data(n) => {
                            xmit.filled(n);
                            keepalive_due = None;
                        }
                        ReadOutcome::WouldBlock => {
                            if break_pending {
                                // The driver has paused the stream; this is
                                // the job boundary.
                                phase = Phase::Draining { more_jobs: true };
                            }
                        }
                        ReadOutcome::Closed => phase = Phase::Draining { more_jobs: false },
                    }
                } else if break_pending {
                    phase = Phase::Draining { more_jobs: true };
                }
            }
        } else if ready.link_write {
            let chunk = xmit.pending().len().min(link.max_write());
            match link.write(&xmit.pending()[..chunk])? {
                WriteOutcome::Wrote(n) => {
                    false_ready_write = 0;
                    xmit.consume(n);
                    if xmit.is_empty() {
                        keepalive_due = opts.idle_status_interval.map(|i| Instant::now() + i);
                    }
                }
                WriteOutcome::WouldBlock => {
                    false_ready_write += 1;
                    tracing::debug!(false_ready_write, "port claimed ready but refused data");
                    if false_ready_write > MISBEHAVIOR_LIMIT {
                        return Err(IntError::Misbehaving);
                    }
                }
            }
        }
    }
}

fn closed_early(phase: &Phase) -> IntError {
    match phase {
        Phase::AwaitAck { .. } => IntError::Protocol(
            "connection closed before end-of-job acknowledgement".to_owned(),
        ),
        _ => IntError::PrinterError {
            context: "printer unexpectedly closed the connection".to_owned(),
            source: None,
        },
    }
}

/// Run jobs over one connection until the driver's pipe truly closes.
///
/// With a signal job-break method the same connection carries many jobs;
/// each boundary is acknowledged to the driver before the next job starts.
/// The preamble, if any, is sent once, ahead of the first job.
pub fn run_session<L, U, M>(
    link: &mut L,
    upstream: &mut U,
    mux: &mut M,
    ctx: &CommandContext,
    opts: &EngineOptions,
    ctl: &JobBreak,
) -> Result<(), IntError>
where
    L: Link,
    U: Upstream,
    M: Multiplexer,
{
    ctl.announce_ready()?;

    let mut job_opts = opts.clone();
    loop {
        let outcome = run_copy_job(link, upstream, mux, ctx, &job_opts, ctl)?;
        job_opts.preamble.clear();
        if !outcome.more_jobs {
            return Ok(());
        }
        ctl.acknowledge()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Ready;
    use std::collections::VecDeque;

    // ── Scripted endpoints ───────────────────────────────────────────

    enum Feed {
        Chunk(Vec<u8>),
        Pause,
        Close,
    }

    struct MockUpstream {
        script: VecDeque<Feed>,
        wrote: Vec<u8>,
    }

    impl MockUpstream {
        fn scripted(script: Vec<Feed>) -> Self {
            Self {
                script: script.into(),
                wrote: Vec::new(),
            }
        }

        /// Chunks followed by a clean close.
        fn with_job(chunks: &[&[u8]]) -> Self {
            let mut script: Vec<Feed> = chunks.iter().map(|c| Feed::Chunk(c.to_vec())).collect();
            script.push(Feed::Close);
            Self::scripted(script)
        }

        /// Chunks followed by an indefinite pause.
        fn open_ended(chunks: &[&[u8]]) -> Self {
            let script = chunks.iter().map(|c| Feed::Chunk(c.to_vec())).collect();
            Self::scripted(script)
        }
    }

    impl Upstream for MockUpstream {
        fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, IntError> {
            match self.script.front() {
                Some(Feed::Chunk(_)) => {
                    let Some(Feed::Chunk(chunk)) = self.script.pop_front() else {
                        unreachable!()
                    };
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(ReadOutcome::Data(chunk.len()))
                }
                Some(Feed::Pause) => {
                    self.script.pop_front();
                    Ok(ReadOutcome::WouldBlock)
                }
                Some(Feed::Close) => Ok(ReadOutcome::Closed),
                None => Ok(ReadOutcome::WouldBlock),
            }
        }

        fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, IntError> {
            self.wrote.extend_from_slice(buf);
            Ok(WriteOutcome::Wrote(buf.len()))
        }
    }

    #[derive(Default)]
    struct MockLink {
        accepted: Vec<u8>,
        /// Per-write script: `true` accepts the chunk, `false` claims busy.
        write_script: VecDeque<bool>,
        feedback: VecDeque<Vec<u8>>,
        /// Claim "nothing to read" this many times before serving feedback.
        read_stalls: u32,
        eoj_count: usize,
        keepalives: usize,
        max_write: Option<usize>,
    }

    impl Link for MockLink {
        fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, IntError> {
            if self.read_stalls > 0 {
                self.read_stalls -= 1;
                return Ok(ReadOutcome::WouldBlock);
            }
            match self.feedback.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(ReadOutcome::Data(chunk.len()))
                }
                None => Ok(ReadOutcome::WouldBlock),
            }
        }

        fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, IntError> {
            if let Some(max) = self.max_write {
                assert!(buf.len() <= max, "write exceeds flow quantum");
            }
            match self.write_script.pop_front() {
                Some(false) => Ok(WriteOutcome::WouldBlock),
                _ => {
                    self.accepted.extend_from_slice(buf);
                    Ok(WriteOutcome::Wrote(buf.len()))
                }
            }
        }

        fn end_of_job(&mut self) -> Result<(), IntError> {
            self.eoj_count += 1;
            Ok(())
        }

        fn max_write(&self) -> usize {
            self.max_write.unwrap_or(usize::MAX)
        }

        fn keepalive(&mut self) -> Result<(), IntError> {
            self.keepalives += 1;
            Ok(())
        }
    }

    /// Everything asked for is instantly ready.
    struct EagerMux;

    impl Multiplexer for EagerMux {
        fn wait(&mut self, i: Interest, _t: Option<Duration>) -> Result<Ready, IntError> {
            Ok(Ready {
                upstream_read: i.upstream_read,
                upstream_write: i.upstream_write,
                link_read: i.link_read,
                link_write: i.link_write,
            })
        }
    }

    /// Nothing is ready for the first `idle_rounds` waits, then everything.
    struct IdleThenEagerMux {
        idle_rounds: usize,
    }

    impl Multiplexer for IdleThenEagerMux {
        fn wait(&mut self, i: Interest, t: Option<Duration>) -> Result<Ready, IntError> {
            if self.idle_rounds > 0 {
                self.idle_rounds -= 1;
                std::thread::sleep(t.unwrap_or(Duration::from_millis(5)).min(Duration::from_millis(50)));
                return Ok(Ready::none());
            }
            EagerMux.wait(i, t)
        }
    }

    fn ctx(feedback: bool) -> CommandContext {
        let mut ctx = CommandContext::new("testprn", "addr");
        ctx.feedback = feedback;
        ctx
    }

    // ── Tests ────────────────────────────────────────────────────────

    #[test]
    fn copies_job_byte_exact() {
        let mut link = MockLink::default();
        let mut up = MockUpstream::with_job(&[b"%!PS-Adobe-3.0\n", b"showpage\n"]);
        let ctl = JobBreak::none();

        let outcome = run_copy_job(
            &mut link,
            &mut up,
            &mut EagerMux,
            &ctx(false),
            &EngineOptions::default(),
            &ctl,
        )
        .unwrap();

        assert!(!outcome.more_jobs);
        assert_eq!(link.accepted, b"%!PS-Adobe-3.0\nshowpage\n");
        assert_eq!(link.eoj_count, 1);
        assert_eq!(link.keepalives, 0, "no synthetic traffic by default");
    }

    #[test]
    fn preamble_precedes_job_data() {
        let mut link = MockLink::default();
        let mut up = MockUpstream::with_job(&[b"job"]);
        let ctl = JobBreak::none();
        let opts = EngineOptions {
            preamble: b"INIT".to_vec(),
            ..EngineOptions::default()
        };

        run_copy_job(&mut link, &mut up, &mut EagerMux, &ctx(false), &opts, &ctl).unwrap();
        assert_eq!(link.accepted, b"INITjob");
    }

    #[test]
    fn feedback_flows_back_to_driver() {
        let mut link = MockLink {
            feedback: VecDeque::from([b"%%[ status: busy ]%%\n".to_vec()]),
            ..MockLink::default()
        };
        let mut up = MockUpstream::with_job(&[b"data"]);
        let ctl = JobBreak::none();

        run_copy_job(
            &mut link,
            &mut up,
            &mut EagerMux,
            &ctx(true),
            &EngineOptions::default(),
            &ctl,
        )
        .unwrap();

        assert_eq!(up.wrote, b"%%[ status: busy ]%%\n");
        assert_eq!(link.accepted, b"data");
    }

    #[test]
    fn tolerates_ten_false_readiness_claims() {
        let mut link = MockLink {
            write_script: VecDeque::from(vec![false; 10]),
            ..MockLink::default()
        };
        let mut up = MockUpstream::with_job(&[b"payload"]);
        let ctl = JobBreak::none();

        run_copy_job(
            &mut link,
            &mut up,
            &mut EagerMux,
            &ctx(false),
            &EngineOptions::default(),
            &ctl,
        )
        .unwrap();
        assert_eq!(link.accepted, b"payload");
    }

    #[test]
    fn eleventh_false_readiness_claim_is_fatal() {
        let mut link = MockLink {
            write_script: VecDeque::from(vec![false; 11]),
            ..MockLink::default()
        };
        let mut up = MockUpstream::with_job(&[b"payload"]);
        let ctl = JobBreak::none();

        let err = run_copy_job(
            &mut link,
            &mut up,
            &mut EagerMux,
            &ctx(false),
            &EngineOptions::default(),
            &ctl,
        )
        .unwrap_err();
        assert!(matches!(err, IntError::Misbehaving));
        assert!(!err.is_retryable());
    }

    #[test]
    fn lying_read_readiness_is_fatal() {
        // The multiplexer keeps claiming the port is readable while every
        // read comes back empty-handed; without a cap this busy-loops.
        let mut link = MockLink::default();
        let mut up = MockUpstream::open_ended(&[]);
        let ctl = JobBreak::none();

        let err = run_copy_job(
            &mut link,
            &mut up,
            &mut EagerMux,
            &ctx(true),
            &EngineOptions::default(),
            &ctl,
        )
        .unwrap_err();
        assert!(matches!(err, IntError::Misbehaving));
        assert!(!err.is_retryable());
    }

    #[test]
    fn read_data_resets_the_read_count() {
        // Ten empty-handed reads, then a real feedback line: never fatal.
        let mut link = MockLink {
            read_stalls: 10,
            feedback: VecDeque::from([b"%%[ status: idle ]%%\n".to_vec()]),
            ..MockLink::default()
        };
        let mut up = MockUpstream::scripted({
            let mut script: Vec<Feed> = (0..12).map(|_| Feed::Pause).collect();
            script.push(Feed::Close);
            script
        });
        let ctl = JobBreak::none();

        run_copy_job(
            &mut link,
            &mut up,
            &mut EagerMux,
            &ctx(true),
            &EngineOptions::default(),
            &ctl,
        )
        .unwrap();
        assert_eq!(up.wrote, b"%%[ status: idle ]%%\n");
    }

    #[test]
    fn successful_write_resets_the_count() {
        // 6 refusals, one success, 6 more refusals: never fatal.
        let mut script = vec![false; 6];
        script.push(true);
        script.extend(vec![false; 6]);
        let mut link = MockLink {
            write_script: VecDeque::from(script),
            ..MockLink::default()
        };
        let mut up = MockUpstream::with_job(&[b"ab", b"cd"]);
        let ctl = JobBreak::none();

        run_copy_job(
            &mut link,
            &mut up,
            &mut EagerMux,
            &ctx(false),
            &EngineOptions::default(),
            &ctl,
        )
        .unwrap();
        assert_eq!(link.accepted, b"abcd");
    }

    #[test]
    fn writes_respect_flow_quantum() {
        let mut link = MockLink {
            max_write: Some(3),
            ..MockLink::default()
        };
        let mut up = MockUpstream::with_job(&[b"0123456789"]);
        let ctl = JobBreak::none();

        run_copy_job(
            &mut link,
            &mut up,
            &mut EagerMux,
            &ctx(false),
            &EngineOptions::default(),
            &ctl,
        )
        .unwrap();
        assert_eq!(link.accepted, b"0123456789");
    }

    #[test]
    fn keepalive_fires_while_idle() {
        let mut link = MockLink::default();
        let mut up = MockUpstream::with_job(&[]);
        let ctl = JobBreak::none();
        let opts = EngineOptions {
            idle_status_interval: Some(Duration::from_millis(10)),
            ..EngineOptions::default()
        };

        run_copy_job(
            &mut link,
            &mut up,
            &mut IdleThenEagerMux { idle_rounds: 4 },
            &ctx(false),
            &opts,
            &ctl,
        )
        .unwrap();
        assert!(link.keepalives >= 2, "expected keepalives, got {}", link.keepalives);
    }

    #[test]
    fn no_keepalive_when_interval_unset() {
        let mut link = MockLink::default();
        let mut up = MockUpstream::with_job(&[b"x"]);
        let ctl = JobBreak::none();

        run_copy_job(
            &mut link,
            &mut up,
            &mut IdleThenEagerMux { idle_rounds: 3 },
            &ctx(false),
            &EngineOptions::default(),
            &ctl,
        )
        .unwrap();
        assert_eq!(link.keepalives, 0);
        assert_eq!(link.accepted, b"x");
    }

    #[test]
    fn job_break_ends_job_with_more_to_come() {
        let mut link = MockLink::default();
        // The driver pauses (would-block) after one chunk instead of closing.
        let mut up = MockUpstream::open_ended(&[b"first job"]);
        let (ctl, handle) = JobBreak::manual();
        handle.request_break();

        let outcome = run_copy_job(
            &mut link,
            &mut up,
            &mut EagerMux,
            &ctx(false),
            &EngineOptions::default(),
            &ctl,
        )
        .unwrap();

        assert!(outcome.more_jobs);
        assert_eq!(link.accepted, b"first job");
        assert_eq!(link.eoj_count, 1);
    }

    #[test]
    fn session_acknowledges_each_boundary() {
        let mut link = MockLink::default();
        let (ctl, handle) = JobBreak::manual();
        handle.request_break();

        // Job one ends at the pause (break already requested); acknowledge()
        // clears the flag and job two ends with a true close.
        let mut up = MockUpstream::scripted(vec![
            Feed::Chunk(b"one".to_vec()),
            Feed::Pause,
            Feed::Chunk(b"two".to_vec()),
            Feed::Close,
        ]);

        run_session(
            &mut link,
            &mut up,
            &mut EagerMux,
            &ctx(false),
            &EngineOptions::default(),
            &ctl,
        )
        .unwrap();

        assert_eq!(handle.acknowledged(), 1);
        assert_eq!(link.eoj_count, 2);
        assert_eq!(link.accepted, b"onetwo");
    }

    #[test]
    fn cancel_aborts_with_signal_error() {
        let mut link = MockLink::default();
        let mut up = MockUpstream::with_job(&[b"data"]);
        let (ctl, handle) = JobBreak::manual();
        handle.request_cancel();

        let err = run_copy_job(
            &mut link,
            &mut up,
            &mut EagerMux,
            &ctx(false),
            &EngineOptions::default(),
            &ctl,
        )
        .unwrap_err();
        assert!(matches!(err, IntError::Canceled));
    }
}
