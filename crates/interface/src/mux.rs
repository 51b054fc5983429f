//! Readiness multiplexing over the four engine endpoints.
//!
//! The copy engine never blocks in `read()` or `write()`; it blocks here,
//! in one place, with a deadline. The trait seam lets tests script readiness
//! instead of standing up real file descriptors.

use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::error::IntError;

/// Which endpoints the engine wants to hear about this round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    /// Job data arriving from the driver.
    pub upstream_read: bool,
    /// Room to relay printer messages back to the driver.
    pub upstream_write: bool,
    /// Messages arriving from the printer.
    pub link_read: bool,
    /// Room to push job data toward the printer.
    pub link_write: bool,
}

/// Which endpoints reported ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready {
    /// Job data can be read from the driver.
    pub upstream_read: bool,
    /// The driver pipe will accept a write.
    pub upstream_write: bool,
    /// The printer link has something to read.
    pub link_read: bool,
    /// The printer link will accept a write.
    pub link_write: bool,
}

impl Ready {
    /// No endpoint ready (timeout or interruption).
    pub fn none() -> Self {
        Self::default()
    }
}

/// Blocks until an endpoint of interest is ready or the timeout elapses.
pub trait Multiplexer {
    /// Wait for readiness. `None` waits indefinitely; `Some(ZERO)` polls.
    fn wait(&mut self, interest: Interest, timeout: Option<Duration>) -> Result<Ready, IntError>;
}

/// `poll(2)`-backed multiplexer over the real file descriptors.
///
/// An endpoint left as `None` is simply never ready; a transport without
/// a feedback channel registers no link-read side.
///
/// Raw descriptors are held rather than borrows: the engine needs the link
/// and upstream mutably while this waits on the same descriptors. The
/// caller keeps those endpoints open for as long as the multiplexer is in
/// use.
pub struct PollMultiplexer {
    upstream_in: Option<RawFd>,
    upstream_out: Option<RawFd>,
    link_in: Option<RawFd>,
    link_out: Option<RawFd>,
}

impl PollMultiplexer {
    /// A multiplexer over the given endpoints.
    ///
    /// `link_in` and `link_out` are usually the same descriptor; `poll(2)`
    /// is happy to carry it twice.
    pub fn new(
        upstream_in: Option<RawFd>,
        upstream_out: Option<RawFd>,
        link_in: Option<RawFd>,
        link_out: Option<RawFd>,
    ) -> Self {
        Self {
            upstream_in,
            upstream_out,
            link_in,
            link_out,
        }
    }
}

const READ_READY: PollFlags = PollFlags::POLLIN
    .union(PollFlags::POLLHUP)
    .union(PollFlags::POLLERR);
const WRITE_READY: PollFlags = PollFlags::POLLOUT
    .union(PollFlags::POLLHUP)
    .union(PollFlags::POLLERR);

impl Multiplexer for PollMultiplexer {
    fn wait(&mut self, interest: Interest, timeout: Option<Duration>) -> Result<Ready, IntError> {
        // Index into `fds` for each endpoint we register.
        let mut fds: Vec<PollFd<'_>> = Vec::with_capacity(4);
        let mut slots = [None::<usize>; 4];

        let mut register = |fd: Option<RawFd>, flags: PollFlags| -> Option<usize> {
            let raw = fd?;
            // Safety: the caller guarantees the registered descriptors stay
            // open while the multiplexer is in use.
            let fd = unsafe { BorrowedFd::borrow_raw(raw) };
            fds.push(PollFd::new(fd, flags));
            Some(fds.len() - 1)
        };
        if interest.upstream_read {
            slots[0] = register(self.upstream_in, PollFlags::POLLIN);
        }
        if interest.upstream_write {
            slots[1] = register(self.upstream_out, PollFlags::POLLOUT);
        }
        if interest.link_read {
            slots[2] = register(self.link_in, PollFlags::POLLIN);
        }
        if interest.link_write {
            slots[3] = register(self.link_out, PollFlags::POLLOUT);
        }

        let poll_timeout = match timeout {
            None => PollTimeout::NONE,
            Some(d) => {
                let mut ms = i32::try_from(d.as_millis()).unwrap_or(i32::MAX);
                if ms == 0 && !d.is_zero() {
                    ms = 1; // don't let a sub-millisecond remainder spin
                }
                PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
            }
        };

        match poll(&mut fds, poll_timeout) {
            Ok(_) => {}
            // Interrupted by a signal; the engine re-checks its flags.
            Err(Errno::EINTR) => return Ok(Ready::none()),
            Err(errno) => {
                return Err(IntError::PrinterError {
                    context: "poll() failed".to_owned(),
                    source: Some(std::io::Error::from_raw_os_error(errno as i32)),
                });
            }
        }

        // Hangups and errors count as ready so the following read or write
        // surfaces the condition instead of the engine waiting forever.
        let ready_at = |slot: Option<usize>, flags: PollFlags| -> bool {
            slot.and_then(|i| fds[i].revents())
                .is_some_and(|revents| revents.intersects(flags))
        };

        Ok(Ready {
            upstream_read: ready_at(slots[0], READ_READY),
            upstream_write: ready_at(slots[1], WRITE_READY),
            link_read: ready_at(slots[2], READ_READY),
            link_write: ready_at(slots[3], WRITE_READY),
        })
    }
}
