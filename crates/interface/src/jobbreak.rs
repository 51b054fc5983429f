//! Job-break and cancellation control.
//!
//! With the signal job-break methods, the driver and the interface speak a
//! three-way SIGUSR1 handshake over one persistent connection: the interface
//! raises SIGUSR1 to its parent to announce it is ready, the driver raises
//! SIGUSR1 to request an end-of-job boundary, and the interface raises
//! SIGUSR1 back once the boundary has been acknowledged by the printer.
//! All the signal plumbing lives here; the copy engine only ever sees an
//! atomic flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use jetpipe_core::context::Jobbreak;
use nix::libc;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, kill, sigaction};
use nix::unistd::getppid;

use crate::error::IntError;

static BREAK_FLAG: AtomicBool = AtomicBool::new(false);
static CANCEL_FLAG: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigusr1(_: libc::c_int) {
    BREAK_FLAG.store(true, Ordering::Relaxed);
}

extern "C" fn on_terminate(_: libc::c_int) {
    CANCEL_FLAG.store(true, Ordering::Relaxed);
}

enum Flags {
    /// Driven by the process-wide signal handlers.
    Process,
    /// Driven by the owner of a [`BreakHandle`].
    Manual {
        brk: Arc<AtomicBool>,
        cancel: Arc<AtomicBool>,
        acks: Arc<AtomicUsize>,
    },
}

/// The engine's view of job-break requests and termination.
pub struct JobBreak {
    flags: Flags,
    signal_parent: bool,
}

/// Test-side controller paired with [`JobBreak::manual`].
#[derive(Clone)]
pub struct BreakHandle {
    brk: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    acks: Arc<AtomicUsize>,
}

impl BreakHandle {
    /// Request an end-of-job boundary, as the driver's SIGUSR1 would.
    pub fn request_break(&self) {
        self.brk.store(true, Ordering::Relaxed);
    }

    /// Request termination, as SIGTERM would.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// How many boundaries the interface has acknowledged.
    pub fn acknowledged(&self) -> usize {
        self.acks.load(Ordering::Relaxed)
    }
}

impl JobBreak {
    /// A control that never fires; for transports whose job-break method
    /// does not use signals.
    pub fn none() -> Self {
        let (ctl, _handle) = Self::manual();
        ctl
    }

    /// A control driven by a [`BreakHandle`] instead of real signals.
    pub fn manual() -> (Self, BreakHandle) {
        let brk = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(AtomicBool::new(false));
        let acks = Arc::new(AtomicUsize::new(0));
        let ctl = Self {
            flags: Flags::Manual {
                brk: Arc::clone(&brk),
                cancel: Arc::clone(&cancel),
                acks: Arc::clone(&acks),
            },
            signal_parent: false,
        };
        (ctl, BreakHandle { brk, cancel, acks })
    }

    /// Install the process signal handlers for the given job-break method.
    ///
    /// SIGUSR1 raises the break flag only for the signal methods; SIGTERM,
    /// SIGINT, and SIGHUP always raise the cancel flag. The handlers are
    /// installed without `SA_RESTART` so a pending flag cuts any wait in
    /// the multiplexer short.
    pub fn install(method: Jobbreak) -> Result<Self, IntError> {
        let flag_action = |handler| SigAction::new(handler, SaFlags::empty(), SigSet::empty());

        let install_one = |sig, handler| -> Result<(), IntError> {
            // Safety: the handlers only store to atomics.
            unsafe { sigaction(sig, &flag_action(SigHandler::Handler(handler))) }
                .map(|_| ())
                .map_err(|errno| IntError::PrinterError {
                    context: format!("sigaction({sig:?}) failed"),
                    source: Some(std::io::Error::from_raw_os_error(errno as i32)),
                })
        };

        install_one(Signal::SIGTERM, on_terminate)?;
        install_one(Signal::SIGINT, on_terminate)?;
        install_one(Signal::SIGHUP, on_terminate)?;
        if method.uses_signal() {
            install_one(Signal::SIGUSR1, on_sigusr1)?;
        }

        Ok(Self {
            flags: Flags::Process,
            signal_parent: method.uses_signal(),
        })
    }

    /// Tell the parent driver this interface is ready for the handshake.
    pub fn announce_ready(&self) -> Result<(), IntError> {
        self.raise_to_parent()
    }

    /// Whether the driver has requested an end-of-job boundary.
    pub fn break_pending(&self) -> bool {
        match &self.flags {
            Flags::Process => BREAK_FLAG.load(Ordering::Relaxed),
            Flags::Manual { brk, .. } => brk.load(Ordering::Relaxed),
        }
    }

    /// Whether a termination signal has arrived.
    pub fn cancel_pending(&self) -> bool {
        match &self.flags {
            Flags::Process => CANCEL_FLAG.load(Ordering::Relaxed),
            Flags::Manual { cancel, .. } => cancel.load(Ordering::Relaxed),
        }
    }

    /// Confirm a completed job boundary to the driver and clear the flag.
    pub fn acknowledge(&self) -> Result<(), IntError> {
        match &self.flags {
            Flags::Process => BREAK_FLAG.store(false, Ordering::Relaxed),
            Flags::Manual { brk, acks, .. } => {
                brk.store(false, Ordering::Relaxed);
                acks.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.raise_to_parent()
    }

    fn raise_to_parent(&self) -> Result<(), IntError> {
        if !self.signal_parent {
            return Ok(());
        }
        kill(getppid(), Signal::SIGUSR1).map_err(|errno| IntError::PrinterError {
            context: "signaling the spooler driver failed".to_owned(),
            source: Some(std::io::Error::from_raw_os_error(errno as i32)),
        })
    }
}
