//! Typed error taxonomy for interface programs.
//!
//! Every failure path produces an [`IntError`] which propagates up to the
//! process edge, where [`IntError::exit`] maps it onto the spooler driver's
//! exit-code contract exactly once.

use std::error::Error as _;
use std::io;

use jetpipe_core::{AlertLog, Exit, alert};
use nix::errno::Errno;

/// Failure of one interface invocation.
///
/// Variants carry enough context for the alert message; [`IntError::exit`]
/// decides what the retry scheduler sees.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum IntError {
    // -- Settings --
    /// The printer address string could not be parsed.
    #[error("syntax error in printer address: {0}")]
    InvalidAddress(String),

    /// An interface option was unrecognized or had a bad value.
    #[error("option parsing error: {0}")]
    InvalidOption(String),

    /// The job's settings are incompatible with this port.
    #[error("job incompatible with port: {0}")]
    IncompatibleJob(String),

    // -- Address resolution --
    /// Name lookup found no printer.
    #[error("address lookup failed for \"{name}\"")]
    LookupFailed {
        /// The name that was looked up.
        name: String,
        /// Whether the lookup might succeed later (DNS hiccup vs. a port
        /// path that does not exist).
        transient: bool,
    },

    // -- Connection --
    /// The printer answered but is serving another client.
    #[error("printer engaged: {0}")]
    Engaged(String),

    /// The printer did not answer at all.
    #[error("printer not responding: {what}")]
    NotResponding {
        /// Address or port description.
        what: String,
        /// The underlying OS error, when one exists.
        #[source]
        source: Option<io::Error>,
    },

    /// Permission to the port or queue was denied.
    #[error("access denied: {what}")]
    AccessDenied {
        /// Port path or queue description.
        what: String,
        /// The underlying OS error, when one exists.
        #[source]
        source: Option<io::Error>,
    },

    /// The system is out of a resource (file handles, STREAMS).
    #[error("out of system resources")]
    Starved(#[source] io::Error),

    // -- Data transfer --
    /// A printer-side error worth retrying after a backoff.
    #[error("printer error: {context}")]
    PrinterError {
        /// What the interface was doing.
        context: String,
        /// The underlying OS error, when one exists.
        #[source]
        source: Option<io::Error>,
    },

    /// A printer-side error with no hope of retry.
    #[error("unrecoverable printer error: {0}")]
    PrinterErrorNoRetry(String),

    /// The port repeatedly claimed write readiness and then accepted
    /// nothing. Retrying would loop forever against broken hardware.
    #[error("port claims readiness but accepts no data")]
    Misbehaving,

    /// A protocol violation by the remote print server.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The upstream driver pipe failed mid-job.
    #[error("upstream pipe failed")]
    Upstream(#[source] io::Error),

    /// The job itself is defective.
    #[error("defective job: {0}")]
    JobError(String),

    /// A termination signal arrived; cleanup already ran.
    #[error("terminated by signal")]
    Canceled,
}

impl IntError {
    /// The exit code the spooler driver should see for this failure.
    pub fn exit(&self) -> Exit {
        match self {
            IntError::InvalidAddress(_)
            | IntError::InvalidOption(_)
            | IntError::IncompatibleJob(_) => Exit::BadSettings,
            IntError::LookupFailed { transient, .. } => {
                if *transient {
                    Exit::NoSuchAddress
                } else {
                    Exit::NoSuchAddressNoRetry
                }
            }
            IntError::Engaged(_) => Exit::Engaged,
            IntError::NotResponding { .. } => Exit::NotResponding,
            IntError::AccessDenied { .. } => Exit::AccessDenied,
            IntError::Starved(_) => Exit::Starved,
            IntError::PrinterError { .. } | IntError::Protocol(_) | IntError::Upstream(_) => {
                Exit::PrinterError
            }
            IntError::PrinterErrorNoRetry(_) | IntError::Misbehaving => Exit::PrinterErrorNoRetry,
            IntError::JobError(_) => Exit::JobError,
            IntError::Canceled => Exit::Signal,
        }
    }

    /// Returns `true` if the driver's scheduler would retry after this error.
    pub fn is_retryable(&self) -> bool {
        self.exit().is_retryable()
    }
}

/// Report a failure at the process edge.
///
/// Posts the operator alert (the error as the opening line, causes as
/// continuation lines) and returns the exit code for the driver. This is
/// the one place an [`IntError`] turns into an [`Exit`].
pub fn report_failure(log: &AlertLog, err: &IntError) -> Exit {
    alert!(log, true, "{err}");
    let mut cause = err.source();
    while let Some(inner) = cause {
        alert!(log, false, "{inner}");
        cause = inner.source();
    }
    err.exit()
}

/// Classify an OS error from a port syscall into the taxonomy.
///
/// The mapping is the shared contract of the character-device transports:
/// missing device files are permanent address failures, permission problems
/// are access denials, resource exhaustion is starvation, and anything else
/// is a retryable printer error.
pub fn classify(doing: &str, what: &str, err: io::Error) -> IntError {
    let errno = err.raw_os_error().map(Errno::from_raw);
    match errno {
        Some(Errno::EACCES) => IntError::AccessDenied {
            what: what.to_owned(),
            source: Some(err),
        },
        Some(Errno::ENOENT | Errno::ENOTDIR | Errno::ENXIO) => IntError::LookupFailed {
            name: what.to_owned(),
            transient: false,
        },
        Some(Errno::ENFILE | Errno::EMFILE | Errno::ENOSR) => IntError::Starved(err),
        Some(Errno::EBUSY) => IntError::Engaged(format!("\"{what}\" is in use")),
        _ => IntError::PrinterError {
            context: format!("{doing} \"{what}\" failed"),
            source: Some(err),
        },
    }
}
