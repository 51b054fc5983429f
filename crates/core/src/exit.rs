//! Exit codes for printer interface programs.
//!
//! The spooler driver decides whether and how to reschedule a job entirely
//! from the interface's exit code, so the numeric values are a wire contract
//! and must never be renumbered.

/// Outcome of one interface invocation, as seen by the spooler driver.
///
/// The discriminants are the literal process exit codes. `Engaged` and the
/// two lookup-failure codes exist so the driver can distinguish "try again
/// shortly" from "wait for the operator".
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Exit {
    /// The job was printed normally.
    Printed = 0,
    /// A printer error occurred; worth retrying after a backoff.
    PrinterError = 1,
    /// A printer error with no hope of retry.
    PrinterErrorNoRetry = 2,
    /// The job itself is defective.
    JobError = 3,
    /// Terminated after catching a signal.
    Signal = 4,
    /// The printer is otherwise engaged (busy with another client, or the
    /// connection was refused).
    Engaged = 5,
    /// Starved for system resources (file handles, memory, STREAMS).
    Starved = 6,
    /// Access denied: bad password or bad port permissions.
    AccessDenied = 7,
    /// The printer does not answer at all (turned off?).
    NotResponding = 8,
    /// The interface settings are invalid.
    BadSettings = 9,
    /// Address lookup failed; possibly transient.
    NoSuchAddress = 10,
    /// Address lookup failed; not transient.
    NoSuchAddressNoRetry = 11,
}

impl Exit {
    /// The highest code an interface may legitimately return.
    pub const MAX: i32 = Exit::NoSuchAddressNoRetry as i32;

    /// The process exit code for this outcome.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether the driver's scheduler should retry the job after a backoff.
    ///
    /// `Engaged` retries sooner than the error codes; `Signal` is left to
    /// operator policy and reported as non-retryable here.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Exit::PrinterError
                | Exit::Engaged
                | Exit::Starved
                | Exit::NotResponding
                | Exit::NoSuchAddress
        )
    }

    /// Interpret an exit code reported by a child interface process.
    ///
    /// Returns `None` for codes outside the interface taxonomy.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Exit::Printed,
            1 => Exit::PrinterError,
            2 => Exit::PrinterErrorNoRetry,
            3 => Exit::JobError,
            4 => Exit::Signal,
            5 => Exit::Engaged,
            6 => Exit::Starved,
            7 => Exit::AccessDenied,
            8 => Exit::NotResponding,
            9 => Exit::BadSettings,
            10 => Exit::NoSuchAddress,
            11 => Exit::NoSuchAddressNoRetry,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_bit_exact() {
        assert_eq!(Exit::Printed.code(), 0);
        assert_eq!(Exit::PrinterError.code(), 1);
        assert_eq!(Exit::PrinterErrorNoRetry.code(), 2);
        assert_eq!(Exit::JobError.code(), 3);
        assert_eq!(Exit::Signal.code(), 4);
        assert_eq!(Exit::Engaged.code(), 5);
        assert_eq!(Exit::Starved.code(), 6);
        assert_eq!(Exit::AccessDenied.code(), 7);
        assert_eq!(Exit::NotResponding.code(), 8);
        assert_eq!(Exit::BadSettings.code(), 9);
        assert_eq!(Exit::NoSuchAddress.code(), 10);
        assert_eq!(Exit::NoSuchAddressNoRetry.code(), 11);
        assert_eq!(Exit::MAX, 11);
    }

    #[test]
    fn round_trip_all_codes() {
        for code in 0..=Exit::MAX {
            let exit = Exit::from_code(code).expect("code in range");
            assert_eq!(exit.code(), code);
        }
        assert_eq!(Exit::from_code(12), None);
        assert_eq!(Exit::from_code(-1), None);
    }

    #[test]
    fn retryability_split() {
        assert!(Exit::PrinterError.is_retryable());
        assert!(Exit::Engaged.is_retryable());
        assert!(Exit::Starved.is_retryable());
        assert!(Exit::NotResponding.is_retryable());
        assert!(Exit::NoSuchAddress.is_retryable());

        assert!(!Exit::Printed.is_retryable());
        assert!(!Exit::PrinterErrorNoRetry.is_retryable());
        assert!(!Exit::JobError.is_retryable());
        assert!(!Exit::AccessDenied.is_retryable());
        assert!(!Exit::BadSettings.is_retryable());
        assert!(!Exit::NoSuchAddressNoRetry.is_retryable());
    }
}
