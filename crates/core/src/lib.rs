//! Shared vocabulary between the jetpipe spooler driver and the printer
//! interface programs it launches.
//!
//! An interface program receives a parsed invocation (the [`CommandContext`]),
//! moves one or more jobs' bytes to a printer, and reports its outcome three
//! ways: advisory `%%[ ... ]%%` feedback lines on its output pipe (the
//! [`feedback`] module), operator-facing fault messages through the single
//! [`alert`] funnel, and a process [`Exit`] code that the driver's retry
//! scheduler interprets. This crate defines all three so that every
//! transport produces identical telemetry.

#![warn(missing_docs)]

/// Operator-facing alert log (one consistent message format per failure).
pub mod alert;
/// The parsed interface invocation and its enumerated settings.
pub mod context;
/// The bit-exact exit-code taxonomy consumed by the retry scheduler.
pub mod exit;
/// Advisory `%%[ ... ]%%` feedback lines written toward the driver.
pub mod feedback;

pub use alert::AlertLog;
pub use context::{Codes, CommandContext, Jobbreak};
pub use exit::Exit;
pub use feedback::{FeedbackLine, FeedbackWriter, PrinterFault};
