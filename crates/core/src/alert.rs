//! The operator-facing alert funnel.
//!
//! Every fault an interface can hit, regardless of transport, is reported
//! through one call so that operators see a single consistent format. An
//! alert is a block of lines: the first line opens the block (and gets a
//! timestamp header), continuation lines add detail.

use std::fmt::Arguments;
use std::io::Write;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// A sink for operator alerts about one printer.
///
/// Production interfaces point this at the printer's alert file; tests point
/// it at a buffer. All writes are line-buffered and flushed per alert so a
/// crash right after reporting loses nothing.
pub struct AlertLog {
    printer: String,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl AlertLog {
    /// An alert log for `printer` writing to the given sink.
    pub fn new(printer: impl Into<String>, sink: Box<dyn Write + Send>) -> Self {
        Self {
            printer: printer.into(),
            sink: Mutex::new(sink),
        }
    }

    /// An alert log writing to standard error.
    pub fn stderr(printer: impl Into<String>) -> Self {
        Self::new(printer, Box::new(std::io::stderr()))
    }

    /// Post one alert line.
    ///
    /// `first` opens a new alert block with a timestamp header; `false`
    /// continues the current block. Errors writing the alert itself are
    /// swallowed: the alert path must never become a second failure.
    pub fn post(&self, first: bool, message: Arguments<'_>) {
        tracing::error!(printer = %self.printer, "{message}");
        let Ok(mut sink) = self.sink.lock() else {
            return;
        };
        if first {
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let _ = writeln!(sink, "[{stamp}] printer \"{}\":", self.printer);
        }
        let _ = writeln!(sink, "  {message}");
        let _ = sink.flush();
    }
}

/// Post an alert, `format!`-style.
///
/// The first argument is the [`AlertLog`], the second whether this line
/// opens a new alert block.
#[macro_export]
macro_rules! alert {
    ($log:expr, $first:expr, $($arg:tt)*) => {
        $log.post($first, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn first_line_opens_block() {
        let buf = SharedBuf::default();
        let log = AlertLog::new("testprn", Box::new(buf.clone()));
        alert!(log, true, "connection to printer lost");
        alert!(log, false, "errno was {}", 5);

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("printer \"testprn\":"));
        assert!(text.contains("  connection to printer lost"));
        assert!(text.contains("  errno was 5"));
        // One header for the two lines.
        assert_eq!(text.matches("testprn").count(), 1);
    }
}
