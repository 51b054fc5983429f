//! The parsed interface invocation.
//!
//! The spooler driver launches an interface program with the printer name,
//! the transport address, a transport-specific option string, and a handful
//! of enumerated settings. The driver parses all of that before exec; the
//! interface consumes it read-only through [`CommandContext`].

/// How the driver marks the boundary between jobs on a persistent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jobbreak {
    /// No job-break support; the connection carries exactly one job.
    #[default]
    None,
    /// Out-of-band interrupt handshake between driver and interface.
    Signal,
    /// A control-D byte in the data stream marks the boundary.
    ControlD,
    /// HP's Printer Job Language framing.
    Pjl,
    /// Interrupt handshake combined with PJL framing.
    SignalPjl,
    /// PostScript save/restore bracketing.
    SaveRestore,
    /// A fresh interface process per job.
    NewInterface,
}

impl Jobbreak {
    /// Whether this method uses the out-of-band interrupt handshake.
    ///
    /// Transports that cannot survive the handshake (their open sequence is
    /// not idempotent, or the protocol has no EOJ marker) reject these
    /// methods with a bad-settings outcome before connecting.
    pub fn uses_signal(self) -> bool {
        matches!(self, Jobbreak::Signal | Jobbreak::SignalPjl)
    }
}

/// Which byte values the path to the printer can carry intact.
///
/// Declared per job by the driver. Transports that strip the high bit (7-bit
/// serial lines) must refuse jobs that need more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codes {
    /// Not declared; assume the conservative default.
    #[default]
    Unknown,
    /// Printable ASCII plus a few controls; safe on any path.
    Clean7Bit,
    /// All byte values except a few controls.
    Clean8Bit,
    /// Every byte value 0–255 must pass through unmodified.
    Binary,
    /// Tagged binary communications protocol quoting.
    Tbcp,
}

/// One interface invocation, parsed by the driver and consumed read-only.
///
/// Lives for exactly one process. The `options` string is interpreted by the
/// transport adapter; everything else is interpreted here or by the engine.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Queue name, e.g. `"myprn"`. Used in alerts and the address cache.
    pub printer: String,
    /// Transport address, e.g. `"My Printer:LaserWriter@Front Office"` or
    /// `"192.168.1.55:9100"`.
    pub address: String,
    /// Transport-specific option string, e.g. `"idle_status_interval=60"`.
    pub options: String,
    /// Job boundary method negotiated by the driver.
    pub jobbreak: Jobbreak,
    /// Whether the printer→driver feedback direction is open.
    pub feedback: bool,
    /// Byte values the job requires the transport to pass.
    pub codes: Codes,
    /// Full job id, e.g. `"mouse:myprn-1001.0(mouse)"`.
    pub jobname: String,
    /// Routing instructions for the operator, possibly empty.
    pub routing: String,
    /// The user the job is for, possibly empty.
    pub forline: String,
    /// Non-PostScript job language, empty for PostScript.
    ///
    /// When non-empty the job data is opaque to the printer's status
    /// channel, so synthetic status queries must stay off.
    pub barbarlang: String,
}

impl CommandContext {
    /// A context with the given printer and address and default settings.
    pub fn new(printer: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            printer: printer.into(),
            address: address.into(),
            options: String::new(),
            jobbreak: Jobbreak::default(),
            feedback: false,
            codes: Codes::default(),
            jobname: String::new(),
            routing: String::new(),
            forline: String::new(),
            barbarlang: String::new(),
        }
    }

    /// Whether synthetic status queries (keepalive control bytes) are usable.
    ///
    /// They require the feedback direction and a PostScript job; a foreign
    /// job language would misinterpret the control byte.
    pub fn status_queries_usable(&self) -> bool {
        self.feedback && self.barbarlang.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_methods() {
        assert!(Jobbreak::Signal.uses_signal());
        assert!(Jobbreak::SignalPjl.uses_signal());
        assert!(!Jobbreak::None.uses_signal());
        assert!(!Jobbreak::ControlD.uses_signal());
        assert!(!Jobbreak::Pjl.uses_signal());
        assert!(!Jobbreak::SaveRestore.uses_signal());
        assert!(!Jobbreak::NewInterface.uses_signal());
    }

    #[test]
    fn status_queries_need_feedback_and_postscript() {
        let mut ctx = CommandContext::new("prn", "addr");
        assert!(!ctx.status_queries_usable());

        ctx.feedback = true;
        assert!(ctx.status_queries_usable());

        ctx.barbarlang = "pcl".into();
        assert!(!ctx.status_queries_usable());
    }
}
