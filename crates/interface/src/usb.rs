//! USB line-printer port transport.
//!
//! The address is either a device node (`/dev/usb/lp0`) or an IEEE 1284
//! device-ID search such as `MFG:HP;MDL:DeskJet 990C;` which is matched
//! against every connected USB printer. Searching by identity survives
//! the port renumbering that happens when printers are unplugged and
//! replugged in a different order.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use jetpipe_core::context::Jobbreak;
use jetpipe_core::feedback::{FeedbackWriter, PrinterFault};
use jetpipe_core::CommandContext;

use crate::chardev::{CharDevLink, open_port, reject_binary_codes, reject_signal_jobbreak};
use crate::engine::EngineOptions;
use crate::error::IntError;
use crate::options::{self, parse_interval};
use crate::{Link, ReadOutcome, WriteOutcome};

/// Device node patterns, in the order Linux has used them.
const PORT_PATTERNS: &[&str] = &["/dev/usb/lp{}", "/dev/usb/usblp{}", "/dev/usblp{}"];
const MAX_PORTS: u32 = 16;

/// An IEEE 1284.4 init sequence some printers need ahead of the job.
const INIT_1284_4: &[u8] = b"\x1d\x00\x00\x00\x1b\x01@EJL 1284.4\n@EJL     \n\x1b@";

/// The identity fields of an IEEE 1284 device ID string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceId {
    /// `MFG:` (or `MANUFACTURER:`) field.
    pub mfg: Option<String>,
    /// `MDL:` (or `MODEL:`) field.
    pub mdl: Option<String>,
    /// `SERN:` field.
    pub sern: Option<String>,
}

impl DeviceId {
    /// Parse the `KEY:value;` pairs of a device ID or search string.
    ///
    /// Keys other than the three identity fields are ignored in printer
    /// responses but rejected in a search string, where they would silently
    /// match nothing.
    pub fn parse(s: &str, strict: bool) -> Result<Self, IntError> {
        let mut id = Self::default();
        for item in s.split(';') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let Some((key, value)) = item.split_once(':') else {
                if strict {
                    return Err(IntError::InvalidAddress(format!(
                        "unrecognized search key in address: {item}"
                    )));
                }
                continue;
            };
            match key {
                "MFG" | "MANUFACTURER" => id.mfg = Some(value.to_owned()),
                "MDL" | "MODEL" => id.mdl = Some(value.to_owned()),
                "SERN" => id.sern = Some(value.to_owned()),
                _ if strict => {
                    return Err(IntError::InvalidAddress(format!(
                        "unrecognized search key in address: {key}"
                    )));
                }
                _ => {}
            }
        }
        Ok(id)
    }

    /// Whether a printer's reported identity satisfies this search.
    /// Unspecified search fields match anything.
    pub fn matches(&self, found: &DeviceId) -> bool {
        let field = |want: &Option<String>, have: &Option<String>| match want {
            None => true,
            Some(w) => have.as_deref() == Some(w.as_str()),
        };
        field(&self.mfg, &found.mfg)
            && field(&self.mdl, &found.mdl)
            && field(&self.sern, &found.sern)
    }
}

/// Read a port's IEEE 1284 device ID from sysfs.
fn device_id_for(port: &Path) -> Option<String> {
    let name = port.file_name()?.to_str()?;
    let sysfs = PathBuf::from(format!("/sys/class/usbmisc/{name}/device/ieee1284_id"));
    std::fs::read_to_string(sysfs).ok()
}

/// Find the device node of the printer matching a search string.
fn find_usb_printer(address: &str) -> Result<PathBuf, IntError> {
    let search = DeviceId::parse(address, true)?;

    for pattern in PORT_PATTERNS {
        if !Path::new(&pattern.replace("{}", "0")).exists() {
            continue;
        }
        for i in 0..MAX_PORTS {
            let port = PathBuf::from(pattern.replace("{}", &i.to_string()));
            if !port.exists() {
                break;
            }
            let Some(raw_id) = device_id_for(&port) else {
                tracing::debug!(port = %port.display(), "no device ID readable");
                continue;
            };
            let found = DeviceId::parse(&raw_id, false)?;
            if search.matches(&found) {
                return Ok(port);
            }
        }
    }

    // The printer may simply be unplugged right now; worth retrying.
    Err(IntError::PrinterError {
        context: format!("no printer matching \"{address}\" is presently connected"),
        source: None,
    })
}

/// Options accepted by the USB transport.
#[derive(Debug, Clone)]
pub struct UsbOptions {
    /// Keepalive interval while the outbound side is idle.
    pub idle_status_interval: Option<Duration>,
    /// Interval between out-of-band status checks.
    pub status_interval: Option<Duration>,
    /// Init sequence to send ahead of the first job.
    pub init: Vec<u8>,
}

impl UsbOptions {
    /// Parse the option string, applying this transport's defaults.
    pub fn parse(ctx: &CommandContext) -> Result<Self, IntError> {
        let default_idle = (ctx.status_queries_usable() && ctx.jobbreak == Jobbreak::ControlD)
            .then(|| Duration::from_secs(15));
        let mut opts = Self {
            idle_status_interval: default_idle,
            status_interval: None,
            init: Vec::new(),
        };

        for pair in options::parse_pairs(&ctx.options)? {
            match pair.name.as_str() {
                "idle_status_interval" => opts.idle_status_interval = parse_interval(&pair)?,
                "status_interval" => opts.status_interval = parse_interval(&pair)?,
                "init" => match pair.value.as_str() {
                    "1284.4" => opts.init = INIT_1284_4.to_vec(),
                    other => {
                        return Err(IntError::InvalidOption(format!(
                            "unknown init sequence \"{other}\""
                        )));
                    }
                },
                _ => return Err(options::unrecognized(&pair)),
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
            status_interval: self.status_interval,
            preamble: self.init.clone(),
        }
    }
}

/// A [`Link`] over a USB line-printer port.
pub struct UsbLink {
    dev: CharDevLink,
}

impl UsbLink {
    /// Resolve the address to a port and open it.
    pub fn open<W: Write>(
        ctx: &CommandContext,
        _opts: &UsbOptions,
        _fb: &mut FeedbackWriter<W>,
    ) -> Result<Self, IntError> {
        reject_signal_jobbreak(ctx, "usb")?;
        reject_binary_codes(ctx, "usb")?;

        let port = if ctx.address.starts_with('/') {
            PathBuf::from(&ctx.address)
        } else {
            find_usb_printer(&ctx.address)?
        };
        tracing::debug!(port = %port.display(), "opening USB printer port");

        let file = open_port(&port, ctx)?;
        Ok(Self {
            dev: CharDevLink::new(file),
        })
    }

    /// The underlying device, for readiness registration.
    pub fn dev(&self) -> &CharDevLink {
        &self.dev
    }
}

impl Link for UsbLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, IntError> {
        self.dev.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, IntError> {
        self.dev.write(buf)
    }

    fn keepalive(&mut self) -> Result<(), IntError> {
        self.dev.keepalive()
    }

    fn poll_status(&mut self) -> Result<Option<PrinterFault>, IntError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_printer_device_id() {
        let id = DeviceId::parse(
            "MFG:Hewlett-Packard;MDL:DeskJet 990C;SERN:US05N1J00XLG;CMD:MLC,PCL,PML;",
            false,
        )
        .unwrap();
        assert_eq!(id.mfg.as_deref(), Some("Hewlett-Packard"));
        assert_eq!(id.mdl.as_deref(), Some("DeskJet 990C"));
        assert_eq!(id.sern.as_deref(), Some("US05N1J00XLG"));
    }

    #[test]
    fn search_string_rejects_unknown_keys() {
        assert!(DeviceId::parse("MFG:HP;CMD:PCL;", true).is_err());
        assert!(DeviceId::parse("MFG:HP;MDL:X;", true).is_ok());
    }

    #[test]
    fn matching_honors_only_specified_fields() {
        let search = DeviceId {
            mfg: Some("HP".into()),
            mdl: None,
            sern: None,
        };
        let a = DeviceId {
            mfg: Some("HP".into()),
            mdl: Some("DeskJet".into()),
            sern: Some("1".into()),
        };
        let b = DeviceId {
            mfg: Some("Epson".into()),
            ..DeviceId::default()
        };
        assert!(search.matches(&a));
        assert!(!search.matches(&b));

        let exact = DeviceId {
            mfg: Some("HP".into()),
            mdl: Some("DeskJet".into()),
            sern: Some("2".into()),
        };
        assert!(!exact.matches(&a), "serial number must match when given");
    }

    #[test]
    fn init_option_selects_known_sequence() {
        let mut ctx = CommandContext::new("prn", "/dev/usb/lp0");
        ctx.options = "init=1284.4".into();
        let opts = UsbOptions::parse(&ctx).unwrap();
        assert_eq!(opts.init, INIT_1284_4);
        assert_eq!(opts.engine_options().preamble, INIT_1284_4);

        ctx.options = "init=zap".into();
        assert!(UsbOptions::parse(&ctx).is_err());
    }
}
