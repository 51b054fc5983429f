//! Parsing for the transport option string.
//!
//! The driver hands every interface one free-form string of
//! whitespace-separated `name=value` pairs, e.g.
//! `speed=9600 parity=none xonxoff=yes`. Values containing spaces may be
//! double-quoted. Each transport walks the pairs and rejects names it does
//! not know; a typo in a queue definition must fail loudly, not silently.

use std::time::Duration;

use crate::error::IntError;

/// One `name=value` pair from the option string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionPair {
    /// The keyword left of `=`.
    pub name: String,
    /// The value right of `=`, with surrounding quotes removed.
    pub value: String,
}

/// Split an option string into its `name=value` pairs.
pub fn parse_pairs(options: &str) -> Result<Vec<OptionPair>, IntError> {
    let mut pairs = Vec::new();
    let mut rest = options.trim_start();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            return Err(IntError::InvalidOption(format!(
                "missing \"=\" near \"{rest}\""
            )));
        };
        let name = rest[..eq].trim_end();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(IntError::InvalidOption(format!(
                "missing keyword near \"{rest}\""
            )));
        }
        rest = rest[eq + 1..].trim_start();

        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(close) = stripped.find('"') else {
                return Err(IntError::InvalidOption(format!(
                    "unterminated quote in value of \"{name}\""
                )));
            };
            value = &stripped[..close];
            rest = &stripped[close + 1..];
        } else {
            let end = rest
                .find(char::is_whitespace)
                .unwrap_or(rest.len());
            value = &rest[..end];
            rest = &rest[end..];
        }

        pairs.push(OptionPair {
            name: name.to_owned(),
            value: value.to_owned(),
        });
        rest = rest.trim_start();
    }

    Ok(pairs)
}

/// Interpret a boolean option value (`yes`/`no`, `true`/`false`, `on`/`off`,
/// `1`/`0`).
pub fn parse_bool(pair: &OptionPair) -> Result<bool, IntError> {
    match pair.value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        _ => Err(IntError::InvalidOption(format!(
            "\"{}=\" must be a boolean, not \"{}\"",
            pair.name, pair.value
        ))),
    }
}

/// Interpret a non-negative integer option value.
pub fn parse_u32(pair: &OptionPair) -> Result<u32, IntError> {
    pair.value.parse::<u32>().map_err(|_| {
        IntError::InvalidOption(format!(
            "\"{}=\" must be a non-negative integer, not \"{}\"",
            pair.name, pair.value
        ))
    })
}

/// Interpret an option value as whole seconds; zero means "off".
pub fn parse_interval(pair: &OptionPair) -> Result<Option<Duration>, IntError> {
    let secs = parse_u32(pair)?;
    Ok((secs > 0).then(|| Duration::from_secs(u64::from(secs))))
}

/// The rejection for a keyword no transport option table claims.
pub fn unrecognized(pair: &OptionPair) -> IntError {
    IntError::InvalidOption(format!("unrecognized keyword \"{}\"", pair.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_pairs() {
        let pairs = parse_pairs("speed=9600 parity=none xonxoff=yes").unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].name, "speed");
        assert_eq!(pairs[0].value, "9600");
        assert_eq!(pairs[2].name, "xonxoff");
        assert_eq!(pairs[2].value, "yes");
    }

    #[test]
    fn quoted_value_keeps_spaces() {
        let pairs = parse_pairs("smb_community=\"not public\" sleep=3").unwrap();
        assert_eq!(pairs[0].value, "not public");
        assert_eq!(pairs[1].name, "sleep");
    }

    #[test]
    fn empty_string_is_no_options() {
        assert!(parse_pairs("").unwrap().is_empty());
        assert!(parse_pairs("   ").unwrap().is_empty());
    }

    #[test]
    fn missing_equals_rejected() {
        assert!(matches!(
            parse_pairs("speed"),
            Err(IntError::InvalidOption(_))
        ));
    }

    #[test]
    fn unterminated_quote_rejected() {
        assert!(matches!(
            parse_pairs("name=\"oops"),
            Err(IntError::InvalidOption(_))
        ));
    }

    #[test]
    fn helpers() {
        let p = |name: &str, value: &str| OptionPair {
            name: name.into(),
            value: value.into(),
        };
        assert!(parse_bool(&p("x", "yes")).unwrap());
        assert!(!parse_bool(&p("x", "off")).unwrap());
        assert!(parse_bool(&p("x", "maybe")).is_err());
        assert_eq!(parse_u32(&p("n", "30")).unwrap(), 30);
        assert!(parse_u32(&p("n", "-1")).is_err());
        assert_eq!(parse_interval(&p("t", "0")).unwrap(), None);
        assert_eq!(
            parse_interval(&p("t", "15")).unwrap(),
            Some(Duration::from_secs(15))
        );
    }
}
