//! Kernel command line parsing utilities.
//!
//! Used both for the running kernel's boot arguments and for the argument
//! strings embedded in `STARTUP_*` descriptor files.

use std::borrow::Cow;

use anyhow::{Context, Result};
use camino::Utf8Path;

/// A parsed kernel command line.
#[derive(Debug)]
pub(crate) struct Cmdline<'a>(Cow<'a, str>);

impl<'a> From<&'a str> for Cmdline<'a> {
    fn from(input: &'a str) -> Self {
        Self(Cow::Borrowed(input))
    }
}

impl Cmdline<'static> {
    /// Reads boot arguments as exposed by the device tree; the value is
    /// NUL-terminated there.
    pub(crate) fn from_path(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read(path).with_context(|| format!("Reading {path}"))?;
        let s = String::from_utf8_lossy(&buf);
        Ok(Self(Cow::Owned(s.trim_end_matches('\0').to_owned())))
    }
}

impl<'a> Cmdline<'a> {
    /// Returns an iterator over all parameters in the command line.
    ///
    /// Splits on whitespace that is not inside double quotes.
    pub(crate) fn iter(&'a self) -> impl Iterator<Item = Parameter<'a>> + 'a {
        let mut in_quotes = false;

        self.0
            .split(move |c: char| {
                if c == '"' {
                    in_quotes = !in_quotes;
                }
                !in_quotes && (c.is_whitespace() || c == '\0')
            })
            .filter(|s| !s.is_empty())
            .map(Parameter::from)
    }

    /// Locate a kernel argument with the given key name.
    ///
    /// Key comparison treats dashes and underscores as equivalent.
    pub(crate) fn find(&'a self, key: &str) -> Option<Parameter<'a>> {
        self.iter().find(|p| keys_equal(p.key, key))
    }

    /// Locate the value of the kernel argument with the given key name.
    pub(crate) fn value_of(&'a self, key: &str) -> Option<&'a str> {
        self.find(key).and_then(|p| p.value)
    }
}

fn keys_equal(a: &str, b: &str) -> bool {
    let norm = |c: char| if c == '-' { '_' } else { c };
    a.len() == b.len() && a.chars().map(norm).eq(b.chars().map(norm))
}

/// A single kernel command line parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Parameter<'a> {
    /// The parameter key
    pub(crate) key: &'a str,
    /// The parameter value, with surrounding double quotes removed
    pub(crate) value: Option<&'a str>,
}

impl<'a> From<&'a str> for Parameter<'a> {
    fn from(input: &'a str) -> Self {
        match input.split_once('=') {
            Some((key, value)) => {
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                Self {
                    key,
                    value: Some(value),
                }
            }
            None => Self {
                key: input,
                value: None,
            },
        }
    }
}
