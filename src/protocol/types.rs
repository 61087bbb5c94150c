//! Line Protocol Value Types
//!
//! The instrument speaks a plain text protocol: one request or reply per
//! line, each terminated by a single `\n`. There is no length prefix, no
//! checksum and no request identifier.
//!
//! ## Examples
//!
//! ```text
//! > getDebug\n
//! < 0\n
//! > setCurrent 200.0\n
//! < OK\n
//! ```
//!
//! [`Command`] is validated on construction so that a value of that type can
//! always be written without desynchronizing the stream. [`Response`] is
//! whatever the instrument sent back, minus the terminator.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The only framing byte of the protocol
pub const TERMINATOR: u8 = b'\n';

/// Why a piece of text cannot be sent as a command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("command is empty")]
    Empty,

    #[error("command contains a line terminator at byte {0}")]
    EmbeddedTerminator(usize),
}

/// A single instrument request, without its terminator.
///
/// # Example
///
/// ```
/// use linkwire::protocol::Command;
///
/// let cmd = Command::new("getVoltage").unwrap();
/// assert_eq!(cmd.as_str(), "getVoltage");
/// assert!(Command::new("get\nVoltage").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command(String);

impl Command {
    /// Validates and wraps command text.
    pub fn new(text: impl Into<String>) -> Result<Self, CommandError> {
        let text = text.into();
        if text.is_empty() {
            return Err(CommandError::Empty);
        }
        if let Some(pos) = text.bytes().position(|b| b == TERMINATOR) {
            return Err(CommandError::EmbeddedTerminator(pos));
        }
        Ok(Command(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Size on the wire, terminator included.
    pub fn wire_len(&self) -> usize {
        self.0.len() + 1
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Command {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::new(s)
    }
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Command::new(s)
    }
}

impl TryFrom<String> for Command {
    type Error = CommandError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Command::new(s)
    }
}

/// One reply line from the instrument, terminator stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Response(String);

impl Response {
    pub fn new(text: impl Into<String>) -> Self {
        Response(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Response {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Response {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Response {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
