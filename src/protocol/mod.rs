//! Line Protocol Implementation
//!
//! This module implements the newline-delimited text protocol spoken by the
//! instrument server.
//!
//! ## Overview
//!
//! Every request and every reply is one line of text ending in `\n`. The
//! protocol carries no request identifier: replies are matched to requests
//! purely by order.
//!
//! ## Modules
//!
//! - `types`: `Command` and `Response` value types
//! - `framer`: incremental line decoder plus the reader/writer framers
//!
//! ## Example
//!
//! ```
//! use linkwire::protocol::{decode_line, encode_line, Command};
//! use bytes::BytesMut;
//!
//! let cmd = Command::new("getDebug").unwrap();
//!
//! let mut wire = BytesMut::new();
//! encode_line(cmd.as_str(), &mut wire).unwrap();
//! assert_eq!(&wire[..], b"getDebug\n");
//!
//! let line = decode_line(&mut wire, 4096).unwrap().unwrap();
//! assert_eq!(&line[..], b"getDebug");
//! ```

pub mod framer;
pub mod types;

// Re-export commonly used types for convenience
pub use framer::{
    decode_line, encode_line, FrameError, LineDecoder, LineReader, LineWriter, DEFAULT_MAX_LINE,
};
pub use types::{Command, CommandError, Response, TERMINATOR};
