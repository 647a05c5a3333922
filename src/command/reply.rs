//! Structured command replies

use crate::error::Error;
use bytes::Bytes;
use std::fmt;

/// Reply produced by a command
///
/// Encoding onto a wire format is left to the front end; `Display` renders a
/// human-readable form for the CLI.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Nil,
    Integer(i64),
    SimpleString(String),
    /// Multi-line text shown as-is
    Verbatim(String),
    Bulk(Bytes),
    StringArray(Vec<String>),
    Array(Vec<Reply>),
    Error(String),
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Text of an error reply
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Reply::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

impl From<Error> for Reply {
    fn from(e: Error) -> Self {
        Reply::Error(e.to_string())
    }
}

impl<T: Into<Reply>> From<crate::error::Result<T>> for Reply {
    fn from(res: crate::error::Result<T>) -> Self {
        match res {
            Ok(r) => r.into(),
            Err(e) => e.into(),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => write!(f, "OK"),
            Reply::Nil => write!(f, "(nil)"),
            Reply::Integer(n) => write!(f, "(integer) {}", n),
            Reply::SimpleString(s) => write!(f, "{}", s),
            Reply::Verbatim(s) => write!(f, "{}", s),
            Reply::Bulk(b) => write!(f, "\"{}\"", String::from_utf8_lossy(b)),
            Reply::StringArray(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) \"{}\"", i + 1, item)?;
                }
                Ok(())
            }
            Reply::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, item)?;
                }
                Ok(())
            }
            Reply::Error(msg) => write!(f, "(error) ERR {}", msg),
        }
    }
}
