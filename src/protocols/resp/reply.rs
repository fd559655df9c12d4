//! Typed replies.

use super::parser::Frame;
use bytes::Bytes;
use std::fmt;

/// The value a server returned for one command.
///
/// Equality is strict: two replies are equal only if they are the same kind
/// and carry the same value, so `Integer(5)` and `Bulk("5")` differ, as do
/// `Status("OK")` and `Bulk("OK")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Simple string (`+OK`)
    Status(String),
    /// Error reply (`-ERR ...`); a value, not a harness failure
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Array(Vec<Reply>),
    /// Null bulk string or null array
    Nil,
}

impl Reply {
    /// Short name of the reply kind, used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Status(_) => "status",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::Bulk(_) => "bulk",
            Reply::Array(_) => "array",
            Reply::Nil => "nil",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

impl From<Frame> for Reply {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Simple(s) => Reply::Status(s),
            Frame::Error(s) => Reply::Error(s),
            Frame::Integer(n) => Reply::Integer(n),
            Frame::Bulk(Some(data)) => Reply::Bulk(data),
            Frame::Bulk(None) | Frame::Array(None) => Reply::Nil,
            Frame::Array(Some(frames)) => {
                Reply::Array(frames.into_iter().map(Reply::from).collect())
            }
        }
    }
}

/// Rendered the way `redis-cli` prints replies.
impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{s}"),
            Reply::Error(s) => write!(f, "(error) {s}"),
            Reply::Integer(n) => write!(f, "(integer) {n}"),
            Reply::Bulk(data) => write!(f, "{:?}", String::from_utf8_lossy(data)),
            Reply::Nil => write!(f, "(nil)"),
            Reply::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            Reply::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}) {item}", i + 1)?;
                }
                Ok(())
            }
        }
    }
}
