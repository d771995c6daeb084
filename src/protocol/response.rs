//! Response Framing
//!
//! Responses begin with `OK` or `ERR`; REGX streams `OK` frames and
//! terminates with `DONE`.

use std::fmt;

use crate::error::Error;

/// One response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Bare acknowledgement.
    Ok,
    /// Acknowledgement with a payload: `OK <payload>`.
    OkValue(String),
    /// Stream terminator for REGX.
    Done,
    /// Error frame: `ERR <message>`.
    Err(String),
}

impl Response {
    pub fn ok_value(payload: impl Into<String>) -> Self {
        Response::OkValue(payload.into())
    }

    pub fn authenticated() -> Self {
        Response::ok_value("authenticated")
    }

    pub fn pong() -> Self {
        Response::ok_value("PONG")
    }

    /// Interpret a received line as a response frame.
    pub fn from_line(line: &str) -> Self {
        if line == "OK" {
            Response::Ok
        } else if let Some(payload) = line.strip_prefix("OK ") {
            Response::OkValue(payload.to_string())
        } else if line == "DONE" {
            Response::Done
        } else if let Some(message) = line.strip_prefix("ERR ") {
            Response::Err(message.to_string())
        } else {
            Response::Err(format!("unexpected response: {}", line))
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok | Response::OkValue(_))
    }
}

impl From<&Error> for Response {
    fn from(error: &Error) -> Self {
        Response::Err(error.to_string())
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok => f.write_str("OK"),
            Response::OkValue(payload) => write!(f, "OK {}", payload),
            Response::Done => f.write_str("DONE"),
            Response::Err(message) => write!(f, "ERR {}", message),
        }
    }
}
