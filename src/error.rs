//! Crate Errors
//!
//! One error enum shared across storage, transport and instances, with the
//! wire rendering used by every role.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("key not found")]
    KeyNotFound,

    #[error("invalid value")]
    InvalidValue,

    #[error("negative value")]
    NegativeValue,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("unknown command")]
    UnknownCommand,

    #[error("no primary nodes available")]
    NoPrimaries,

    #[error("memory pressure")]
    MemoryPressure,

    #[error("not connected")]
    NotConnected,

    #[error("read timeout")]
    Timeout,

    #[error("frame exceeds buffer size")]
    OversizedFrame,

    #[error("storage engine stopped")]
    EngineStopped,

    #[error("shared key is required")]
    MissingSharedKey,

    #[error("username and password are required")]
    MissingCredentials,

    #[error("invalid regex pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Render as a wire response line (without the CRLF terminator).
    pub fn to_wire(&self) -> String {
        format!("ERR {}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_rendering() {
        assert_eq!(Error::KeyNotFound.to_wire(), "ERR key not found");
        assert_eq!(
            Error::NoPrimaries.to_wire(),
            "ERR no primary nodes available"
        );
        assert_eq!(Error::NotAuthenticated.to_wire(), "ERR not authenticated");
    }
}
