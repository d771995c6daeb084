//! Command Parsing
//!
//! Parses one request line into a typed command. Verbs are upper-case;
//! a PUT value is the remainder of the line and may contain spaces.

use crate::error::Error;

/// Parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Gateway credential token: `AUTH <base64>`.
    Auth { token: String },
    /// Shared-key digest: `NAUTH <hex-sha256>`.
    Nauth { token: String },
    Put { key: String, value: String },
    Get { key: String },
    Del { key: String },
    Incr { key: String, delta: String },
    Decr { key: String, delta: String },
    Regx {
        pattern: String,
        limit: Option<usize>,
        offset: Option<usize>,
    },
    Stats,
    Ping,
    Quit,
}

impl Command {
    /// Parse a request line.
    pub fn parse(line: &str) -> Result<Self, Error> {
        let line = line.trim_end();
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim_start()),
            None => (line, ""),
        };

        match verb {
            "AUTH" => Ok(Command::Auth {
                token: one_arg(rest)?,
            }),
            "NAUTH" => Ok(Command::Nauth {
                token: one_arg(rest)?,
            }),
            "PUT" => {
                let (key, value) = rest.split_once(' ').ok_or(Error::UnknownCommand)?;
                if key.is_empty() || value.is_empty() {
                    return Err(Error::UnknownCommand);
                }
                Ok(Command::Put {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
            "GET" => Ok(Command::Get { key: one_arg(rest)? }),
            "DEL" => Ok(Command::Del { key: one_arg(rest)? }),
            "INCR" => {
                let (key, delta) = two_args(rest)?;
                Ok(Command::Incr { key, delta })
            }
            "DECR" => {
                let (key, delta) = two_args(rest)?;
                Ok(Command::Decr { key, delta })
            }
            "REGX" => parse_regx(rest),
            "STATS" => Ok(Command::Stats),
            "PING" => Ok(Command::Ping),
            "QUIT" => Ok(Command::Quit),
            _ => Err(Error::UnknownCommand),
        }
    }

    /// Whether this command mutates the table (and is therefore journaled
    /// and replicated).
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Command::Put { .. } | Command::Del { .. } | Command::Incr { .. } | Command::Decr { .. }
        )
    }
}

fn one_arg(rest: &str) -> Result<String, Error> {
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(arg), None) => Ok(arg.to_string()),
        _ => Err(Error::UnknownCommand),
    }
}

fn two_args(rest: &str) -> Result<(String, String), Error> {
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) => Ok((a.to_string(), b.to_string())),
        _ => Err(Error::UnknownCommand),
    }
}

fn parse_regx(rest: &str) -> Result<Command, Error> {
    let mut parts = rest.split_whitespace();
    let pattern = parts.next().ok_or(Error::UnknownCommand)?.to_string();
    let mut limit = None;
    let mut offset = None;
    while let Some(keyword) = parts.next() {
        let operand = parts
            .next()
            .and_then(|raw| raw.parse::<usize>().ok())
            .ok_or(Error::UnknownCommand)?;
        match keyword {
            "LIMIT" => limit = Some(operand),
            "OFFSET" => offset = Some(operand),
            _ => return Err(Error::UnknownCommand),
        }
    }
    Ok(Command::Regx {
        pattern,
        limit,
        offset,
    })
}
