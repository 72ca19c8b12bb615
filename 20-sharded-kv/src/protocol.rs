//! Line-oriented wire protocol shared by the router and the nodes.
//!
//! A client opens a fresh connection, writes one request line `"<key> <value>\n"`,
//! reads one response line, and both sides close. There is no pipelining.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Key, error::ProtocolError};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

const STORED_PREFIX: &str = "Stored: ";
const ERROR_PREFIX: &str = "Error: ";
const MALFORMED: &str = "malformed request";
const STORAGE_FAILURE: &str = "storage failure";

/// A single write request: `"<key> <value>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub key: Key,
    pub value: String,
}

impl Request {
    /// Builds a request, rejecting values that would break line framing.
    pub fn new(key: Key, value: impl Into<String>) -> Result<Self, ProtocolError> {
        let value = value.into();
        validate_value(&value)?;
        Ok(Self { key, value })
    }

    /// Parses a request line. Everything after the first space is the value, so
    /// values may contain spaces and may be empty.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(LINE_ENDINGS);
        let Some((key, value)) = line.split_once(' ') else {
            return Err(ProtocolError::MissingSeparator);
        };
        let key = parse_key(key)?;
        Self::new(key, value)
    }

    pub fn encode(&self) -> String {
        format!("{} {}", self.key, self.value)
    }
}

/// Every line a node can answer with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Stored { key: Key, value: String },
    DuplicateKey { key: Key },
    Malformed,
    StorageFailure,
    /// An `Error:` line this build does not know about.
    Other(String),
}

impl Response {
    pub fn encode(&self) -> String {
        match self {
            Response::Stored { key, value } => format!("{STORED_PREFIX}{key} -> {value}"),
            Response::DuplicateKey { key } => format!("{ERROR_PREFIX}Key {key} already exists!"),
            Response::Malformed => format!("{ERROR_PREFIX}{MALFORMED}"),
            Response::StorageFailure => format!("{ERROR_PREFIX}{STORAGE_FAILURE}"),
            Response::Other(message) => format!("{ERROR_PREFIX}{message}"),
        }
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(LINE_ENDINGS);

        if let Some(rest) = line.strip_prefix(STORED_PREFIX) {
            let Some((key, value)) = rest.split_once(" -> ") else {
                return Err(ProtocolError::UnknownResponse(line.to_string()));
            };
            return Ok(Response::Stored {
                key: parse_key(key)?,
                value: value.to_string(),
            });
        }

        let Some(message) = line.strip_prefix(ERROR_PREFIX) else {
            return Err(ProtocolError::UnknownResponse(line.to_string()));
        };

        if let Some(key) = message
            .strip_prefix("Key ")
            .and_then(|rest| rest.strip_suffix(" already exists!"))
        {
            return Ok(Response::DuplicateKey {
                key: parse_key(key)?,
            });
        }

        Ok(match message {
            MALFORMED => Response::Malformed,
            STORAGE_FAILURE => Response::StorageFailure,
            other => Response::Other(other.to_string()),
        })
    }
}

pub fn parse_key(raw: &str) -> Result<Key, ProtocolError> {
    raw.trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidKey(raw.to_string()))
}

pub fn validate_value(value: &str) -> Result<(), ProtocolError> {
    if value.contains(LINE_ENDINGS) {
        return Err(ProtocolError::InvalidValue);
    }
    Ok(())
}

/// Reads one line, returning `None` on a clean EOF. The line ending is stripped.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Writes `line` followed by `\n` and flushes.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
