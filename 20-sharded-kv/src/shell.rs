//! Interactive front end for the router.
//!
//! Each input line is either `exit` or `"<key> <value>"`. Lines that fail to parse are
//! answered with a usage message and never reach the network.

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::error;

use crate::{
    Key,
    protocol::{parse_key, read_line, write_line},
    router::{RouteOutcome, RouteRejection, Router},
};

pub const BANNER: &str = "Enter key-value pairs (integer key, string value). Type 'exit' to stop.";
pub const USAGE: &str = "Invalid input. Use: <key> <value>";
pub const INVALID_KEY: &str = "Invalid key format. Key should be an integer.";
pub const FAREWELL: &str = "Exiting...";
/// Printed without a line break before each read when a person is typing.
pub const PROMPT: &str = "Enter key and value: ";

/// One parsed line of shell input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellInput {
    Put { key: Key, value: String },
    Exit,
    Blank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellInputError {
    MissingSeparator,
    InvalidKey,
}

impl ShellInputError {
    pub fn message(self) -> &'static str {
        match self {
            ShellInputError::MissingSeparator => USAGE,
            ShellInputError::InvalidKey => INVALID_KEY,
        }
    }
}

impl ShellInput {
    pub fn parse(line: &str) -> Result<Self, ShellInputError> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            return Ok(ShellInput::Blank);
        }
        if line.trim() == "exit" {
            return Ok(ShellInput::Exit);
        }

        let Some((key, value)) = line.split_once(' ') else {
            return Err(ShellInputError::MissingSeparator);
        };
        let key = parse_key(key).map_err(|_| ShellInputError::InvalidKey)?;

        Ok(ShellInput::Put {
            key,
            value: value.to_string(),
        })
    }
}

/// Runs the read-eval-print loop until `exit` or end of input.
///
/// With `prompt` set, [`PROMPT`] is written before every read. Leave it off when the
/// output is consumed line by line.
pub async fn run<R, W>(
    router: &mut Router,
    input: &mut R,
    output: &mut W,
    prompt: bool,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_line(output, BANNER).await?;

    loop {
        if prompt {
            output.write_all(PROMPT.as_bytes()).await?;
            output.flush().await?;
        }
        let Some(line) = read_line(input).await? else {
            break;
        };
        match ShellInput::parse(&line) {
            Ok(ShellInput::Exit) => break,
            Ok(ShellInput::Blank) => {}
            Ok(ShellInput::Put { key, value }) => {
                let reply = execute_put(router, key, &value).await;
                write_line(output, &reply).await?;
            }
            Err(err) => write_line(output, err.message()).await?,
        }
    }

    write_line(output, FAREWELL).await?;
    Ok(())
}

async fn execute_put(router: &mut Router, key: Key, value: &str) -> String {
    match router.put(key, value).await {
        Ok(RouteOutcome::Stored(node)) => format!(
            "Stored: {key} -> Node {node} (Port {})",
            router.port(node)
        ),
        Ok(RouteOutcome::Rejected(RouteRejection::AlreadyAssigned { node })) => {
            format!("Error: Key {key} already exists and was assigned to Node {node}")
        }
        Ok(RouteOutcome::Rejected(RouteRejection::InvalidValue)) => {
            "Error: value must not contain line breaks".to_string()
        }
        Ok(RouteOutcome::Rejected(RouteRejection::NodeError(err))) => {
            format!("Error: Key {key} was not stored: {err}")
        }
        Err(err) => {
            error!(key, error = %err, "assignment could not be persisted");
            format!("Error: Key {key} was stored but its mapping was not saved: {err}")
        }
    }
}
