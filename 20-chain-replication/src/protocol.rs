//! Console command parsing for the interactive node binary.
//!
//! Writes are only accepted where updates enter the chain (the head) and reads
//! only where queries are served (the tail), so the parser takes one flag for
//! each and refuses the command up front instead of letting the node report a
//! protocol violation later.

use anyhow::{Result, anyhow};

const USAGE: &str = "invalid command. Try: PUT/p <key> <value>, GET/g <key>, STATUS/s, RESUME/r, HELP/h, EXIT/e";

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Put { key: String, value: String },
    Get { key: String },
    Status,
    /// Restart queues that stalled on a failed flush or a closed link.
    Resume,
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parses one line of input.
    ///
    /// Commands are case-insensitive and accept single-letter aliases. The
    /// value of `PUT` is the rest of the line, so it may contain spaces.
    pub fn parse(line: &str, allow_put: bool, allow_get: bool) -> Result<Self> {
        let trimmed = line.trim();
        let mut words = trimmed.splitn(2, char::is_whitespace);
        let Some(first) = words.next().filter(|word| !word.is_empty()) else {
            return Err(anyhow!("empty command"));
        };
        let rest = words.next().map(str::trim).unwrap_or_default();

        let command = match first.to_uppercase().as_str() {
            "P" | "PUT" => "PUT",
            "G" | "GET" => "GET",
            "S" | "STATUS" => "STATUS",
            "R" | "RESUME" => "RESUME",
            "H" | "HELP" => "HELP",
            "E" | "EXIT" => "EXIT",
            _ => return Err(anyhow!(USAGE)),
        };

        match command {
            "STATUS" => Ok(ConsoleCommand::Status),
            "RESUME" => Ok(ConsoleCommand::Resume),
            "HELP" => Ok(ConsoleCommand::Help),
            "EXIT" => Ok(ConsoleCommand::Exit),
            "GET" if !allow_get => Err(anyhow!("GET is only served by the tail node")),
            "GET" => match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
                [key] => Ok(ConsoleCommand::Get { key: key.to_string() }),
                _ => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            },
            "PUT" if !allow_put => Err(anyhow!("PUT is only accepted by the head node")),
            _ => match rest.split_once(char::is_whitespace) {
                Some((key, value)) if !value.trim().is_empty() => Ok(ConsoleCommand::Put {
                    key: key.to_string(),
                    value: value.trim().to_string(),
                }),
                _ => Err(anyhow!("PUT requires two arguments: PUT <key> <value>")),
            },
        }
    }
}

pub const HELP: &str = "\
Commands:
  PUT/p <key> <value>   replicate a write (head only)
  GET/g <key>           read the committed value (tail only)
  STATUS/s              show position, pending updates and storage counters
  RESUME/r              restart stalled queues
  HELP/h                print this help
  EXIT/e                shut the node down";
