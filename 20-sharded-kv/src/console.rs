//! REPL command parsing for the `node` binary.
//!
//! Turns a line like `PUT user:1 alice` into a [`ConsoleCommand`]. Commands
//! are case-insensitive and each has a one-letter alias.

use anyhow::{anyhow, Result};

/// Commands that can be entered at the REPL prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Put { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    Status,
    /// Run an election round for every local shard without a leader.
    Elect,
    /// Clear the storage-unhealthy flag after fixing the disk.
    Heal,
    Help,
    Exit,
}

pub const HELP: &str = "\
PUT/p <key> <value>   store a value (the value may contain spaces)
GET/g <key>           read a value from the nearest replica
DELETE/d <key>        delete a key
STATUS/s              show ring, peers and local shard replicas
ELECT/l               run an election round for leaderless shards
HEAL                  accept writes again after a storage failure
HELP/h                this text
EXIT/e                shut down this node";

impl ConsoleCommand {
    /// Parses a line of user input. With `allow_writes` unset, PUT and
    /// DELETE are refused.
    pub fn parse(line: &str, allow_writes: bool) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("empty command"));
        }

        let (cmd, args) = trimmed.split_once(char::is_whitespace).unwrap_or((trimmed, ""));
        let cmd = cmd.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "P" => "PUT",
            "G" => "GET",
            "D" | "DEL" => "DELETE",
            "S" => "STATUS",
            "L" => "ELECT",
            "H" => "HELP",
            "E" | "QUIT" => "EXIT",
            other => other,
        };

        match normalized_cmd {
            "EXIT" => return Ok(ConsoleCommand::Exit),
            "HELP" => return Ok(ConsoleCommand::Help),
            "STATUS" => return Ok(ConsoleCommand::Status),
            "ELECT" => return Ok(ConsoleCommand::Elect),
            "HEAL" => return Ok(ConsoleCommand::Heal),
            _ => {}
        }

        let args = args.trim_start();
        let (key, rest) = args.split_once(char::is_whitespace).unwrap_or((args, ""));
        let key = Some(key).filter(|k| !k.is_empty());
        let rest = Some(rest.trim()).filter(|v| !v.is_empty());
        match (normalized_cmd, key, rest) {
            ("PUT" | "DELETE", _, _) if !allow_writes => {
                Err(anyhow!("{normalized_cmd} not allowed in this context"))
            }
            ("GET", Some(key), None) => Ok(ConsoleCommand::Get { key: key.to_string() }),
            ("DELETE", Some(key), None) => Ok(ConsoleCommand::Delete { key: key.to_string() }),
            ("PUT", Some(key), Some(value)) => Ok(ConsoleCommand::Put {
                key: key.to_string(),
                value: value.to_string(),
            }),
            ("GET", _, _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("DELETE", _, _) => Err(anyhow!("DELETE requires exactly one argument: DELETE <key>")),
            ("PUT", _, _) => Err(anyhow!("PUT requires a key and a value: PUT <key> <value>")),
            _ => Err(anyhow!(
                "invalid command. Try: PUT/p <key> <value>, GET/g <key>, DELETE/d <key>, STATUS/s, HELP/h, EXIT/e"
            )),
        }
    }
}
