//! Console command parsing

use anyhow::Result;

use crate::error::TorrentError;

/// A line typed at the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start or pause a torrent, optionally limited to some files (1-based)
    Toggle { number: usize, files: Option<Vec<usize>> },
    Status,
    Help,
    Exit,
}

/// Parse `<n>`, `<n> <f1,f2,...>`, `status`, `help` or `exit`.
///
/// An empty line shows the status.
pub fn parse_command(line: &str) -> Result<Command> {
    let mut words = line.split_whitespace();
    let Some(first) = words.next() else {
        return Ok(Command::Status);
    };

    let command = match first.to_ascii_lowercase().as_str() {
        "exit" | "quit" => Command::Exit,
        "help" | "?" => Command::Help,
        "status" => Command::Status,
        _ => {
            let number = parse_number(first)?;
            let files = match words.next() {
                Some(list) => Some(
                    list.split(',')
                        .filter(|part| !part.is_empty())
                        .map(parse_number)
                        .collect::<Result<Vec<_>>>()?,
                ),
                None => None,
            };
            Command::Toggle { number, files }
        }
    };

    if let Some(extra) = words.next() {
        return Err(TorrentError::user_input_error(format!("Unexpected argument '{}'", extra)).into());
    }
    Ok(command)
}

fn parse_number(word: &str) -> Result<usize> {
    word.trim()
        .parse::<usize>()
        .map_err(|_| TorrentError::user_input_error(format!("'{}' is not a number, type 'help' for usage", word)).into())
}
