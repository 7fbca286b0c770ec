/// Roster file parsing.
///
/// The roster lists the backends the balancer should dial at start-up, one
/// per line: `NAME ADDRESS PORT`, whitespace separated. This mirrors
/// `load_servers_metadata` in the original C source, including its field
/// width limits (`sscanf("%19s %15s %d", ...)`).
use crate::MAX_SERVERS;
use std::fmt;
use std::io::{self, BufRead};
use std::path::Path;

/// Default roster path, used when the process config doesn't override it.
pub const DEFAULT_ROSTER_PATH: &str = "./servers_metadata.txt";

const MAX_NAME_LEN: usize = 19;
const MAX_ADDRESS_LEN: usize = 15;

#[derive(Debug, PartialEq)]
pub enum RosterError {
    Io(String),
    LineTooLong { line_number: usize },
    BadPort { line_number: usize, token: String },
    MissingFields { line_number: usize },
}

impl fmt::Display for RosterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RosterError::Io(msg) => write!(f, "error opening roster file: {}", msg),
            RosterError::LineTooLong { line_number } => {
                write!(f, "line {}: name or address exceeds its field width", line_number)
            }
            RosterError::BadPort { line_number, token } => {
                write!(f, "line {}: invalid port {:?}", line_number, token)
            }
            RosterError::MissingFields { line_number } => {
                write!(f, "line {}: expected NAME ADDRESS PORT", line_number)
            }
        }
    }
}

impl std::error::Error for RosterError {}

/// One dialable backend, as listed in the roster file.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub name: String,
    pub address: String,
    pub port: u16,
}

/// Load and parse a roster file, keeping at most [`MAX_SERVERS`] entries.
///
/// Lines beyond `MAX_SERVERS` are ignored entirely (not even parsed), to
/// match the original `while (count < MAX_SERVERS && fgets(...))` loop.
pub fn load(path: impl AsRef<Path>) -> Result<Vec<RosterEntry>, RosterError> {
    let file = std::fs::File::open(path.as_ref()).map_err(|e| RosterError::Io(e.to_string()))?;
    parse(io::BufReader::new(file))
}

fn parse(reader: impl BufRead) -> Result<Vec<RosterEntry>, RosterError> {
    let mut entries = Vec::with_capacity(MAX_SERVERS);
    for (line_number, line) in reader.lines().enumerate() {
        if entries.len() >= MAX_SERVERS {
            break;
        }
        let line = line.map_err(|e| RosterError::Io(e.to_string()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        entries.push(parse_line(trimmed, line_number + 1)?);
    }
    Ok(entries)
}

fn parse_line(line: &str, line_number: usize) -> Result<RosterEntry, RosterError> {
    let mut tokens = line.split_whitespace();
    let name = tokens
        .next()
        .ok_or(RosterError::MissingFields { line_number })?;
    let address = tokens
        .next()
        .ok_or(RosterError::MissingFields { line_number })?;
    let port_token = tokens
        .next()
        .ok_or(RosterError::MissingFields { line_number })?;

    if name.len() > MAX_NAME_LEN || address.len() > MAX_ADDRESS_LEN {
        return Err(RosterError::LineTooLong { line_number });
    }

    let port: u16 = port_token
        .parse()
        .map_err(|_| RosterError::BadPort {
            line_number,
            token: port_token.to_string(),
        })?;

    if port == 0 {
        return Err(RosterError::BadPort {
            line_number,
            token: port_token.to_string(),
        });
    }

    Ok(RosterEntry {
        name: name.to_string(),
        address: address.to_string(),
        port,
    })
}
