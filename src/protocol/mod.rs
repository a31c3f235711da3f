//! Wire protocol
//!
//! Every logical message is one datagram. Control and admission traffic is
//! `|`-separated UTF-8 text; the data path carries a short text header line
//! followed by raw block bytes.
//!
//! - [`control`]: coordinator commands, their replies, and storage-node
//!   control commands.
//! - [`data`]: block store/fetch frames exchanged with storage nodes.

pub mod control;
pub mod data;

pub use control::{Command, FileEntry, GroupView, Member, NodeCommand, Registration, Reply};
pub use data::DataFrame;

use crate::{Error, Result};
use std::str::FromStr;

/// Longest accepted name for disks, users, groups and files
pub const MAX_NAME_LEN: usize = 64;

/// Largest datagram accepted on any socket
pub const MAX_DATAGRAM: usize = 65_507;

/// Bytes of catalog lines carried by one `get-dss` reply
pub const CATALOG_PAGE_BYTES: usize = 16 * 1024;

/// Validate a name field: non-empty, bounded, and free of separators
pub(crate) fn parse_name(field: &str, what: &str) -> Result<String> {
    if field.is_empty() {
        return Err(Error::InvalidArguments(format!("missing {}", what)));
    }
    if field.len() > MAX_NAME_LEN {
        return Err(Error::InvalidArguments(format!(
            "{} longer than {} bytes",
            what, MAX_NAME_LEN
        )));
    }
    if field
        .chars()
        .any(|c| c == '|' || c == '=' || c == ',' || c == ';' || c.is_whitespace() || c.is_control())
    {
        return Err(Error::InvalidArguments(format!("bad character in {}", what)));
    }
    Ok(field.to_string())
}

/// Parse a numeric field, naming it in the error
pub(crate) fn parse_num<T: FromStr>(field: &str, what: &str) -> Result<T> {
    field
        .trim()
        .parse()
        .map_err(|_| Error::InvalidArguments(format!("bad {}: {:?}", what, field)))
}

/// Split a `|`-separated line and check its field count
pub(crate) fn fields<'a>(line: &'a str, expected: usize, usage: &str) -> Result<Vec<&'a str>> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() != expected {
        return Err(Error::InvalidArguments(format!("usage: {}", usage)));
    }
    Ok(parts)
}
