//! Data-path frames
//!
//! A frame is one text header line followed by raw bytes:
//!
//! ```text
//! store|group|file|stripe|member|parity|total|offset|length\n<payload>
//! stored|group|file|stripe|member|parity|offset|length
//! fetch|group|file|stripe|member|parity|offset
//! block|group|file|stripe|member|parity|total|offset|length\n<payload>
//! ```
//!
//! Blocks larger than one datagram travel as several segments; `total` is the
//! whole block length and `offset` places the segment inside it.

use super::{parse_name, parse_num};
use crate::storage::BlockKey;
use crate::{Error, Result, MAX_STRIPE_SIZE};

/// One data-path datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFrame {
    /// Write a segment of a block
    Store {
        key: BlockKey,
        total: usize,
        offset: usize,
        payload: Vec<u8>,
    },
    /// Acknowledge a stored segment
    Stored {
        key: BlockKey,
        offset: usize,
        length: usize,
    },
    /// Ask for the segment of a block starting at `offset`
    Fetch { key: BlockKey, offset: usize },
    /// Answer to a fetch; `total == 0` for an absent block
    Block {
        key: BlockKey,
        total: usize,
        offset: usize,
        payload: Vec<u8>,
    },
}

impl DataFrame {
    pub fn key(&self) -> &BlockKey {
        match self {
            DataFrame::Store { key, .. }
            | DataFrame::Stored { key, .. }
            | DataFrame::Fetch { key, .. }
            | DataFrame::Block { key, .. } => key,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            DataFrame::Store {
                key,
                total,
                offset,
                payload,
            } => with_payload(
                format!("store|{}|{}|{}|{}", key, total, offset, payload.len()),
                payload,
            ),
            DataFrame::Stored {
                key,
                offset,
                length,
            } => format!("stored|{}|{}|{}\n", key, offset, length).into_bytes(),
            DataFrame::Fetch { key, offset } => format!("fetch|{}|{}\n", key, offset).into_bytes(),
            DataFrame::Block {
                key,
                total,
                offset,
                payload,
            } => with_payload(
                format!("block|{}|{}|{}|{}", key, total, offset, payload.len()),
                payload,
            ),
        }
    }

    /// Decode a datagram; anything truncated or unrecognized is an error
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        let split = datagram.iter().position(|&b| b == b'\n');
        let (header, payload) = match split {
            Some(at) => (&datagram[..at], &datagram[at + 1..]),
            None => (datagram, &datagram[datagram.len()..]),
        };
        let header = std::str::from_utf8(header)
            .map_err(|_| Error::Protocol("frame header is not UTF-8".into()))?;
        let f: Vec<&str> = header.trim_end_matches('\r').split('|').collect();

        match f[0] {
            "store" | "block" => {
                expect_len(&f, 9, header)?;
                let key = parse_key(&f[1..6])?;
                let total: usize = parse_num(f[6], "total")?;
                let offset: usize = parse_num(f[7], "offset")?;
                let length: usize = parse_num(f[8], "length")?;
                if length != payload.len() {
                    return Err(Error::Protocol(format!(
                        "frame declares {} bytes, carries {}",
                        length,
                        payload.len()
                    )));
                }
                if total > MAX_STRIPE_SIZE || !segment_fits(offset, length, total) {
                    return Err(Error::Protocol(format!(
                        "segment {}+{} does not fit block of {}",
                        offset, length, total
                    )));
                }
                let payload = payload.to_vec();
                if f[0] == "store" {
                    Ok(DataFrame::Store {
                        key,
                        total,
                        offset,
                        payload,
                    })
                } else {
                    Ok(DataFrame::Block {
                        key,
                        total,
                        offset,
                        payload,
                    })
                }
            }
            "stored" => {
                expect_len(&f, 8, header)?;
                Ok(DataFrame::Stored {
                    key: parse_key(&f[1..6])?,
                    offset: parse_num(f[6], "offset")?,
                    length: parse_num(f[7], "length")?,
                })
            }
            "fetch" => {
                expect_len(&f, 7, header)?;
                Ok(DataFrame::Fetch {
                    key: parse_key(&f[1..6])?,
                    offset: parse_num(f[6], "offset")?,
                })
            }
            other => Err(Error::Protocol(format!("unknown frame {:?}", other))),
        }
    }
}

/// Whether `offset..offset + length` lies inside a block of `total` bytes
pub(crate) fn segment_fits(offset: usize, length: usize, total: usize) -> bool {
    offset.checked_add(length).map_or(false, |end| end <= total)
}

fn with_payload(header: String, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.len() + 1 + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(payload);
    out
}

fn expect_len(f: &[&str], n: usize, header: &str) -> Result<()> {
    if f.len() != n {
        return Err(Error::Protocol(format!("truncated frame {:?}", header)));
    }
    Ok(())
}

fn parse_key(f: &[&str]) -> Result<BlockKey> {
    let parity = match f[4] {
        "0" => false,
        "1" => true,
        other => return Err(Error::Protocol(format!("bad parity flag {:?}", other))),
    };
    Ok(BlockKey {
        group: parse_name(f[0], "group")?,
        file: parse_name(f[1], "file")?,
        stripe: parse_num(f[2], "stripe")?,
        member: parse_num(f[3], "member")?,
        parity,
    })
}
