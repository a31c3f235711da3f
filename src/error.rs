//! Error taxonomy shared by the coordinator, storage nodes and clients.
//!
//! Coordinator-side rejections travel over the wire as `ERR|<code>|<detail>`
//! and are mapped back onto the same variants by the client, so callers on
//! either side of the protocol can match on typed errors.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors produced anywhere in the striped storage system.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing fields in a request.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// A disk or user with this name is already registered.
    #[error("name already registered: {0}")]
    DuplicateName(String),

    /// The fixed-capacity registration table is full.
    #[error("no room left for another {0}")]
    NameSpaceExhausted(String),

    #[error("no such storage group: {0}")]
    NoSuchGroup(String),

    #[error("no such disk: {0}")]
    NoSuchDisk(String),

    #[error("no such user: {0}")]
    NoSuchUser(String),

    #[error("no such file: {0}")]
    NoSuchFile(String),

    /// The file name is already catalogued in the group.
    #[error("file already exists: {0}")]
    DuplicateFile(String),

    /// The disk is allocated to a storage group and cannot be removed.
    #[error("disk is allocated: {0}")]
    DiskBusy(String),

    /// The group has a copy, reads or a recovery in progress.
    #[error("storage group is busy: {0}")]
    GroupBusy(String),

    /// A second copy was requested while one is already running.
    #[error("a copy is already in flight on {0}")]
    CopyAlreadyInFlight(String),

    /// A read was requested while a copy is running on the same group.
    #[error("a copy is in flight on {0}")]
    CopyInFlight(String),

    #[error("insufficient free disks: need {need}, have {have}")]
    InsufficientDisks { need: usize, have: usize },

    #[error("invalid storage group parameters: {0}")]
    InvalidGroupParams(String),

    /// The requesting user does not own the file.
    #[error("{user} does not own {file}")]
    NotOwner { file: String, user: String },

    /// No reply after every retry; transport-level and client-local.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(SocketAddr),

    /// A reply or frame that could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A coordinator error code this build does not know, kept verbatim.
    #[error("coordinator error {code}: {detail}")]
    Remote { code: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable wire code used in `ERR|<code>|<detail>` replies.
    pub fn code(&self) -> &str {
        match self {
            Error::InvalidArguments(_) => "invalid-arguments",
            Error::DuplicateName(_) => "duplicate-name",
            Error::NameSpaceExhausted(_) => "namespace-exhausted",
            Error::NoSuchGroup(_) => "no-such-group",
            Error::NoSuchDisk(_) => "no-such-disk",
            Error::NoSuchUser(_) => "no-such-user",
            Error::NoSuchFile(_) => "no-such-file",
            Error::DuplicateFile(_) => "duplicate-file",
            Error::DiskBusy(_) => "disk-busy",
            Error::GroupBusy(_) => "group-busy",
            Error::CopyAlreadyInFlight(_) => "copy-already-in-flight",
            Error::CopyInFlight(_) => "copy-in-flight",
            Error::InsufficientDisks { .. } => "insufficient-disks",
            Error::InvalidGroupParams(_) => "invalid-group-params",
            Error::NotOwner { .. } => "not-owner",
            Error::PeerUnreachable(_) => "peer-unreachable",
            Error::Protocol(_) => "protocol",
            Error::Remote { code, .. } => code,
            Error::Io(_) => "io",
        }
    }

    /// Detail field of the wire form; the inverse of [`Error::from_wire`].
    pub fn detail(&self) -> String {
        match self {
            Error::InvalidArguments(d)
            | Error::DuplicateName(d)
            | Error::NameSpaceExhausted(d)
            | Error::NoSuchGroup(d)
            | Error::NoSuchDisk(d)
            | Error::NoSuchUser(d)
            | Error::NoSuchFile(d)
            | Error::DuplicateFile(d)
            | Error::DiskBusy(d)
            | Error::GroupBusy(d)
            | Error::CopyAlreadyInFlight(d)
            | Error::CopyInFlight(d)
            | Error::InvalidGroupParams(d)
            | Error::Protocol(d) => d.clone(),
            Error::InsufficientDisks { need, have } => format!("need={}|have={}", need, have),
            Error::NotOwner { file, user } => format!("file={}|user={}", file, user),
            Error::PeerUnreachable(addr) => addr.to_string(),
            Error::Remote { detail, .. } => detail.clone(),
            Error::Io(e) => e.to_string(),
        }
    }

    /// Rebuild a typed error from the code and detail of an `ERR` reply.
    pub fn from_wire(code: &str, detail: &str) -> Self {
        let d = detail.to_string();
        match code {
            "invalid-arguments" => Error::InvalidArguments(d),
            "duplicate-name" => Error::DuplicateName(d),
            "namespace-exhausted" => Error::NameSpaceExhausted(d),
            "no-such-group" => Error::NoSuchGroup(d),
            "no-such-disk" => Error::NoSuchDisk(d),
            "no-such-user" => Error::NoSuchUser(d),
            "no-such-file" => Error::NoSuchFile(d),
            "duplicate-file" => Error::DuplicateFile(d),
            "disk-busy" => Error::DiskBusy(d),
            "group-busy" => Error::GroupBusy(d),
            "copy-already-in-flight" => Error::CopyAlreadyInFlight(d),
            "copy-in-flight" => Error::CopyInFlight(d),
            "invalid-group-params" => Error::InvalidGroupParams(d),
            "insufficient-disks" => {
                let need = kv_field(detail, "need").and_then(|v| v.parse().ok());
                let have = kv_field(detail, "have").and_then(|v| v.parse().ok());
                match (need, have) {
                    (Some(need), Some(have)) => Error::InsufficientDisks { need, have },
                    _ => Error::Remote {
                        code: code.to_string(),
                        detail: d,
                    },
                }
            }
            "not-owner" => Error::NotOwner {
                file: kv_field(detail, "file").unwrap_or_default().to_string(),
                user: kv_field(detail, "user").unwrap_or_default().to_string(),
            },
            _ => Error::Remote {
                code: code.to_string(),
                detail: d,
            },
        }
    }
}

/// Look up `key=value` among `|`-separated fields.
pub(crate) fn kv_field<'a>(fields: &'a str, key: &str) -> Option<&'a str> {
    fields.split('|').find_map(|field| {
        let (k, v) = field.split_once('=')?;
        (k == key).then_some(v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes_map_back_to_variants() {
        let err = Error::from_wire("no-such-group", "G");
        assert!(matches!(err, Error::NoSuchGroup(ref g) if g == "G"));

        let err = Error::from_wire("copy-already-in-flight", "G");
        assert!(matches!(err, Error::CopyAlreadyInFlight(_)));
    }

    #[test]
    fn test_structured_details_survive_the_wire() {
        let original = Error::InsufficientDisks { need: 4, have: 2 };
        let back = Error::from_wire(original.code(), &original.detail());
        assert!(matches!(back, Error::InsufficientDisks { need: 4, have: 2 }));

        let original = Error::NotOwner {
            file: "f".into(),
            user: "U2".into(),
        };
        let back = Error::from_wire(original.code(), &original.detail());
        match back {
            Error::NotOwner { file, user } => {
                assert_eq!(file, "f");
                assert_eq!(user, "U2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_code_is_kept_verbatim() {
        let err = Error::from_wire("weird", "something broke");
        assert_eq!(err.code(), "weird");
        assert_eq!(err.detail(), "something broke");
    }
}
