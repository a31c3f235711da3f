//! Striped Storage
//!
//! A small distributed striped-storage service. A coordinator tracks storage
//! nodes and users, allocates nodes into named storage groups, and admits
//! copy, read and recovery operations; clients stripe files across a group's
//! members with one rotating XOR parity block per stripe and talk to the
//! storage nodes directly.

pub mod client;
pub mod coordinator;
pub mod demo;
pub mod erasure;
pub mod error;
pub mod protocol;
pub mod storage;
pub mod transport;
pub mod ui;

pub use client::Client;
pub use coordinator::{CoordinatorHandle, Registry};
pub use erasure::{ErasureScheme, StripeLayout, XorParity};
pub use error::Error;
pub use storage::{DiskNode, MemoryBlockStore};
pub use transport::Transport;
pub use ui::Dashboard;

use std::time::Duration;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Smallest storage group
pub const MIN_MEMBERS: usize = 3;
/// Largest storage group; its member list must fit one reply datagram
pub const MAX_MEMBERS: usize = 256;
/// Smallest stripe-block size in bytes
pub const MIN_STRIPE_SIZE: usize = 128;
/// Largest stripe-block size in bytes
pub const MAX_STRIPE_SIZE: usize = 1_048_576;

/// Runtime configuration shared by every process role
#[derive(Debug, Clone)]
pub struct Config {
    /// How long to wait for each reply
    pub request_timeout: Duration,
    /// Send attempts per request before a peer counts as unreachable
    pub attempts: usize,
    /// Largest block payload carried by one data datagram
    pub segment_size: usize,
    /// Capacity of the disk table
    pub max_disks: usize,
    /// Capacity of the user table
    pub max_users: usize,
    /// Coordinator activity entries kept for the dashboard
    pub history_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(1),
            attempts: 3,
            segment_size: 32 * 1024,
            max_disks: 64,
            max_users: 64,
            history_len: 100,
        }
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(Error::InvalidArguments("attempts must be at least 1".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidArguments("request timeout must be non-zero".into()));
        }
        if self.segment_size == 0 || self.segment_size + 512 > protocol::MAX_DATAGRAM {
            return Err(Error::InvalidArguments(format!(
                "segment size must be between 1 and {} bytes",
                protocol::MAX_DATAGRAM - 512
            )));
        }
        if self.max_disks < MIN_MEMBERS {
            return Err(Error::InvalidArguments(format!(
                "disk table must hold at least {} disks",
                MIN_MEMBERS
            )));
        }
        if self.max_users == 0 {
            return Err(Error::InvalidArguments("user table must hold at least one user".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_oversized_segment_is_rejected() {
        let config = Config {
            segment_size: 65_000,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_attempts_is_rejected() {
        let config = Config {
            attempts: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
