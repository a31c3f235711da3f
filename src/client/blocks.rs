//! Block transfer against storage nodes
//!
//! Blocks are moved in segments of at most `segment_size` bytes so that a
//! 1 MiB stripe block never needs a datagram larger than the transport
//! allows. Each segment is its own acknowledged exchange.

use crate::protocol::DataFrame;
use crate::storage::BlockKey;
use crate::transport::Transport;
use crate::{Config, Error, Result};
use std::net::SocketAddr;
use tracing::debug;

/// Data-path link used by clients to store and fetch blocks
#[derive(Debug, Clone, Copy)]
pub struct BlockLink {
    transport: Transport,
    segment_size: usize,
}

impl BlockLink {
    pub fn new(transport: Transport, segment_size: usize) -> Self {
        Self {
            transport,
            segment_size: segment_size.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(Transport::from_config(config), config.segment_size)
    }

    /// Store a whole block, segment by segment
    ///
    /// An empty block is still sent so the node holds a zero-length entry.
    pub async fn store(&self, node: SocketAddr, key: &BlockKey, block: &[u8]) -> Result<()> {
        let total = block.len();
        let mut offset = 0;
        loop {
            let end = (offset + self.segment_size).min(total);
            let frame = DataFrame::Store {
                key: key.clone(),
                total,
                offset,
                payload: block[offset..end].to_vec(),
            };
            let length = end - offset;
            self.transport
                .request_matching(node, &frame.encode(), |reply| {
                    matches!(
                        DataFrame::decode(reply),
                        Ok(DataFrame::Stored { key: k, offset: o, length: l })
                            if &k == key && o == offset && l == length
                    )
                })
                .await?;

            offset = end;
            if offset >= total {
                break;
            }
        }
        debug!("stored {} ({} bytes) on {}", key, total, node);
        Ok(())
    }

    /// Fetch a whole block; an absent block comes back empty
    pub async fn fetch(&self, node: SocketAddr, key: &BlockKey) -> Result<Vec<u8>> {
        let mut block = Vec::new();
        let mut announced = None;

        loop {
            let offset = block.len();
            let request = DataFrame::Fetch {
                key: key.clone(),
                offset,
            };
            let reply = self
                .transport
                .request_matching(node, &request.encode(), |reply| {
                    matches!(
                        DataFrame::decode(reply),
                        Ok(DataFrame::Block { key: k, offset: o, .. }) if &k == key && o == offset
                    )
                })
                .await?;

            let (segment_total, payload) = match DataFrame::decode(&reply)? {
                DataFrame::Block { total, payload, .. } => (total, payload),
                other => {
                    return Err(Error::Protocol(format!(
                        "expected a block from {}, got {:?}",
                        node,
                        other.key()
                    )))
                }
            };

            let total = *announced.get_or_insert(segment_total);
            if segment_total != total {
                return Err(Error::Protocol(format!(
                    "{} changed size while being read from {}",
                    key, node
                )));
            }
            if block.len() >= total {
                break;
            }
            if payload.is_empty() {
                return Err(Error::Protocol(format!("{} stalled at {} of {}", key, offset, total)));
            }
            block.extend_from_slice(&payload);
            if block.len() >= total {
                break;
            }
        }

        debug!("fetched {} ({} bytes) from {}", key, block.len(), node);
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskNode;
    use std::sync::Arc;
    use std::time::Duration;

    async fn spawn_node(segment_size: usize) -> Arc<DiskNode> {
        let config = Config {
            segment_size,
            ..Config::default()
        };
        let node = Arc::new(
            DiskNode::bind("D1", "127.0.0.1".parse().unwrap(), 0, 0, &config)
                .await
                .unwrap(),
        );
        tokio::spawn(Arc::clone(&node).serve());
        node
    }

    fn link(segment_size: usize) -> BlockLink {
        BlockLink::new(Transport::new(Duration::from_millis(500), 3), segment_size)
    }

    #[tokio::test]
    async fn test_large_block_moves_in_segments() {
        let node = spawn_node(1000).await;
        let addr = node.data_addr().unwrap();
        let key = BlockKey::new("G", "f", 0, 1, false);
        let block: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

        link(1000).store(addr, &key, &block).await.unwrap();
        let fetched = link(1000).fetch(addr, &key).await.unwrap();
        assert_eq!(fetched, block);
    }

    #[tokio::test]
    async fn test_empty_and_absent_blocks() {
        let node = spawn_node(1000).await;
        let addr = node.data_addr().unwrap();
        let empty = BlockKey::new("G", "f", 1, 2, false);

        link(1000).store(addr, &empty, &[]).await.unwrap();
        assert_eq!(node.store().block_count(), 1);
        assert!(link(1000).fetch(addr, &empty).await.unwrap().is_empty());

        let absent = BlockKey::new("G", "f", 7, 0, true);
        assert!(link(1000).fetch(addr, &absent).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dead_node_is_unreachable() {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let link = BlockLink::new(Transport::new(Duration::from_millis(30), 2), 100);
        let err = link
            .fetch(addr, &BlockKey::new("G", "f", 0, 0, false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerUnreachable(_)));
    }
}
