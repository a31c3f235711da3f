//! Storage node process
//!
//! A node serves its block store on two UDP ports: the data port answers
//! `store`/`fetch` frames, the control port answers `fail`/`status`. Both
//! loops run concurrently and share the store without any extra locking.

use crate::protocol::{Command, DataFrame, NodeCommand, Registration, Reply, MAX_DATAGRAM};
use crate::storage::{MemoryBlockStore, Storage};
use crate::transport::Transport;
use crate::{Config, Error, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

/// Rounds of registration attempts while the coordinator is not answering
const REGISTER_ROUNDS: usize = 5;
const REGISTER_BACKOFF: Duration = Duration::from_millis(500);

/// A storage node bound to its control and data ports
#[derive(Debug)]
pub struct DiskNode {
    name: String,
    ip: IpAddr,
    store: Arc<MemoryBlockStore>,
    control: UdpSocket,
    data: UdpSocket,
    segment_size: usize,
    transport: Transport,
}

impl DiskNode {
    /// Bind both ports on `ip`; a port of 0 picks an ephemeral one
    pub async fn bind(
        name: impl Into<String>,
        ip: IpAddr,
        mport: u16,
        cport: u16,
        config: &Config,
    ) -> Result<Self> {
        let control = UdpSocket::bind(SocketAddr::new(ip, mport)).await?;
        let data = UdpSocket::bind(SocketAddr::new(ip, cport)).await?;
        let node = Self {
            name: name.into(),
            ip,
            store: Arc::new(MemoryBlockStore::new()),
            control,
            data,
            segment_size: config.segment_size,
            transport: Transport::from_config(config),
        };
        info!(
            "Disk {} listening: control {}, data {}",
            node.name,
            node.control_addr()?,
            node.data_addr()?
        );
        Ok(node)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        Ok(self.control.local_addr()?)
    }

    pub fn data_addr(&self) -> Result<SocketAddr> {
        Ok(self.data.local_addr()?)
    }

    /// Shared handle to the node's blocks
    pub fn store(&self) -> Arc<MemoryBlockStore> {
        Arc::clone(&self.store)
    }

    /// What this node announces to the coordinator
    pub fn registration(&self) -> Result<Registration> {
        Ok(Registration::new(
            self.name.clone(),
            self.ip,
            self.control_addr()?.port(),
            self.data_addr()?.port(),
        ))
    }

    /// Register with the coordinator, retrying while it is unreachable
    ///
    /// A `DuplicateName` rejection means an earlier attempt already got
    /// through, so it counts as success.
    pub async fn register(&self, coordinator: SocketAddr) -> Result<()> {
        let line = Command::RegisterDisk(self.registration()?).to_string();
        let mut last = Error::PeerUnreachable(coordinator);

        for round in 1..=REGISTER_ROUNDS {
            match self.send_command(coordinator, &line).await {
                Ok(_) => {
                    info!("Disk {} registered with {}", self.name, coordinator);
                    return Ok(());
                }
                Err(Error::DuplicateName(_)) => {
                    warn!("Disk {} was already registered with {}", self.name, coordinator);
                    return Ok(());
                }
                Err(e @ Error::PeerUnreachable(_)) => {
                    warn!(
                        "Coordinator {} not answering (round {}/{})",
                        coordinator, round, REGISTER_ROUNDS
                    );
                    last = e;
                    tokio::time::sleep(REGISTER_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    pub async fn deregister(&self, coordinator: SocketAddr) -> Result<()> {
        let line = Command::DeregisterDisk {
            name: self.name.clone(),
        }
        .to_string();
        self.send_command(coordinator, &line).await?;
        info!("Disk {} deregistered", self.name);
        Ok(())
    }

    async fn send_command(&self, coordinator: SocketAddr, line: &str) -> Result<Reply> {
        let text = self.transport.request_text(coordinator, line).await?;
        Reply::parse(&text)
    }

    /// Register, serve until Ctrl-C, then deregister
    pub async fn run(self: Arc<Self>, coordinator: SocketAddr) -> Result<()> {
        self.register(coordinator).await?;

        tokio::select! {
            result = Arc::clone(&self).serve() => result?,
            _ = tokio::signal::ctrl_c() => info!("Disk {} shutting down", self.name),
        }

        if let Err(e) = self.deregister(coordinator).await {
            warn!("Disk {} could not deregister: {}", self.name, e);
        }
        Ok(())
    }

    /// Serve both ports until a socket fails
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let data = tokio::spawn(Arc::clone(&self).data_loop());
        let control = tokio::spawn(Arc::clone(&self).control_loop());

        tokio::select! {
            joined = data => joined.map_err(|e| Error::Protocol(format!("data loop ended: {}", e)))?,
            joined = control => joined.map_err(|e| Error::Protocol(format!("control loop ended: {}", e)))?,
        }
    }

    async fn data_loop(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, src) = match self.data.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors from earlier sends land here; keep serving
                    debug!("data port receive error: {}", e);
                    continue;
                }
            };
            if let Some(reply) = self.handle_data(&buf[..len], src) {
                if let Err(e) = self.data.send_to(&reply, src).await {
                    error!("Failed to answer {} on data port: {}", src, e);
                }
            }
        }
    }

    async fn control_loop(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, src) = match self.control.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!("control port receive error: {}", e);
                    continue;
                }
            };
            if let Some(reply) = self.handle_control(&buf[..len], src) {
                if let Err(e) = self.control.send_to(reply.as_bytes(), src).await {
                    error!("Failed to answer {} on control port: {}", src, e);
                }
            }
        }
    }

    /// Serve one data datagram; `None` drops it without a reply
    pub fn handle_data(&self, datagram: &[u8], src: SocketAddr) -> Option<Vec<u8>> {
        let frame = match DataFrame::decode(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping datagram from {}: {}", src, e);
                return None;
            }
        };

        match frame {
            DataFrame::Store {
                key,
                total,
                offset,
                payload,
            } => {
                debug!("store {} [{}+{} of {}]", key, offset, payload.len(), total);
                let length = payload.len();
                if !self.store.store_segment(key.clone(), total, offset, &payload) {
                    warn!("Dropping store of {} from {}: segment out of range", key, src);
                    return None;
                }
                Some(
                    DataFrame::Stored {
                        key,
                        offset,
                        length,
                    }
                    .encode(),
                )
            }
            DataFrame::Fetch { key, offset } => {
                let (total, payload) = self.store.fetch_segment(&key, offset, self.segment_size);
                debug!("fetch {} [{}+{} of {}]", key, offset, payload.len(), total);
                Some(
                    DataFrame::Block {
                        key,
                        total,
                        offset: offset.min(total),
                        payload,
                    }
                    .encode(),
                )
            }
            DataFrame::Stored { .. } | DataFrame::Block { .. } => {
                warn!("Dropping reply frame sent to data port by {}", src);
                None
            }
        }
    }

    /// Serve one control datagram; `None` drops it without a reply
    pub fn handle_control(&self, datagram: &[u8], src: SocketAddr) -> Option<String> {
        let command = std::str::from_utf8(datagram)
            .map_err(|_| Error::Protocol("not UTF-8".into()))
            .and_then(|text| text.parse::<NodeCommand>());

        match command {
            Ok(NodeCommand::Fail) => {
                let blocks = self.store.clear_all();
                warn!("Disk {} failed on request from {}: {} blocks lost", self.name, src, blocks);
                Some(Reply::ok("failed").with("blocks", blocks).render())
            }
            Ok(NodeCommand::Status) => {
                let stats = self.store.stats();
                Some(
                    Reply::ok("status")
                        .with("blocks", stats.blocks)
                        .with("bytes", stats.bytes)
                        .render(),
                )
            }
            Err(e) => {
                warn!("Dropping control datagram from {}: {}", src, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BlockKey;

    async fn node() -> DiskNode {
        DiskNode::bind("D1", "127.0.0.1".parse().unwrap(), 0, 0, &Config::default())
            .await
            .unwrap()
    }

    fn src() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn test_store_then_fetch() {
        let node = node().await;
        let key = BlockKey::new("G", "f", 0, 1, false);
        let store = DataFrame::Store {
            key: key.clone(),
            total: 3,
            offset: 0,
            payload: vec![1, 2, 3],
        };

        let ack = node.handle_data(&store.encode(), src()).unwrap();
        assert_eq!(
            DataFrame::decode(&ack).unwrap(),
            DataFrame::Stored {
                key: key.clone(),
                offset: 0,
                length: 3,
            }
        );

        let fetch = DataFrame::Fetch { key: key.clone(), offset: 0 }.encode();
        let block = node.handle_data(&fetch, src()).unwrap();
        assert_eq!(
            DataFrame::decode(&block).unwrap(),
            DataFrame::Block {
                key,
                total: 3,
                offset: 0,
                payload: vec![1, 2, 3],
            }
        );
    }

    #[tokio::test]
    async fn test_absent_block_fetches_empty() {
        let node = node().await;
        let key = BlockKey::new("G", "f", 9, 0, true);
        let reply = node
            .handle_data(&DataFrame::Fetch { key: key.clone(), offset: 0 }.encode(), src())
            .unwrap();
        assert_eq!(
            DataFrame::decode(&reply).unwrap(),
            DataFrame::Block {
                key,
                total: 0,
                offset: 0,
                payload: vec![],
            }
        );
    }

    #[tokio::test]
    async fn test_garbage_is_dropped() {
        let node = node().await;
        assert!(node.handle_data(b"store|G|f|0", src()).is_none());
        assert!(node.handle_data(b"\xff\xfe", src()).is_none());
        assert!(node.handle_control(b"explode", src()).is_none());
        assert_eq!(node.store().block_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_segment_changes_nothing() {
        let node = node().await;
        let key = BlockKey::new("G", "f", 0, 0, false);
        node.store().store(key.clone(), vec![7; 5]);

        let frame = format!("store|G|f|0|0|0|2|{}|1\nA", usize::MAX);
        assert!(node.handle_data(frame.as_bytes(), src()).is_none());
        assert_eq!(node.store().fetch(&key), Some(vec![7; 5]));
    }

    #[tokio::test]
    async fn test_fail_clears_blocks() {
        let node = node().await;
        node.store().store(BlockKey::new("G", "f", 0, 0, false), vec![1; 8]);
        node.store().store(BlockKey::new("G", "f", 0, 1, true), vec![2; 8]);

        let status = node.handle_control(b"status", src()).unwrap();
        assert_eq!(status, "OK|status|blocks=2|bytes=16\n");

        let failed = node.handle_control(b"fail\n", src()).unwrap();
        assert_eq!(failed, "OK|failed|blocks=2\n");
        assert_eq!(node.store().block_count(), 0);
    }

    #[tokio::test]
    async fn test_served_over_udp() {
        let node = Arc::new(node().await);
        let data = node.data_addr().unwrap();
        let control = node.control_addr().unwrap();
        tokio::spawn(Arc::clone(&node).serve());

        let transport = Transport::new(Duration::from_millis(500), 3);
        let key = BlockKey::new("G", "f", 2, 0, false);
        let store = DataFrame::Store {
            key: key.clone(),
            total: 2,
            offset: 0,
            payload: vec![7, 8],
        };
        transport.request(data, &store.encode()).await.unwrap();

        let status = transport.request_text(control, "status").await.unwrap();
        let reply = Reply::parse(&status).unwrap();
        assert_eq!(reply.parsed::<usize>("blocks").unwrap(), 1);
        assert_eq!(node.store().fetch(&key), Some(vec![7, 8]));
    }

    #[tokio::test]
    async fn test_register_gives_up_on_hard_rejection() {
        let coordinator = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = coordinator.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let (_, from) = coordinator.recv_from(&mut buf).await.unwrap();
                coordinator
                    .send_to(b"ERR|namespace-exhausted|disk", from)
                    .await
                    .unwrap();
            }
        });
        let err = node().await.register(addr).await.unwrap_err();
        assert!(matches!(err, Error::NameSpaceExhausted(_)));
    }

    #[tokio::test]
    async fn test_register_tolerates_duplicate_name() {
        let coordinator = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = coordinator.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, from) = coordinator.recv_from(&mut buf).await.unwrap();
            coordinator.send_to(b"ERR|duplicate-name|D1", from).await.unwrap();
        });
        assert!(node().await.register(addr).await.is_ok());
    }
}
