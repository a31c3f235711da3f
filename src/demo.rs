//! Local cluster
//!
//! Runs a coordinator and a set of storage nodes on loopback inside one
//! process, and walks through the service's main scenarios against it.

use crate::client::Client;
use crate::coordinator::{CoordinatorHandle, CoordinatorServer};
use crate::protocol::{Command, Registration};
use crate::storage::DiskNode;
use crate::{Config, Error, Result, MIN_MEMBERS};
use anyhow::{bail, ensure, Context};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Coordinator plus storage nodes, all served by background tasks
pub struct LocalCluster {
    pub coordinator: SocketAddr,
    pub handle: CoordinatorHandle,
    pub disks: Vec<Arc<DiskNode>>,
    config: Config,
    tasks: Vec<JoinHandle<Result<()>>>,
}

impl LocalCluster {
    /// Start a coordinator and `disks` nodes named D1..Dn, registered in order
    pub async fn start(disks: usize, config: &Config) -> Result<Self> {
        let handle = CoordinatorHandle::spawn(config);
        let server = CoordinatorServer::bind(SocketAddr::new(LOOPBACK, 0), handle.clone()).await?;
        let coordinator = server.local_addr()?;
        let mut tasks = vec![tokio::spawn(server.run())];

        let mut nodes = Vec::with_capacity(disks);
        for i in 1..=disks {
            let node = Arc::new(DiskNode::bind(format!("D{}", i), LOOPBACK, 0, 0, config).await?);
            tasks.push(tokio::spawn(Arc::clone(&node).serve()));
            node.register(coordinator).await?;
            nodes.push(node);
        }

        Ok(Self {
            coordinator,
            handle,
            disks: nodes,
            config: config.clone(),
            tasks,
        })
    }

    /// A client for user `name`; the ports are only recorded, never bound
    pub fn client(&self, name: &str, mport: u16, cport: u16) -> Client {
        Client::new(
            Registration::new(name, LOOPBACK, mport, cport),
            self.coordinator,
            &self.config,
        )
    }

    pub fn disk(&self, name: &str) -> Option<&Arc<DiskNode>> {
        self.disks.iter().find(|d| d.name() == name)
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn step(title: &str) {
    println!("\n== {}", title);
    info!("demo step: {}", title);
}

/// Walk through registration, striping, admission and recovery
pub async fn run(config: &Config, disks: usize) -> anyhow::Result<()> {
    ensure!(disks >= 4, "the demo needs at least 4 disks");
    let cluster = LocalCluster::start(disks, config)
        .await
        .context("starting local cluster")?;
    println!(
        "coordinator on {}, {} disks registered",
        cluster.coordinator,
        cluster.disks.len()
    );

    let u1 = cluster.client("U1", 5001, 5002);
    let u2 = cluster.client("U2", 5003, 5004);
    u1.register().await?;
    u2.register().await?;

    step("configure-dss G with 4 members, 512-byte blocks");
    let view = u1.configure("G", 4, 512).await?;
    let names: Vec<&str> = view.members.iter().map(|m| m.disk.as_str()).collect();
    println!("members: {}", names.join(", "));
    ensure!(names == ["D1", "D2", "D3", "D4"], "members not in registration order");

    step("a group larger than the free pool is refused");
    let free_before = cluster.handle.snapshot().await?.free_disks();
    let want = (free_before + 1).max(MIN_MEMBERS);
    match u1.configure("H", want, 512).await {
        Err(Error::InsufficientDisks { need, have }) => {
            println!("refused: need {}, have {}", need, have)
        }
        other => bail!("expected insufficient disks, got {:?}", other),
    }
    ensure!(
        cluster.handle.snapshot().await?.free_disks() == free_before,
        "a refused configure allocated disks"
    );

    step("copy f (2048 bytes) as U1");
    let data = sample(2048);
    let entry = u1.copy_bytes("G", "f", &data).await?;
    println!("stored {} ({} bytes, owner {})", entry.name, entry.size, entry.owner);

    step("read f back as U1 and as U2");
    ensure!(u1.read_bytes("G", "f").await? == data, "read-back differs");
    println!("U1 read 2048 bytes, identical");
    match u2.read_bytes("G", "f").await {
        Err(e @ Error::NotOwner { .. }) => println!("U2 refused: {}", e),
        other => bail!("expected not-owner, got {:?}", other.map(|d| d.len())),
    }

    step("disk-failure waits for active reads");
    let read = u1
        .command(&Command::Read {
            dss: "G".into(),
            file: "f".into(),
            user: "U1".into(),
        })
        .await?;
    match u1.command(&Command::DiskFailure { dss: "G".into() }).await {
        Err(e @ Error::GroupBusy(_)) => println!("refused while reading: {}", e),
        other => bail!("expected group busy, got {:?}", other.map(|r| r.tag)),
    }
    u1.command(&Command::ReadComplete {
        dss: "G".into(),
        token: read.parsed("token").ok(),
    })
    .await?;

    step("fail a random member and rebuild it from parity");
    let report = u1.fail_and_recover("G", None).await?;
    println!("{}", report);
    ensure!(u1.read_bytes("G", "f").await? == data, "data differs after recovery");
    println!("f still reads back identically");

    step("decommission is refused while a copy is in flight");
    u1.command(&Command::Copy {
        file: "g".into(),
        size: 10,
        owner: "U1".into(),
        dss: "G".into(),
    })
    .await?;
    match u1.decommission("G").await {
        Err(e @ Error::GroupBusy(_)) => println!("refused: {}", e),
        other => bail!("expected group busy, got {:?}", other),
    }
    u1.command(&Command::CopyComplete {
        dss: "G".into(),
        file: "g".into(),
        owner: "U1".into(),
        size: 10,
    })
    .await?;
    let released = u1.decommission("G").await?;
    println!("decommissioned G, {} disks released", released);

    u1.deregister().await?;
    u2.deregister().await?;
    for disk in &cluster.disks {
        disk.deregister(cluster.coordinator).await?;
    }
    println!("\nall scenarios passed");
    Ok(())
}
