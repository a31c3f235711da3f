//! Coordinator
//!
//! One task owns the [`Registry`]; every request reaches it through a queue
//! and gets its answer on a oneshot channel, so registry operations are
//! serialized without a lock. The UDP server spawns a task per datagram and
//! only ever talks to the registry through a [`CoordinatorHandle`].
//!
//! Clients resend a request when its reply is lost. The registry task keeps
//! the replies to recent state-changing requests keyed by sender and request
//! text, so a resent admission is answered with the original reply instead
//! of being applied twice.

pub mod registry;

pub use registry::{Activity, Disk, DiskState, Registry, Snapshot, StorageGroup};

use crate::protocol::{Command, Reply, MAX_DATAGRAM};
use crate::{Config, Error, Result};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Pending requests the registry task will queue before senders wait
const QUEUE_DEPTH: usize = 256;

/// Replies remembered for resent requests
const REPLAY_CAPACITY: usize = 4096;

enum Request {
    /// A raw control line; answered with the rendered reply datagram
    Line {
        line: String,
        origin: Option<SocketAddr>,
        reply: oneshot::Sender<String>,
    },
    Command {
        command: Command,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
}

/// Cloneable handle to the registry task
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Request>,
}

impl CoordinatorHandle {
    /// Start the registry task
    ///
    /// Replies are replayed to resent requests for as long as a client keeps
    /// resending: `request_timeout * attempts`.
    pub fn spawn(config: &Config) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let registry = Registry::new(config);
        let window = config.request_timeout * config.attempts as u32;
        tokio::spawn(run_registry(registry, ReplayCache::new(window), rx));
        Self { tx }
    }

    /// Answer one control line with the text of its reply datagram
    pub async fn handle_line(&self, line: &str) -> Result<String> {
        self.line(line, None).await
    }

    /// Like [`handle_line`](Self::handle_line) for a datagram from `origin`;
    /// a resend of a recent state-changing request gets the original reply
    pub async fn handle_request(&self, origin: SocketAddr, line: &str) -> Result<String> {
        self.line(line, Some(origin)).await
    }

    async fn line(&self, line: &str, origin: Option<SocketAddr>) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Line {
            line: line.to_string(),
            origin,
            reply,
        })
        .await?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn execute(&self, command: Command) -> Result<Reply> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Command { command, reply }).await?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Snapshot { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    async fn send(&self, request: Request) -> Result<()> {
        self.tx.send(request).await.map_err(|_| stopped())
    }
}

fn stopped() -> Error {
    Error::Protocol("coordinator registry task has stopped".into())
}

/// Rendered replies to recent state-changing requests
struct ReplayCache {
    replies: HashMap<(SocketAddr, String), String>,
    order: VecDeque<(Instant, (SocketAddr, String))>,
    window: Duration,
}

impl ReplayCache {
    fn new(window: Duration) -> Self {
        Self {
            replies: HashMap::new(),
            order: VecDeque::new(),
            window,
        }
    }

    fn get(&mut self, key: &(SocketAddr, String)) -> Option<String> {
        self.expire();
        self.replies.get(key).cloned()
    }

    fn insert(&mut self, key: (SocketAddr, String), text: String) {
        self.expire();
        if self.order.len() == REPLAY_CAPACITY {
            if let Some((_, oldest)) = self.order.pop_front() {
                self.replies.remove(&oldest);
            }
        }
        self.order.push_back((Instant::now(), key.clone()));
        self.replies.insert(key, text);
    }

    fn expire(&mut self) {
        while let Some((at, _)) = self.order.front() {
            if at.elapsed() < self.window {
                break;
            }
            if let Some((_, key)) = self.order.pop_front() {
                self.replies.remove(&key);
            }
        }
    }
}

async fn run_registry(
    mut registry: Registry,
    mut replays: ReplayCache,
    mut rx: mpsc::Receiver<Request>,
) {
    while let Some(request) = rx.recv().await {
        match request {
            Request::Line {
                line,
                origin,
                reply,
            } => {
                let key = origin.map(|src| (src, line.trim().to_string()));
                if let Some(text) = key.as_ref().and_then(|key| replays.get(key)) {
                    debug!("replaying reply to resent {:?}", line.trim());
                    let _ = reply.send(text);
                    continue;
                }

                let text = match line.parse::<Command>() {
                    Ok(command) => {
                        let text = match registry.apply(&command) {
                            Ok(ok) => ok.render(),
                            Err(e) => Reply::render_error(&e),
                        };
                        if let (Some(key), false) = (key, command.is_query()) {
                            replays.insert(key, text.clone());
                        }
                        text
                    }
                    Err(e) => {
                        debug!("rejecting {:?}: {}", line.trim(), e);
                        registry.record_rejected(&line, &e);
                        Reply::render_error(&e)
                    }
                };
                let _ = reply.send(text);
            }
            Request::Command { command, reply } => {
                let _ = reply.send(registry.apply(&command));
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(registry.snapshot());
            }
        }
    }
    debug!("registry task finished");
}

/// UDP front end of the coordinator
#[derive(Debug)]
pub struct CoordinatorServer {
    socket: Arc<UdpSocket>,
    handle: CoordinatorHandle,
}

impl CoordinatorServer {
    pub async fn bind(addr: SocketAddr, handle: CoordinatorHandle) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Coordinator listening on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            handle,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Serve datagrams until the task is dropped
    pub async fn run(self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!("coordinator receive error: {}", e);
                    continue;
                }
            };
            let datagram = buf[..len].to_vec();
            let socket = Arc::clone(&self.socket);
            let handle = self.handle.clone();

            tokio::spawn(async move {
                let text = match String::from_utf8(datagram) {
                    Ok(line) => {
                        debug!("{} -> {:?}", src, line.trim());
                        match handle.handle_request(src, &line).await {
                            Ok(text) => text,
                            Err(e) => {
                                error!("Dropping request from {}: {}", src, e);
                                return;
                            }
                        }
                    }
                    Err(_) => Reply::render_error(&Error::InvalidArguments(
                        "request is not UTF-8".into(),
                    )),
                };
                if let Err(e) = socket.send_to(text.as_bytes(), src).await {
                    error!("Failed to reply to {}: {}", src, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn server() -> (SocketAddr, CoordinatorHandle) {
        let handle = CoordinatorHandle::spawn(&Config::default());
        let server = CoordinatorServer::bind("127.0.0.1:0".parse().unwrap(), handle.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, handle)
    }

    #[tokio::test]
    async fn test_handle_line_renders_replies() {
        let handle = CoordinatorHandle::spawn(&Config::default());
        let ok = handle
            .handle_line("register-disk|D1|127.0.0.1|6000|6001\n")
            .await
            .unwrap();
        assert_eq!(ok, "OK|register-disk|disk=D1\n");

        let dup = handle
            .handle_line("register-disk|D1|127.0.0.1|6000|6001")
            .await
            .unwrap();
        assert!(dup.starts_with("ERR|duplicate-name|"));

        let legacy = handle
            .handle_line("REGISTER DISK D2 127.0.0.1 6002 6003")
            .await
            .unwrap();
        assert!(legacy.starts_with("ERR|invalid-arguments|unknown command"));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.disks.len(), 1);
        assert_eq!(snapshot.history.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_configures_never_share_disks() {
        let handle = CoordinatorHandle::spawn(&Config::default());
        for i in 0..6 {
            handle
                .handle_line(&format!("register-disk|D{}|127.0.0.1|{}|{}", i, 6000 + i, 7000 + i))
                .await
                .unwrap();
        }

        let tasks: Vec<_> = (0..4)
            .map(|g| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    handle
                        .execute(Command::ConfigureDss {
                            name: format!("G{}", g),
                            members: 3,
                            stripe_size: 128,
                        })
                        .await
                })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => granted += 1,
                Err(e) => assert!(matches!(e, Error::InsufficientDisks { .. })),
            }
        }
        assert_eq!(granted, 2);

        let snapshot = handle.snapshot().await.unwrap();
        let mut allocated: Vec<String> = snapshot
            .groups
            .iter()
            .flat_map(|g| g.members.clone())
            .collect();
        allocated.sort();
        allocated.dedup();
        assert_eq!(allocated.len(), 6);
        assert_eq!(snapshot.free_disks(), 0);
    }

    #[tokio::test]
    async fn test_served_over_udp() {
        let (addr, _handle) = server().await;
        let transport = Transport::new(Duration::from_millis(500), 3);

        for i in 1..=3 {
            let line = format!("register-disk|D{}|127.0.0.1|{}|{}", i, 6000 + i, 7000 + i);
            let text = transport.request_text(addr, &line).await.unwrap();
            Reply::parse(&text).unwrap();
        }
        let text = transport
            .request_text(addr, "configure-dss|G|3|1024")
            .await
            .unwrap();
        let view = Reply::parse(&text).unwrap().group_view().unwrap();
        assert_eq!(view.members[2].disk, "D3");
        assert_eq!(view.members[2].cport, 7003);

        let text = transport.request_text(addr, "configure-dss|H|3|1024").await.unwrap();
        assert!(matches!(
            Reply::parse(&text),
            Err(Error::InsufficientDisks { need: 3, have: 0 })
        ));

        let garbage = transport.request(addr, &[0xff, 0x00]).await.unwrap();
        assert!(garbage.starts_with(b"ERR|invalid-arguments"));
    }

    async fn group_with_file(handle: &CoordinatorHandle) {
        for line in [
            "register-disk|D1|127.0.0.1|6001|7001",
            "register-disk|D2|127.0.0.1|6002|7002",
            "register-disk|D3|127.0.0.1|6003|7003",
            "configure-dss|G|3|128",
            "copy|f|10|U1|G",
            "copy-complete|G|f|U1|10",
        ] {
            Reply::parse(&handle.handle_line(line).await.unwrap()).unwrap();
        }
    }

    /// Relay datagrams to `upstream`, dropping the reply to the first request
    /// that starts with `prefix`
    async fn lossy_relay(upstream: SocketAddr, prefix: &'static str) -> SocketAddr {
        let front = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = front.local_addr().unwrap();
        tokio::spawn(async move {
            let mut links: HashMap<SocketAddr, Arc<UdpSocket>> = HashMap::new();
            let drop_next = Arc::new(AtomicBool::new(false));
            let mut armed = true;
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, client) = match front.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(_) => continue,
                };
                if armed && buf[..len].starts_with(prefix.as_bytes()) {
                    armed = false;
                    drop_next.store(true, Ordering::SeqCst);
                }
                let link = match links.get(&client) {
                    Some(link) => Arc::clone(link),
                    None => {
                        let link = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
                        links.insert(client, Arc::clone(&link));
                        let front = Arc::clone(&front);
                        let back = Arc::clone(&link);
                        let drop_next = Arc::clone(&drop_next);
                        tokio::spawn(async move {
                            let mut buf = vec![0u8; MAX_DATAGRAM];
                            while let Ok((len, _)) = back.recv_from(&mut buf).await {
                                if drop_next.swap(false, Ordering::SeqCst) {
                                    continue;
                                }
                                let _ = front.send_to(&buf[..len], client).await;
                            }
                        });
                        link
                    }
                };
                let _ = link.send_to(&buf[..len], upstream).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_resent_request_gets_original_reply() {
        let handle = CoordinatorHandle::spawn(&Config::default());
        group_with_file(&handle).await;
        let client: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:40001".parse().unwrap();

        let first = handle.handle_request(client, "read|G|f|U1").await.unwrap();
        let again = handle.handle_request(client, "read|G|f|U1\n").await.unwrap();
        assert_eq!(first, again);
        assert_eq!(handle.snapshot().await.unwrap().groups[0].active_reads(), 1);

        // the same request from another sender is a new read
        let second = handle.handle_request(other, "read|G|f|U1").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(handle.snapshot().await.unwrap().groups[0].active_reads(), 2);
    }

    #[tokio::test]
    async fn test_lost_read_reply_admits_one_read() {
        let (addr, handle) = server().await;
        group_with_file(&handle).await;
        let relay = lossy_relay(addr, "read|").await;
        let transport = Transport::new(Duration::from_millis(200), 3);

        let text = transport.request_text(relay, "read|G|f|U1").await.unwrap();
        let token: u64 = Reply::parse(&text).unwrap().parsed("token").unwrap();
        assert_eq!(handle.snapshot().await.unwrap().groups[0].active_reads(), 1);

        let text = transport
            .request_text(relay, &format!("read-complete|G|{}", token))
            .await
            .unwrap();
        assert_eq!(Reply::parse(&text).unwrap().parsed::<usize>("reads").unwrap(), 0);

        let text = transport.request_text(relay, "decommission-dss|G").await.unwrap();
        assert_eq!(Reply::parse(&text).unwrap().parsed::<usize>("released").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_lost_admission_replies_are_replayed() {
        let (addr, handle) = server().await;
        for i in 1..=3 {
            let line = format!("register-disk|D{}|127.0.0.1|{}|{}", i, 6000 + i, 7000 + i);
            handle.handle_line(&line).await.unwrap();
        }
        let transport = Transport::new(Duration::from_millis(200), 3);

        let relay = lossy_relay(addr, "configure-dss|").await;
        let text = transport.request_text(relay, "configure-dss|G|3|128").await.unwrap();
        assert_eq!(Reply::parse(&text).unwrap().group_view().unwrap().members.len(), 3);

        let relay = lossy_relay(addr, "copy|").await;
        let text = transport.request_text(relay, "copy|f|10|U1|G").await.unwrap();
        assert!(Reply::parse(&text).is_ok());
        let text = transport.request_text(relay, "copy-complete|G|f|U1|10").await.unwrap();
        assert!(Reply::parse(&text).is_ok());

        let snapshot = handle.snapshot().await.unwrap();
        assert!(!snapshot.groups[0].copy_in_flight());
        assert_eq!(snapshot.groups[0].files.len(), 1);
    }
}
