//! Datagram request/response exchange
//!
//! Every exchange uses its own ephemeral socket, so a late reply to an
//! earlier attempt can never be mistaken for the answer to a later request.
//! Lost datagrams are retried a bounded number of times; a peer that stays
//! silent is reported as [`Error::PeerUnreachable`].

use crate::protocol::MAX_DATAGRAM;
use crate::{Config, Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Request/response over UDP with timeout and bounded retry
#[derive(Debug, Clone, Copy)]
pub struct Transport {
    timeout: Duration,
    attempts: usize,
}

impl Transport {
    pub fn new(timeout: Duration, attempts: usize) -> Self {
        Self {
            timeout,
            attempts: attempts.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.request_timeout, config.attempts)
    }

    /// Send `payload` and return the first reply from `peer`
    pub async fn request(&self, peer: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
        self.request_matching(peer, payload, |_| true).await
    }

    /// Send `payload` and return the first reply from `peer` that `accept`
    /// takes; anything else arriving on the socket is ignored
    pub async fn request_matching<F>(
        &self,
        peer: SocketAddr,
        payload: &[u8],
        accept: F,
    ) -> Result<Vec<u8>>
    where
        F: Fn(&[u8]) -> bool,
    {
        let socket = UdpSocket::bind(unspecified_for(peer)).await?;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        for attempt in 1..=self.attempts {
            socket.send_to(payload, peer).await?;
            let deadline = Instant::now() + self.timeout;

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match timeout(remaining, socket.recv_from(&mut buf)).await {
                    Ok(Ok((len, from))) if from == peer && accept(&buf[..len]) => {
                        debug!("{} answered in {} attempt(s)", peer, attempt);
                        return Ok(buf[..len].to_vec());
                    }
                    Ok(Ok((_, from))) => {
                        debug!("ignoring stray datagram from {}", from);
                    }
                    // ICMP port unreachable surfaces as a receive error on some
                    // platforms; treat it like silence
                    Ok(Err(e)) => {
                        debug!("receive from {} failed: {}", peer, e);
                        tokio::time::sleep(remaining.min(Duration::from_millis(50))).await;
                        if Instant::now() >= deadline {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }

            if attempt < self.attempts {
                warn!("no reply from {} (attempt {}/{})", peer, attempt, self.attempts);
            }
        }

        Err(Error::PeerUnreachable(peer))
    }

    /// Send a control line and decode the textual reply
    pub async fn request_text(&self, peer: SocketAddr, line: &str) -> Result<String> {
        let reply = self.request(peer, line.as_bytes()).await?;
        String::from_utf8(reply).map_err(|_| Error::Protocol(format!("non UTF-8 reply from {}", peer)))
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

fn unspecified_for(peer: SocketAddr) -> SocketAddr {
    let ip = match peer.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}
