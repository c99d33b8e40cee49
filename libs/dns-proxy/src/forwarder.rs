//! Upstream forwarding with health-ranked server selection.
//!
//! Each upstream carries an EWMA latency estimate (alpha 0.3, seeded at
//! 50 ms) and a health flag: three consecutive failures mark it
//! unhealthy, a single success heals it. Queries go to the healthy
//! upstream with the lowest estimate; the TXID is randomised towards the
//! upstream and responses are validated against source address and TXID
//! (RFC 5452). Truncated answers retry over TCP.
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use haven_core::prelude::*;

use crate::records::RecordType;
use crate::wire;

const EWMA_ALPHA: f64 = 0.3;
const INITIAL_ESTIMATE_MS: f64 = 50.0;
const UNHEALTHY_AFTER: u32 = 3;
const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct Upstream {
    addr: SocketAddr,
    ewma_ms: f64,
    consecutive_failures: u32,
    healthy: bool,
}

impl Upstream {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            ewma_ms: INITIAL_ESTIMATE_MS,
            consecutive_failures: 0,
            healthy: true,
        }
    }

    fn record_success(&mut self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1_000.0;
        self.ewma_ms = EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * self.ewma_ms;
        self.consecutive_failures = 0;
        self.healthy = true;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= UNHEALTHY_AFTER {
            self.healthy = false;
        }
    }
}

/// Health and latency snapshot for the admin surface.
#[derive(Debug, Clone)]
pub struct UpstreamStatus {
    pub addr: SocketAddr,
    pub ewma_ms: f64,
    pub healthy: bool,
}

/// The upstream pool.
pub struct Forwarder {
    upstreams: Mutex<Vec<Upstream>>,
    query_timeout: Duration,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("upstreams", &self.upstreams.lock().len())
            .finish()
    }
}

/// `1.1.1.1` and `1.1.1.1:53` both parse; bare hosts default to :53.
fn parse_upstream(s: &str) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse() {
        return Some(addr);
    }
    format!("{s}:53").parse().ok()
}

impl Forwarder {
    pub fn new(servers: &[String], query_timeout: Duration) -> Self {
        let upstreams = servers
            .iter()
            .filter_map(|s| match parse_upstream(s) {
                Some(addr) => Some(Upstream::new(addr)),
                None => {
                    warn!(server = %s, "unparseable upstream skipped");
                    None
                }
            })
            .collect();
        Self {
            upstreams: Mutex::new(upstreams),
            query_timeout,
        }
    }

    /// Replace the server list, keeping state for addresses that stay.
    pub fn set_servers(&self, servers: &[String]) {
        let mut pool = self.upstreams.lock();
        let old = std::mem::take(&mut *pool);
        *pool = servers
            .iter()
            .filter_map(|s| parse_upstream(s))
            .map(|addr| {
                old.iter()
                    .find(|u| u.addr == addr)
                    .cloned()
                    .unwrap_or_else(|| Upstream::new(addr))
            })
            .collect();
    }

    pub fn status(&self) -> Vec<UpstreamStatus> {
        self.upstreams
            .lock()
            .iter()
            .map(|u| UpstreamStatus {
                addr: u.addr,
                ewma_ms: u.ewma_ms,
                healthy: u.healthy,
            })
            .collect()
    }

    /// Candidate order: healthy upstreams by ascending latency, then
    /// unhealthy ones as a last resort.
    fn ranked(&self) -> Vec<SocketAddr> {
        let pool = self.upstreams.lock();
        let mut healthy: Vec<&Upstream> = pool.iter().filter(|u| u.healthy).collect();
        healthy.sort_by(|a, b| a.ewma_ms.total_cmp(&b.ewma_ms));
        let mut out: Vec<SocketAddr> = healthy.iter().map(|u| u.addr).collect();
        out.extend(pool.iter().filter(|u| !u.healthy).map(|u| u.addr));
        out
    }

    fn record(&self, addr: SocketAddr, result: Result<Duration>) {
        let mut pool = self.upstreams.lock();
        if let Some(upstream) = pool.iter_mut().find(|u| u.addr == addr) {
            match result {
                Ok(elapsed) => upstream.record_success(elapsed),
                Err(_) => upstream.record_failure(),
            }
        }
    }

    /// Forward raw query bytes. Tries upstreams in rank order; validates
    /// TXID and source; retries truncated answers over TCP. The returned
    /// bytes carry the client's original TXID again.
    pub async fn forward(&self, query_bytes: &[u8]) -> Result<Vec<u8>> {
        if query_bytes.len() < 12 {
            return Err(Error::validation("query too short to forward"));
        }
        let original_txid = u16::from_be_bytes([query_bytes[0], query_bytes[1]]);
        let upstream_txid: u16 = rand::thread_rng().gen();
        let mut upstream_query = query_bytes.to_vec();
        upstream_query[0..2].copy_from_slice(&upstream_txid.to_be_bytes());

        for addr in self.ranked() {
            let started = Instant::now();
            match self
                .forward_udp(&upstream_query, addr, upstream_txid)
                .await
            {
                Ok(mut response) => {
                    self.record(addr, Ok(started.elapsed()));
                    // TC set: the full answer only fits over TCP
                    if response.len() >= 4 && response[2] & 0x02 != 0 {
                        debug!(%addr, "truncated response, retrying over tcp");
                        if let Ok(tcp) = self.forward_tcp(&upstream_query, addr).await {
                            response = tcp;
                        }
                    }
                    response[0..2].copy_from_slice(&original_txid.to_be_bytes());
                    return Ok(response);
                }
                Err(err) => {
                    debug!(%addr, %err, "upstream failed, trying next");
                    metrics::DNS_UPSTREAM_FAILURES.inc();
                    self.record(addr, Err(err));
                }
            }
        }
        Err(Error::PeerUnavailable("all upstreams failed".into()))
    }

    async fn forward_udp(
        &self,
        query: &[u8],
        server: SocketAddr,
        expected_txid: u16,
    ) -> Result<Vec<u8>> {
        let bind: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| Error::PeerUnavailable(format!("binding udp: {e}")))?;
        socket
            .send_to(query, server)
            .await
            .map_err(|e| Error::PeerUnavailable(format!("sending to {server}: {e}")))?;

        let mut buf = vec![0u8; 4096];
        let (len, src) = timeout(self.query_timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::PeerUnavailable(format!("{server} timed out")))?
            .map_err(|e| Error::PeerUnavailable(format!("receiving from {server}: {e}")))?;
        buf.truncate(len);

        // spoofing defences: source address, TXID, QR bit
        if src.ip() != server.ip() {
            return Err(Error::PeerUnavailable(format!(
                "response from unexpected source {src}"
            )));
        }
        if buf.len() < 12 {
            return Err(Error::PeerUnavailable("short response".into()));
        }
        let txid = u16::from_be_bytes([buf[0], buf[1]]);
        if txid != expected_txid {
            return Err(Error::PeerUnavailable("txid mismatch".into()));
        }
        if buf[2] & 0x80 == 0 {
            return Err(Error::PeerUnavailable("response missing qr flag".into()));
        }
        Ok(buf)
    }

    async fn forward_tcp(&self, query: &[u8], server: SocketAddr) -> Result<Vec<u8>> {
        let mut stream = timeout(self.query_timeout, TcpStream::connect(server))
            .await
            .map_err(|_| Error::PeerUnavailable(format!("{server} tcp connect timed out")))?
            .map_err(|e| Error::PeerUnavailable(format!("connecting {server}: {e}")))?;

        let len = (query.len() as u16).to_be_bytes();
        stream
            .write_all(&len)
            .await
            .map_err(|e| Error::PeerUnavailable(e.to_string()))?;
        stream
            .write_all(query)
            .await
            .map_err(|e| Error::PeerUnavailable(e.to_string()))?;

        let mut len_buf = [0u8; 2];
        timeout(self.query_timeout, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| Error::PeerUnavailable("tcp read timed out".into()))?
            .map_err(|e| Error::PeerUnavailable(e.to_string()))?;
        let response_len = u16::from_be_bytes(len_buf) as usize;
        let mut response = vec![0u8; response_len];
        timeout(self.query_timeout, stream.read_exact(&mut response))
            .await
            .map_err(|_| Error::PeerUnavailable("tcp read timed out".into()))?
            .map_err(|e| Error::PeerUnavailable(e.to_string()))?;
        Ok(response)
    }

    /// Probe each upstream with an `NS .` query, refreshing health and
    /// latency estimates.
    pub async fn probe_once(&self) {
        let addrs: Vec<SocketAddr> = self.upstreams.lock().iter().map(|u| u.addr).collect();
        for addr in addrs {
            let id: u16 = rand::thread_rng().gen();
            let query = wire::build_query(id, ".", RecordType::Ns);
            let started = Instant::now();
            let result = self
                .forward_udp(&query, addr, id)
                .await
                .map(|_| started.elapsed());
            let ok = result.is_ok();
            self.record(addr, result);
            debug!(%addr, healthy = ok, "upstream probe");
        }
    }
}

/// Periodic upstream health probe, every ten seconds until cancelled.
pub async fn run_health_probe(forwarder: std::sync::Arc<Forwarder>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(HEALTH_PROBE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => forwarder.probe_once().await,
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fwd(servers: &[&str]) -> Forwarder {
        let servers: Vec<String> = servers.iter().map(|s| s.to_string()).collect();
        Forwarder::new(&servers, Duration::from_millis(200))
    }

    #[test]
    fn parses_bare_hosts_and_ports() {
        let f = fwd(&["1.1.1.1", "9.9.9.9:5353", "not a server"]);
        let status = f.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].addr, "1.1.1.1:53".parse().unwrap());
        assert_eq!(status[1].addr, "9.9.9.9:5353".parse().unwrap());
    }

    #[test]
    fn ranking_prefers_low_latency_healthy() {
        let f = fwd(&["1.1.1.1", "8.8.8.8"]);
        {
            let mut pool = f.upstreams.lock();
            pool[0].record_success(Duration::from_millis(200));
            pool[1].record_success(Duration::from_millis(5));
        }
        let ranked = f.ranked();
        assert_eq!(ranked[0], "8.8.8.8:53".parse().unwrap());
    }

    #[test]
    fn three_failures_unhealthy_one_success_heals() {
        let f = fwd(&["1.1.1.1", "8.8.8.8"]);
        {
            let mut pool = f.upstreams.lock();
            for _ in 0..3 {
                pool[0].record_failure();
            }
            assert!(!pool[0].healthy);
        }
        // unhealthy goes last
        let ranked = f.ranked();
        assert_eq!(ranked.last().unwrap(), &"1.1.1.1:53".parse().unwrap());
        {
            let mut pool = f.upstreams.lock();
            pool[0].record_success(Duration::from_millis(10));
            assert!(pool[0].healthy);
        }
    }

    #[test]
    fn ewma_smooths_towards_samples() {
        let mut u = Upstream::new("1.1.1.1:53".parse().unwrap());
        assert!((u.ewma_ms - 50.0).abs() < f64::EPSILON);
        u.record_success(Duration::from_millis(100));
        // 0.3 * 100 + 0.7 * 50 = 65
        assert!((u.ewma_ms - 65.0).abs() < 0.01);
    }

    #[test]
    fn set_servers_preserves_existing_state() {
        let f = fwd(&["1.1.1.1"]);
        {
            let mut pool = f.upstreams.lock();
            pool[0].record_success(Duration::from_millis(100));
        }
        f.set_servers(&["1.1.1.1".into(), "8.8.8.8".into()]);
        let status = f.status();
        assert_eq!(status.len(), 2);
        assert!((status[0].ewma_ms - 65.0).abs() < 0.01);
        assert!((status[1].ewma_ms - 50.0).abs() < f64::EPSILON);
    }
}
