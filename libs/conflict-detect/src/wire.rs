//! Wire-level probing: ARP requests on the bound interface with an
//! optional ICMP echo fallback, plus gratuitous ARP announcements.
//!
//! A background thread owns the datalink receiver and resolves pending
//! probes through oneshot channels keyed by target address; probe futures
//! just send a request and wait with a timeout.
use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{
    atomic::{AtomicBool, AtomicU16, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pnet::datalink::{self, Channel, DataLinkSender, NetworkInterface};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use socket2::{Domain, Protocol, Type};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use haven_core::prelude::*;

use crate::probe::{ProbeOutcome, ProbeVia, Prober};

const ETH_FRAME_LEN: usize = 42; // ethernet header + ARP payload
const ARP_PACKET_LEN: usize = 28;
const ICMP_TOKEN_LEN: usize = 24;
const RX_POLL: Duration = Duration::from_millis(500);

/// Announce an (ip, mac) binding with gratuitous ARP after ACK.
pub trait ArpAnnouncer: Send + Sync {
    fn announce(&self, ip: Ipv4Addr, mac: MacAddr);
}

/// Announcer used when gratuitous ARP is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAnnouncer;

impl ArpAnnouncer for NullAnnouncer {
    fn announce(&self, _ip: Ipv4Addr, _mac: MacAddr) {}
}

type PendingMap = Arc<Mutex<HashMap<Ipv4Addr, oneshot::Sender<MacAddr>>>>;

/// ARP prober bound to one interface. Dropping it stops the receive
/// thread.
pub struct ArpProber {
    iface_name: String,
    src_mac: MacAddr,
    src_ip: Ipv4Addr,
    tx: Mutex<Box<dyn DataLinkSender>>,
    pending: PendingMap,
    running: Arc<AtomicBool>,
    icmp: Option<IcmpSocket>,
}

impl std::fmt::Debug for ArpProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArpProber")
            .field("iface", &self.iface_name)
            .field("src_ip", &self.src_ip)
            .field("icmp_fallback", &self.icmp.is_some())
            .finish()
    }
}

impl ArpProber {
    /// Open the datalink channel on `iface` and start the reply reader.
    pub fn new(iface: &NetworkInterface, src_ip: Ipv4Addr, icmp_fallback: bool) -> Result<Self> {
        let src_mac = iface
            .mac
            .ok_or_else(|| Error::validation(format!("interface {} has no mac", iface.name)))?;
        let config = datalink::Config {
            read_timeout: Some(RX_POLL),
            ..Default::default()
        };
        let (tx, mut rx) = match datalink::channel(iface, config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => {
                return Err(Error::validation(format!(
                    "unsupported datalink channel on {}",
                    iface.name
                )))
            }
            Err(err) => {
                return Err(Error::validation(format!(
                    "opening datalink channel on {}: {err}",
                    iface.name
                )))
            }
        };

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        let reader_pending = Arc::clone(&pending);
        let reader_running = Arc::clone(&running);
        let iface_name = iface.name.clone();
        let thread_name = format!("arp-rx-{iface_name}");
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                while reader_running.load(Ordering::Relaxed) {
                    match rx.next() {
                        Ok(frame) => {
                            let Some(eth) = EthernetPacket::new(frame) else {
                                continue;
                            };
                            if eth.get_ethertype() != EtherTypes::Arp {
                                continue;
                            }
                            let Some(arp) = ArpPacket::new(eth.payload()) else {
                                continue;
                            };
                            if arp.get_operation() != ArpOperations::Reply {
                                continue;
                            }
                            let ip = arp.get_sender_proto_addr();
                            let mac = arp.get_sender_hw_addr();
                            if let Some(waiter) = reader_pending.lock().remove(&ip) {
                                debug!(%ip, %mac, "arp reply matched pending probe");
                                let _ = waiter.send(mac);
                            }
                        }
                        // read timeout: loop to re-check the running flag
                        Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(err) => {
                            error!(?err, "datalink receive failed, stopping arp reader");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| Error::validation(format!("spawning arp reader: {e}")))?;

        let icmp = if icmp_fallback {
            match IcmpSocket::new() {
                Ok(sock) => Some(sock),
                Err(err) => {
                    warn!(?err, "icmp fallback unavailable, continuing with arp only");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            iface_name,
            src_mac,
            src_ip,
            tx: Mutex::new(tx),
            pending,
            running,
            icmp,
        })
    }

    fn send_arp(
        &self,
        op: pnet::packet::arp::ArpOperation,
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) -> std::io::Result<()> {
        let mut eth_buf = [0u8; ETH_FRAME_LEN];
        let mut arp_buf = [0u8; ARP_PACKET_LEN];
        // buffers are fixed-size and large enough, construction cannot fail
        let mut arp = MutableArpPacket::new(&mut arp_buf).expect("arp buffer sized");
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(op);
        arp.set_sender_hw_addr(sender_mac);
        arp.set_sender_proto_addr(sender_ip);
        arp.set_target_hw_addr(target_mac);
        arp.set_target_proto_addr(target_ip);

        let mut eth = MutableEthernetPacket::new(&mut eth_buf).expect("eth buffer sized");
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(self.src_mac);
        eth.set_ethertype(EtherTypes::Arp);
        eth.set_payload(arp.packet());

        let mut tx = self.tx.lock();
        match tx.send_to(eth.packet(), None) {
            Some(res) => res,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "datalink sender gone",
            )),
        }
    }

    async fn arp_probe(&self, ip: Ipv4Addr, timeout: Duration) -> ProbeOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(ip, reply_tx);
        // always clean the pending slot, even if this future is dropped
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            ip,
        };

        if let Err(err) = self.send_arp(
            ArpOperations::Request,
            self.src_mac,
            self.src_ip,
            MacAddr::zero(),
            ip,
        ) {
            warn!(%ip, ?err, "arp request send failed");
            return ProbeOutcome::Unknown;
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(mac)) => ProbeOutcome::InUse {
                mac: Some(mac),
                via: ProbeVia::Arp,
            },
            // sender dropped: reader thread died
            Ok(Err(_)) => ProbeOutcome::Unknown,
            // silence on the wire means free
            Err(_) => ProbeOutcome::Free,
        }
    }
}

struct PendingGuard {
    pending: PendingMap,
    ip: Ipv4Addr,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.ip);
    }
}

impl Drop for ArpProber {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl Prober for ArpProber {
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> ProbeOutcome {
        match self.arp_probe(ip, timeout).await {
            ProbeOutcome::Free => {
                if let Some(icmp) = &self.icmp {
                    match icmp.echo(ip, timeout).await {
                        Ok(true) => ProbeOutcome::InUse {
                            mac: None,
                            via: ProbeVia::Icmp,
                        },
                        Ok(false) => ProbeOutcome::Free,
                        Err(err) => {
                            warn!(%ip, ?err, "icmp fallback failed");
                            ProbeOutcome::Unknown
                        }
                    }
                } else {
                    ProbeOutcome::Free
                }
            }
            other => other,
        }
    }
}

impl ArpAnnouncer for ArpProber {
    /// Gratuitous ARP: announce the client's fresh binding so upstream
    /// caches converge before the client's own first packet.
    fn announce(&self, ip: Ipv4Addr, mac: MacAddr) {
        if let Err(err) = self.send_arp(ArpOperations::Reply, mac, ip, MacAddr::broadcast(), ip) {
            warn!(%ip, %mac, ?err, "gratuitous arp send failed");
        } else {
            debug!(%ip, %mac, "announced binding with gratuitous arp");
        }
    }
}

/// Blocking ICMPv4 echo socket, used from `spawn_blocking`. DGRAM first
/// (no privileges needed when ping_group_range allows), RAW as fallback.
struct IcmpSocket {
    socket: Arc<socket2::Socket>,
    // RAW sockets deliver the IP header, DGRAM sockets do not
    strip_ip_header: bool,
    seq: AtomicU16,
}

impl IcmpSocket {
    fn new() -> std::io::Result<Self> {
        let (socket, strip_ip_header) =
            match socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)) {
                Ok(s) => (s, false),
                Err(err) => {
                    warn!(?err, "DGRAM icmp socket failed, check ping_group_range. trying RAW");
                    (
                        socket2::Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?,
                        true,
                    )
                }
            };
        Ok(Self {
            socket: Arc::new(socket),
            strip_ip_header,
            seq: AtomicU16::new(1),
        })
    }

    async fn echo(&self, ip: Ipv4Addr, timeout: Duration) -> std::io::Result<bool> {
        let socket = Arc::clone(&self.socket);
        let strip = self.strip_ip_header;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        tokio::task::spawn_blocking(move || echo_blocking(&socket, ip, seq, timeout, strip))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }
}

fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn echo_blocking(
    socket: &socket2::Socket,
    ip: Ipv4Addr,
    seq: u16,
    timeout: Duration,
    strip_ip_header: bool,
) -> std::io::Result<bool> {
    let token: [u8; ICMP_TOKEN_LEN] = rand::random();
    let mut packet = [0u8; 8 + ICMP_TOKEN_LEN];
    packet[0] = 8; // echo request
    packet[4..6].copy_from_slice(&rand::random::<u16>().to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    packet[8..].copy_from_slice(&token);
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    let target = SocketAddr::V4(SocketAddrV4::new(ip, 0));
    socket.send_to(&packet, &target.into())?;

    let deadline = std::time::Instant::now() + timeout;
    let mut buf = [MaybeUninit::<u8>::uninit(); 1024];
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        socket.set_read_timeout(Some(remaining))?;
        let (n, _addr) = match socket.recv_from(&mut buf) {
            Ok(res) => res,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        // the kernel has filled buf[..n]
        let data: &[u8] =
            unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, n) };
        let payload = if strip_ip_header && data.len() > 20 {
            &data[20..]
        } else {
            data
        };
        // echo reply carrying our token
        if payload.len() >= 8 + ICMP_TOKEN_LEN && payload[0] == 0 && payload[8..8 + ICMP_TOKEN_LEN] == token
        {
            return Ok(true);
        }
    }
}

/// Pick the interface to probe on: by name when configured, otherwise
/// the first up, non-loopback interface with an IPv4 address.
pub fn find_interface(name: Option<&str>) -> Result<NetworkInterface> {
    let interfaces = datalink::interfaces();
    let found = match name {
        Some(name) => interfaces.into_iter().find(|i| i.name == name),
        None => interfaces
            .into_iter()
            .find(|i| i.is_up() && !i.is_loopback() && i.ips.iter().any(|ip| ip.is_ipv4())),
    };
    found.ok_or_else(|| Error::validation("no usable interface for probing"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_reference() {
        // echo request header with zeroed checksum field
        let packet = [8u8, 0, 0, 0, 0x12, 0x34, 0, 1];
        let sum = icmp_checksum(&packet);
        // verify by summing with the checksum in place: must fold to zero
        let mut check = packet;
        check[2..4].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(icmp_checksum(&check), 0);
    }

    #[test]
    fn checksum_odd_length() {
        let packet = [8u8, 0, 0, 0, 0, 1, 0, 1, 0xff];
        let sum = icmp_checksum(&packet);
        let mut check = packet;
        check[2..4].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(icmp_checksum(&check), 0);
    }
}
