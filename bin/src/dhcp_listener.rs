//! The DHCPv4 UDP listener. The codec is `dhcproto`; replies go back to
//! the source, or to broadcast when the client has no address yet.
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use dhcproto::v4::Message;
use dhcproto::{Decodable, Decoder, Encodable, Encoder};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lease_engine::{DhcpService, RequestMeta};

const DHCP_CLIENT_PORT: u16 = 68;

/// Bind the server socket with reuse + broadcast, the way a DHCP
/// responder must.
pub async fn bind(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Where the reply goes: unicast to the source when it has a routable
/// address, limited broadcast otherwise (RFC 2131 §4.1).
fn reply_dest(src: SocketAddr, resp: &Message) -> SocketAddr {
    match src {
        SocketAddr::V4(v4) if !v4.ip().is_unspecified() && !resp.giaddr().is_unspecified() => {
            // relayed: back through the relay agent
            SocketAddr::V4(SocketAddrV4::new(resp.giaddr(), v4.port()))
        }
        SocketAddr::V4(v4) if !v4.ip().is_unspecified() => src,
        _ => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)),
    }
}

pub async fn run(
    service: Arc<DhcpService>,
    socket: UdpSocket,
    meta: RequestMeta,
    cancel: CancellationToken,
) {
    info!(addr = ?socket.local_addr().ok(), "dhcp listener up");
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; 1500];
    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                let (len, src) = match recv {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(?err, "dhcp receive failed");
                        continue;
                    }
                };
                let msg = match Message::decode(&mut Decoder::new(&buf[..len])) {
                    Ok(msg) => msg,
                    Err(err) => {
                        debug!(?err, %src, "undecodable dhcp message dropped");
                        continue;
                    }
                };
                let service = Arc::clone(&service);
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    match service.handle(&msg, meta).await {
                        Ok(Some(resp)) => {
                            let mut out = Vec::with_capacity(600);
                            let mut encoder = Encoder::new(&mut out);
                            if let Err(err) = resp.encode(&mut encoder) {
                                warn!(?err, "response encoding failed");
                                return;
                            }
                            let dest = reply_dest(src, &resp);
                            if let Err(err) = socket.send_to(&out, dest).await {
                                debug!(?err, %dest, "dhcp send failed");
                            }
                        }
                        Ok(None) => {}
                        Err(err) => warn!(%err, %src, "dhcp handling failed"),
                    }
                });
            }
            _ = cancel.cancelled() => break,
        }
    }
    info!("dhcp listener stopped");
}
